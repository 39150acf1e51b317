//! Accounting data model
//!
//! Raw submissions, the store's consolidated view, aggregates and the closed
//! set of unloadable tables.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Raw usage observation as submitted by an ingestion path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingRecord {
    /// Natural identity within a site (job id, VM uuid, ...)
    pub entity_id: String,
    pub site: String,
    /// Host the work ran behind; used to join benchmark values
    #[serde(default)]
    pub submit_host: Option<String>,
    pub status: String,
    pub start_time: DateTime<Utc>,
    /// Wall-clock seconds
    pub wall_duration: i64,
    /// CPU seconds
    #[serde(default)]
    pub cpu_duration: i64,
    #[serde(default)]
    pub vo: Option<String>,
    #[serde(default)]
    pub vo_group: Option<String>,
    #[serde(default)]
    pub vo_role: Option<String>,
    /// Distinguished name of the submitting user
    #[serde(default)]
    pub global_user_name: Option<String>,
}

impl AccountingRecord {
    /// End of the measurement window (`start_time + wall_duration`).
    /// `None` when the duration is negative or the end is not representable.
    pub fn measurement_time(&self) -> Option<DateTime<Utc>> {
        if self.wall_duration < 0 {
            return None;
        }
        Duration::try_seconds(self.wall_duration)
            .and_then(|wall| self.start_time.checked_add_signed(wall))
    }

    pub fn period(&self) -> Option<Period> {
        self.measurement_time().map(|ts| Period::of(&ts))
    }
}

/// Reporting period bucket: one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn of(ts: &DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Canonical entry for one (entity, site, period). The most recent
/// submission for the key wins outright.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedRecord {
    pub entity_id: String,
    pub site: String,
    pub period: Period,
    pub measurement_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub wall_duration: i64,
    pub cpu_duration: i64,
    pub status: String,
    pub vo: Option<String>,
    pub vo_group: Option<String>,
    pub vo_role: Option<String>,
    pub global_user_name: Option<String>,
    pub spec_type: Option<String>,
    pub spec_value: Option<f64>,
    /// Submission sequence that last wrote this row
    pub revision: i64,
}

/// Aggregate of consolidated records per site, period and owner.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub site: String,
    pub period: Period,
    pub vo: Option<String>,
    pub vo_group: Option<String>,
    pub vo_role: Option<String>,
    pub global_user_name: Option<String>,
    pub number_of_records: i64,
    pub wall_duration: i64,
    pub cpu_duration: i64,
    pub earliest_measurement: DateTime<Utc>,
    pub latest_measurement: DateTime<Utc>,
    pub revision: i64,
}

/// Number of consolidated records per (site, period), used by the collector
/// to check completeness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub site: String,
    pub period: Period,
    pub record_count: i64,
}

/// Tables the unloader can publish from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    DetailRecords,
    SummaryRecords,
}

/// Config name → table. Anything else is an unknown category.
const TABLE_NAMES: &[(&str, TableKind)] = &[
    ("detail", TableKind::DetailRecords),
    ("summary", TableKind::SummaryRecords),
];

impl TableKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        TABLE_NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, kind)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DetailRecords => "detail",
            Self::SummaryRecords => "summary",
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row selected for unload from either table.
#[derive(Debug, Clone, PartialEq)]
pub enum UnloadRow {
    Detail(ConsolidatedRecord),
    Summary(SummaryRecord),
}

impl UnloadRow {
    pub fn vo(&self) -> Option<&str> {
        match self {
            Self::Detail(r) => r.vo.as_deref(),
            Self::Summary(r) => r.vo.as_deref(),
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            Self::Detail(r) => r.revision,
            Self::Summary(r) => r.revision,
        }
    }

    /// Drop every field that identifies an individual submitter.
    pub fn withhold_identity(&mut self) {
        match self {
            Self::Detail(r) => r.global_user_name = None,
            Self::Summary(r) => r.global_user_name = None,
        }
    }
}
