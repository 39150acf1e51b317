//! Record store contract
//!
//! The unload pipeline only talks to the store through [`RecordStore`].
//! Consolidation is the store's own atomic upsert: a later submission for
//! the same (entity, site, period) replaces the earlier row.

pub mod sqlite;

use chrono::NaiveDate;

use crate::error::StoreError;
use crate::models::{AccountingRecord, SyncRecord, TableKind, UnloadRow};

pub use sqlite::SqliteRecordStore;

/// Concrete selection request derived from the configured interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Rows written since the table's publication marker
    Unpublished,
    /// Rows measured between two dates, inclusive
    Between { start: NaiveDate, end: NaiveDate },
    All,
}

pub trait RecordStore {
    fn test_connection(&self) -> Result<(), StoreError>;

    /// Stage raw submissions for the next `consolidate`. Returns rows accepted.
    /// A record whose measurement time cannot be computed rejects the batch.
    fn load_records(&mut self, records: &[AccountingRecord], source: &str)
        -> Result<usize, StoreError>;

    /// Record a benchmark value for a host of a site.
    fn update_spec(
        &mut self,
        site: &str,
        host: &str,
        spec_type: &str,
        value: f64,
    ) -> Result<(), StoreError>;

    /// Attribute pending submissions that never went through a gateway to the
    /// batch system head node, so they join its benchmark. Returns how many.
    fn create_local_jobs(&mut self, lrms_server: &str) -> Result<usize, StoreError>;

    /// Fold pending submissions into consolidated records. Returns how many
    /// submissions were applied.
    fn consolidate(&mut self) -> Result<usize, StoreError>;

    /// Rebuild the summary table from consolidated state. Returns row count.
    fn summarise(&mut self) -> Result<usize, StoreError>;

    /// Rows due for publication, ordered by period then identity.
    fn select_for_unload(
        &self,
        kind: TableKind,
        selection: &Selection,
    ) -> Result<Vec<UnloadRow>, StoreError>;

    /// Summary rows with the submitter identity folded away: one row per
    /// (site, period, VO, VO group, VO role), same ordering and selection
    /// rules as [`RecordStore::select_for_unload`].
    fn select_anonymous_summaries(&self, selection: &Selection) -> Result<Vec<UnloadRow>, StoreError>;

    /// Advance the publication marker of a table. Never moves backwards.
    fn mark_unloaded(&mut self, kind: TableKind, revision: i64) -> Result<(), StoreError>;

    /// Consolidated record counts per (site, period), recomputed on each call.
    fn sync_records(&self) -> Result<Vec<SyncRecord>, StoreError>;
}
