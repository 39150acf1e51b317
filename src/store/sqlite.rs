//! SQLite-backed record store
//!
//! Key points:
//! - Submissions land in `submissions` and are folded into
//!   `consolidated_records` by `consolidate`, oldest first
//! - The consolidation key is (entity_id, site, period); a newer submission
//!   replaces the whole row, it is never merged
//! - Summaries and sync counts are recomputed from consolidated state
//! - `publish_markers` remembers the last revision unloaded per table

use std::path::Path;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::{RecordStore, Selection};
use crate::error::StoreError;
use crate::models::{
    AccountingRecord, ConsolidatedRecord, Period, SummaryRecord, SyncRecord, TableKind, UnloadRow,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS submissions (
    submission_id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL,
    site TEXT NOT NULL,
    submit_host TEXT,
    status TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    wall_duration INTEGER NOT NULL,
    cpu_duration INTEGER NOT NULL,
    vo TEXT,
    vo_group TEXT,
    vo_role TEXT,
    global_user_name TEXT,
    source TEXT NOT NULL,
    received_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    consolidated INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_submissions_pending
    ON submissions(consolidated, submission_id);

CREATE TABLE IF NOT EXISTS benchmarks (
    site TEXT NOT NULL,
    host TEXT NOT NULL,
    spec_type TEXT NOT NULL,
    spec_value REAL NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (site, host)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS consolidated_records (
    entity_id TEXT NOT NULL,
    site TEXT NOT NULL,
    period_year INTEGER NOT NULL,
    period_month INTEGER NOT NULL,
    measurement_time INTEGER NOT NULL,
    start_time INTEGER NOT NULL,
    wall_duration INTEGER NOT NULL,
    cpu_duration INTEGER NOT NULL,
    status TEXT NOT NULL,
    vo TEXT,
    vo_group TEXT,
    vo_role TEXT,
    global_user_name TEXT,
    spec_type TEXT,
    spec_value REAL,
    revision INTEGER NOT NULL,
    PRIMARY KEY (entity_id, site, period_year, period_month)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_consolidated_revision
    ON consolidated_records(revision);

CREATE TABLE IF NOT EXISTS summaries (
    site TEXT NOT NULL,
    period_year INTEGER NOT NULL,
    period_month INTEGER NOT NULL,
    vo TEXT,
    vo_group TEXT,
    vo_role TEXT,
    global_user_name TEXT,
    number_of_records INTEGER NOT NULL,
    wall_duration INTEGER NOT NULL,
    cpu_duration INTEGER NOT NULL,
    earliest_measurement INTEGER NOT NULL,
    latest_measurement INTEGER NOT NULL,
    revision INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS publish_markers (
    table_kind TEXT PRIMARY KEY,
    revision INTEGER NOT NULL
) WITHOUT ROWID;
"#;

const CONSOLIDATED_COLUMNS: &str = "entity_id, site, period_year, period_month, measurement_time,
     start_time, wall_duration, cpu_duration, status, vo, vo_group, vo_role,
     global_user_name, spec_type, spec_value, revision";

const SUMMARY_COLUMNS: &str = "site, period_year, period_month, vo, vo_group, vo_role,
     global_user_name, number_of_records, wall_duration, cpu_duration,
     earliest_measurement, latest_measurement, revision";

/// Record store over a single exclusively held SQLite connection.
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)?;
        let store = Self::with_connection(conn)?;
        info!("📊 Record store opened at {}", path.display());
        Ok(store)
    }

    /// Private in-memory store, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            debug!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        Ok(Self { conn })
    }

    fn marker(&self, kind: TableKind) -> Result<i64, StoreError> {
        let revision = self
            .conn
            .query_row(
                "SELECT revision FROM publish_markers WHERE table_kind = ?1",
                params![kind.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(revision.unwrap_or(0))
    }

    fn row_to_consolidated(row: &Row<'_>) -> rusqlite::Result<ConsolidatedRecord> {
        Ok(ConsolidatedRecord {
            entity_id: row.get(0)?,
            site: row.get(1)?,
            period: Period::new(row.get(2)?, row.get(3)?),
            measurement_time: ts_column(row, 4)?,
            start_time: ts_column(row, 5)?,
            wall_duration: row.get(6)?,
            cpu_duration: row.get(7)?,
            status: row.get(8)?,
            vo: row.get(9)?,
            vo_group: row.get(10)?,
            vo_role: row.get(11)?,
            global_user_name: row.get(12)?,
            spec_type: row.get(13)?,
            spec_value: row.get(14)?,
            revision: row.get(15)?,
        })
    }

    fn row_to_summary(row: &Row<'_>) -> rusqlite::Result<SummaryRecord> {
        Ok(SummaryRecord {
            site: row.get(0)?,
            period: Period::new(row.get(1)?, row.get(2)?),
            vo: row.get(3)?,
            vo_group: row.get(4)?,
            vo_role: row.get(5)?,
            global_user_name: row.get(6)?,
            number_of_records: row.get(7)?,
            wall_duration: row.get(8)?,
            cpu_duration: row.get(9)?,
            earliest_measurement: ts_column(row, 10)?,
            latest_measurement: ts_column(row, 11)?,
            revision: row.get(12)?,
        })
    }
}

impl RecordStore for SqliteRecordStore {
    fn test_connection(&self) -> Result<(), StoreError> {
        let one: i64 = self.conn.query_row("SELECT 1", [], |row| row.get(0))?;
        if one != 1 {
            return Err(StoreError::Corrupt {
                table: "sqlite_master",
                reason: format!("connection check returned {}", one),
            });
        }
        Ok(())
    }

    fn load_records(
        &mut self,
        records: &[AccountingRecord],
        source: &str,
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        if let Some(bad) = records.iter().find(|r| r.measurement_time().is_none()) {
            warn!(
                "Rejecting batch from {}: record {} has wall duration {}s",
                source, bad.entity_id, bad.wall_duration
            );
            return Err(StoreError::InvalidRecord {
                entity_id: bad.entity_id.clone(),
                reason: format!(
                    "wall duration {}s from {} has no valid end time",
                    bad.wall_duration, bad.start_time
                ),
            });
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO submissions
                 (entity_id, site, submit_host, status, start_time, wall_duration,
                  cpu_duration, vo, vo_group, vo_role, global_user_name, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for record in records {
                stmt.execute(params![
                    &record.entity_id,
                    &record.site,
                    &record.submit_host,
                    &record.status,
                    record.start_time.timestamp(),
                    record.wall_duration,
                    record.cpu_duration,
                    &record.vo,
                    &record.vo_group,
                    &record.vo_role,
                    &record.global_user_name,
                    source,
                ])?;
            }
        }
        tx.commit()?;

        debug!("📦 Loaded {} records from {}", records.len(), source);
        Ok(records.len())
    }

    fn update_spec(
        &mut self,
        site: &str,
        host: &str,
        spec_type: &str,
        value: f64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO benchmarks (site, host, spec_type, spec_value, updated_at)
             VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'))
             ON CONFLICT(site, host) DO UPDATE SET
                spec_type = excluded.spec_type,
                spec_value = excluded.spec_value,
                updated_at = excluded.updated_at",
            params![site, host, spec_type, value],
        )?;
        Ok(())
    }

    fn create_local_jobs(&mut self, lrms_server: &str) -> Result<usize, StoreError> {
        let created = self.conn.execute(
            "UPDATE submissions SET submit_host = ?1
             WHERE consolidated = 0 AND (submit_host IS NULL OR submit_host = '')",
            params![lrms_server],
        )?;
        if created > 0 {
            info!("Attributed {} local jobs to {}", created, lrms_server);
        }
        Ok(created)
    }

    fn consolidate(&mut self) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;

        let pending: Vec<(i64, AccountingRecord, Option<String>, Option<f64>)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT s.submission_id, s.entity_id, s.site, s.submit_host, s.status,
                        s.start_time, s.wall_duration, s.cpu_duration, s.vo, s.vo_group,
                        s.vo_role, s.global_user_name, b.spec_type, b.spec_value
                 FROM submissions s
                 LEFT JOIN benchmarks b ON b.site = s.site AND b.host = s.submit_host
                 WHERE s.consolidated = 0
                 ORDER BY s.submission_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    AccountingRecord {
                        entity_id: row.get(1)?,
                        site: row.get(2)?,
                        submit_host: row.get(3)?,
                        status: row.get(4)?,
                        start_time: ts_column(row, 5)?,
                        wall_duration: row.get(6)?,
                        cpu_duration: row.get(7)?,
                        vo: row.get(8)?,
                        vo_group: row.get(9)?,
                        vo_role: row.get(10)?,
                        global_user_name: row.get(11)?,
                    },
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, Option<f64>>(13)?,
                ))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        if pending.is_empty() {
            tx.commit()?;
            return Ok(0);
        }

        let mut last_id = 0;
        let mut applied = 0;
        let mut rejected = Vec::new();
        {
            // Submission ids are the revision: the row keeps whichever
            // submission came last, regardless of its contents.
            let mut upsert = tx.prepare_cached(
                "INSERT INTO consolidated_records
                 (entity_id, site, period_year, period_month, measurement_time, start_time,
                  wall_duration, cpu_duration, status, vo, vo_group, vo_role,
                  global_user_name, spec_type, spec_value, revision)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(entity_id, site, period_year, period_month) DO UPDATE SET
                    measurement_time = excluded.measurement_time,
                    start_time = excluded.start_time,
                    wall_duration = excluded.wall_duration,
                    cpu_duration = excluded.cpu_duration,
                    status = excluded.status,
                    vo = excluded.vo,
                    vo_group = excluded.vo_group,
                    vo_role = excluded.vo_role,
                    global_user_name = excluded.global_user_name,
                    spec_type = excluded.spec_type,
                    spec_value = excluded.spec_value,
                    revision = excluded.revision
                 WHERE excluded.revision > consolidated_records.revision",
            )?;

            for (submission_id, record, spec_type, spec_value) in &pending {
                last_id = *submission_id;
                // Rows written before load-time validation existed.
                let Some(measured) = record.measurement_time() else {
                    warn!(
                        "Setting aside submission {} ({}): wall duration {}s has no valid end time",
                        submission_id, record.entity_id, record.wall_duration
                    );
                    rejected.push(*submission_id);
                    continue;
                };
                let period = Period::of(&measured);
                upsert.execute(params![
                    &record.entity_id,
                    &record.site,
                    period.year,
                    period.month,
                    measured.timestamp(),
                    record.start_time.timestamp(),
                    record.wall_duration,
                    record.cpu_duration,
                    &record.status,
                    &record.vo,
                    &record.vo_group,
                    &record.vo_role,
                    &record.global_user_name,
                    spec_type,
                    spec_value,
                    submission_id,
                ])?;
                applied += 1;
            }
        }

        for submission_id in &rejected {
            tx.execute(
                "UPDATE submissions SET consolidated = -1 WHERE submission_id = ?1",
                params![submission_id],
            )?;
        }
        tx.execute(
            "UPDATE submissions SET consolidated = 1
             WHERE consolidated = 0 AND submission_id <= ?1",
            params![last_id],
        )?;
        tx.commit()?;

        debug!(
            "Consolidated {} submissions, set aside {}",
            applied,
            rejected.len()
        );
        Ok(applied)
    }

    fn summarise(&mut self) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM summaries", [])?;
        let rows = tx.execute(
            "INSERT INTO summaries
             (site, period_year, period_month, vo, vo_group, vo_role, global_user_name,
              number_of_records, wall_duration, cpu_duration, earliest_measurement,
              latest_measurement, revision)
             SELECT site, period_year, period_month, vo, vo_group, vo_role, global_user_name,
                    COUNT(*), SUM(wall_duration), SUM(cpu_duration),
                    MIN(measurement_time), MAX(measurement_time), MAX(revision)
             FROM consolidated_records
             GROUP BY site, period_year, period_month, vo, vo_group, vo_role, global_user_name",
            [],
        )?;
        tx.commit()?;
        Ok(rows)
    }

    fn select_for_unload(
        &self,
        kind: TableKind,
        selection: &Selection,
    ) -> Result<Vec<UnloadRow>, StoreError> {
        let (filter, bounds) = match selection {
            Selection::Unpublished => ("revision > ?1", vec![self.marker(kind)?]),
            Selection::All => ("1 = 1", Vec::new()),
            Selection::Between { start, end } => match kind {
                TableKind::DetailRecords => (
                    "measurement_time >= ?1 AND measurement_time < ?2",
                    vec![day_start(*start), day_start(end_exclusive(*end)?)],
                ),
                TableKind::SummaryRecords => (
                    "(period_year * 100 + period_month) BETWEEN ?1 AND ?2",
                    vec![month_key(start), month_key(end)],
                ),
            },
        };

        let rows = match kind {
            TableKind::DetailRecords => {
                let sql = format!(
                    "SELECT {} FROM consolidated_records WHERE {} ORDER BY revision",
                    CONSOLIDATED_COLUMNS, filter
                );
                let mut stmt = self.conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(bounds.iter()), Self::row_to_consolidated)?
                    .map(|r| r.map(UnloadRow::Detail))
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            TableKind::SummaryRecords => {
                let sql = format!(
                    "SELECT {} FROM summaries WHERE {}
                     ORDER BY site, period_year, period_month, vo, vo_group, vo_role,
                              global_user_name",
                    SUMMARY_COLUMNS, filter
                );
                let mut stmt = self.conn.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(bounds.iter()), Self::row_to_summary)?
                    .map(|r| r.map(UnloadRow::Summary))
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        Ok(rows)
    }

    fn select_anonymous_summaries(&self, selection: &Selection) -> Result<Vec<UnloadRow>, StoreError> {
        let kind = TableKind::SummaryRecords;
        let (filter, having, bounds) = match selection {
            Selection::Unpublished => ("1 = 1", "MAX(revision) > ?1", vec![self.marker(kind)?]),
            Selection::All => ("1 = 1", "1 = 1", Vec::new()),
            Selection::Between { start, end } => (
                "(period_year * 100 + period_month) BETWEEN ?1 AND ?2",
                "1 = 1",
                vec![month_key(start), month_key(end)],
            ),
        };

        // Same column order as SUMMARY_COLUMNS so `row_to_summary` applies.
        let sql = format!(
            "SELECT site, period_year, period_month, vo, vo_group, vo_role, NULL,
                    SUM(number_of_records), SUM(wall_duration), SUM(cpu_duration),
                    MIN(earliest_measurement), MAX(latest_measurement), MAX(revision)
             FROM summaries WHERE {}
             GROUP BY site, period_year, period_month, vo, vo_group, vo_role
             HAVING {}
             ORDER BY site, period_year, period_month, vo, vo_group, vo_role",
            filter, having
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bounds.iter()), Self::row_to_summary)?
            .map(|r| r.map(UnloadRow::Summary))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn mark_unloaded(&mut self, kind: TableKind, revision: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO publish_markers (table_kind, revision) VALUES (?1, ?2)
             ON CONFLICT(table_kind) DO UPDATE SET
                revision = MAX(revision, excluded.revision)",
            params![kind.as_str(), revision],
        )?;
        Ok(())
    }

    fn sync_records(&self) -> Result<Vec<SyncRecord>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT site, period_year, period_month, COUNT(*)
             FROM consolidated_records
             GROUP BY site, period_year, period_month
             ORDER BY site, period_year, period_month",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SyncRecord {
                    site: row.get(0)?,
                    period: Period::new(row.get(1)?, row.get(2)?),
                    record_count: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn day_start(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

fn end_exclusive(end: NaiveDate) -> Result<NaiveDate, StoreError> {
    end.succ_opt().ok_or_else(|| {
        warn!("Gap end {} has no successor date", end);
        StoreError::Corrupt {
            table: "consolidated_records",
            reason: format!("gap end {} out of range", end),
        }
    })
}

fn month_key(date: &NaiveDate) -> i64 {
    i64::from(date.year()) * 100 + i64::from(date.month())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(entity: &str, start: DateTime<Utc>, wall: i64, vo: &str) -> AccountingRecord {
        AccountingRecord {
            entity_id: entity.into(),
            site: "Site1".into(),
            submit_host: Some("ce01.site1".into()),
            status: "completed".into(),
            start_time: start,
            wall_duration: wall,
            cpu_duration: wall / 2,
            vo: Some(vo.into()),
            vo_group: None,
            vo_role: None,
            global_user_name: Some("/C=UK/O=eScience/CN=user".into()),
        }
    }

    fn details(rows: Vec<UnloadRow>) -> Vec<ConsolidatedRecord> {
        rows.into_iter()
            .map(|r| match r {
                UnloadRow::Detail(d) => d,
                UnloadRow::Summary(_) => panic!("expected detail row"),
            })
            .collect()
    }

    #[test]
    fn test_consolidate_keeps_latest_submission() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();

        store
            .load_records(&[record("vm-1", start, 500, "atlas")], "test")
            .unwrap();
        store
            .load_records(&[record("vm-1", start, 100, "atlas")], "test")
            .unwrap();
        assert_eq!(store.consolidate().unwrap(), 2);
        // Nothing left pending.
        assert_eq!(store.consolidate().unwrap(), 0);

        let rows = details(
            store
                .select_for_unload(TableKind::DetailRecords, &Selection::All)
                .unwrap(),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].wall_duration, 100);
        assert_eq!(rows[0].revision, 2);
    }

    #[test]
    fn test_benchmark_joined_on_consolidate() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        store.update_spec("Site1", "ce01.site1", "HEPSPEC", 10.5).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        store
            .load_records(&[record("job-1", start, 60, "cms")], "test")
            .unwrap();
        store.consolidate().unwrap();

        let rows = details(
            store
                .select_for_unload(TableKind::DetailRecords, &Selection::All)
                .unwrap(),
        );
        assert_eq!(rows[0].spec_type.as_deref(), Some("HEPSPEC"));
        assert_eq!(rows[0].spec_value, Some(10.5));
    }

    #[test]
    fn test_unpublished_selection_follows_marker() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        store
            .load_records(
                &[record("a", start, 10, "atlas"), record("b", start, 10, "atlas")],
                "test",
            )
            .unwrap();
        store.consolidate().unwrap();

        let first = store
            .select_for_unload(TableKind::DetailRecords, &Selection::Unpublished)
            .unwrap();
        assert_eq!(first.len(), 2);
        store.mark_unloaded(TableKind::DetailRecords, 2).unwrap();
        // Markers never move backwards.
        store.mark_unloaded(TableKind::DetailRecords, 1).unwrap();

        store
            .load_records(&[record("a", start, 20, "atlas")], "test")
            .unwrap();
        store.consolidate().unwrap();

        let second = details(
            store
                .select_for_unload(TableKind::DetailRecords, &Selection::Unpublished)
                .unwrap(),
        );
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].entity_id, "a");
        assert_eq!(second[0].wall_duration, 20);
    }

    #[test]
    fn test_gap_selection_is_inclusive() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let records = [
            record("feb", Utc.with_ymd_and_hms(2024, 2, 28, 10, 0, 0).unwrap(), 0, "atlas"),
            record("mar1", Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(), 0, "atlas"),
            record("mar31", Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap(), 0, "atlas"),
            record("apr", Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(), 0, "atlas"),
        ];
        store.load_records(&records, "test").unwrap();
        store.consolidate().unwrap();

        let selection = Selection::Between {
            start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        };
        let ids: Vec<String> = details(
            store
                .select_for_unload(TableKind::DetailRecords, &selection)
                .unwrap(),
        )
        .into_iter()
        .map(|r| r.entity_id)
        .collect();
        assert_eq!(ids, vec!["mar1", "mar31"]);
    }

    #[test]
    fn test_summaries_and_sync_are_recomputed() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap();
        store
            .load_records(
                &[
                    record("a", start, 100, "atlas"),
                    record("b", start, 300, "atlas"),
                    record("c", start, 50, "cms"),
                ],
                "test",
            )
            .unwrap();
        store.consolidate().unwrap();
        assert_eq!(store.summarise().unwrap(), 2);

        let summaries = store
            .select_for_unload(TableKind::SummaryRecords, &Selection::All)
            .unwrap();
        let atlas = summaries
            .iter()
            .find_map(|r| match r {
                UnloadRow::Summary(s) if s.vo.as_deref() == Some("atlas") => Some(s.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(atlas.number_of_records, 2);
        assert_eq!(atlas.wall_duration, 400);

        // Resubmitting an existing key must not inflate the counts.
        store
            .load_records(&[record("a", start, 120, "atlas")], "test")
            .unwrap();
        store.consolidate().unwrap();
        assert_eq!(store.summarise().unwrap(), 2);

        let sync = store.sync_records().unwrap();
        assert_eq!(sync.len(), 1);
        assert_eq!(sync[0].period, Period::new(2024, 5));
        assert_eq!(sync[0].record_count, 3);
    }

    #[test]
    fn test_unrepresentable_duration_rejected_at_load() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let batch = [
            record("ok", start, 60, "atlas"),
            record("huge", start, i64::MAX / 100, "atlas"),
        ];

        match store.load_records(&batch, "test") {
            Err(StoreError::InvalidRecord { entity_id, .. }) => assert_eq!(entity_id, "huge"),
            other => panic!("expected rejected record, got {:?}", other),
        }
        // The whole batch is refused.
        assert_eq!(store.consolidate().unwrap(), 0);
    }

    #[test]
    fn test_consolidate_sets_aside_unrepresentable_rows() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        // Written behind the store's back, as an older client could have.
        store
            .conn
            .execute(
                "INSERT INTO submissions
                 (entity_id, site, status, start_time, wall_duration, cpu_duration, source)
                 VALUES ('huge', 'Site1', 'completed', ?1, ?2, 0, 'legacy')",
                params![start.timestamp(), i64::MAX / 100],
            )
            .unwrap();
        store
            .load_records(&[record("ok", start, 60, "atlas")], "test")
            .unwrap();

        assert_eq!(store.consolidate().unwrap(), 1);
        // The bad row is not picked up again on the next run.
        assert_eq!(store.consolidate().unwrap(), 0);

        let rows = details(
            store
                .select_for_unload(TableKind::DetailRecords, &Selection::All)
                .unwrap(),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, "ok");
    }

    #[test]
    fn test_local_jobs_join_the_lrms_benchmark() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let mut local = record("local-1", start, 60, "atlas");
        local.submit_host = None;
        store
            .load_records(&[local, record("grid-1", start, 60, "atlas")], "test")
            .unwrap();

        store.update_spec("Site1", "lrms.site1", "HEPSPEC", 9.5).unwrap();
        assert_eq!(store.create_local_jobs("lrms.site1").unwrap(), 1);
        store.consolidate().unwrap();

        let rows = details(
            store
                .select_for_unload(TableKind::DetailRecords, &Selection::All)
                .unwrap(),
        );
        let local = rows.iter().find(|r| r.entity_id == "local-1").unwrap();
        assert_eq!(local.spec_value, Some(9.5));
        let grid = rows.iter().find(|r| r.entity_id == "grid-1").unwrap();
        assert_eq!(grid.spec_value, None);
    }

    #[test]
    fn test_anonymous_summaries_fold_submitters() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap();
        let by = |entity: &str, dn: &str, wall: i64| {
            let mut r = record(entity, start, wall, "atlas");
            r.global_user_name = Some(dn.into());
            r
        };
        store
            .load_records(
                &[by("a", "/CN=alice", 100), by("b", "/CN=bob", 200), by("c", "/CN=bob", 300)],
                "test",
            )
            .unwrap();
        store.consolidate().unwrap();
        assert_eq!(store.summarise().unwrap(), 2);

        let folded = store.select_anonymous_summaries(&Selection::All).unwrap();
        assert_eq!(folded.len(), 1);
        let UnloadRow::Summary(summary) = &folded[0] else {
            panic!("expected summary row");
        };
        assert_eq!(summary.global_user_name, None);
        assert_eq!(summary.number_of_records, 3);
        assert_eq!(summary.wall_duration, 600);

        // After publishing, a new job for one submitter republishes the
        // whole group, not just that submitter's share.
        store.mark_unloaded(TableKind::SummaryRecords, summary.revision).unwrap();
        assert!(store
            .select_anonymous_summaries(&Selection::Unpublished)
            .unwrap()
            .is_empty());
        store
            .load_records(&[by("d", "/CN=alice", 50)], "test")
            .unwrap();
        store.consolidate().unwrap();
        store.summarise().unwrap();

        let again = store.select_anonymous_summaries(&Selection::Unpublished).unwrap();
        assert_eq!(again.len(), 1);
        let UnloadRow::Summary(summary) = &again[0] else {
            panic!("expected summary row");
        };
        assert_eq!(summary.number_of_records, 4);
    }
}
