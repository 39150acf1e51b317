//! Unload phase
//!
//! Selection, filtering and batching of records into staged messages:
//! - `interval`: configured mode → store selection
//! - `filter`: VO include/exclude and identity withholding
//! - `batcher`: bounded, ordered messages and the wire format
//! - `usage_record`: XML usage record encoding for detail records
//!
//! Nothing is left staged unless the whole pass succeeded, marker update
//! included.

pub mod batcher;
pub mod filter;
pub mod interval;
pub mod usage_record;

use tracing::{debug, info, warn, Span};

use crate::config::UnloaderConfig;
use crate::error::UnloadError;
use crate::models::{TableKind, UnloadRow};
use crate::outbox::Outbox;
use crate::store::RecordStore;

pub use batcher::{MessageBatcher, MessageKind, OutboundMessage, WireFormat, WireRecord};
pub use filter::{RecordFilter, VoFilter};
pub use interval::{IntervalMode, IntervalSelector};

/// Messages and records produced by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnloadCounts {
    pub messages: usize,
    pub records: usize,
}

impl UnloadCounts {
    fn of(messages: &[OutboundMessage]) -> Self {
        Self {
            messages: messages.len(),
            records: messages.iter().map(|m| m.record_count()).sum(),
        }
    }
}

/// What to unload, resolved from configuration at phase start. Failures here
/// are local configuration mistakes and only skip the unload phase.
#[derive(Debug, Clone)]
pub struct UnloadPlan {
    pub table: TableKind,
    pub selector: IntervalSelector,
    pub format: WireFormat,
}

impl UnloadPlan {
    pub fn from_config(config: &UnloaderConfig) -> Result<Self, UnloadError> {
        let table = TableKind::from_name(&config.table)
            .ok_or_else(|| UnloadError::UnknownCategory(config.table.clone()))?;
        let mode = IntervalMode::parse(
            &config.interval,
            config.gap_start.as_deref(),
            config.gap_end.as_deref(),
        )?;
        let format = if config.send_ur {
            WireFormat::UsageRecord
        } else {
            WireFormat::Blocks
        };
        if format == WireFormat::UsageRecord && table != TableKind::DetailRecords {
            return Err(UnloadError::UnsupportedFormat(table.to_string()));
        }
        Ok(Self {
            table,
            selector: IntervalSelector::new(mode),
            format,
        })
    }
}

/// Runs unload passes against one store and one outbox.
pub struct Unloader<'a> {
    store: &'a mut dyn RecordStore,
    outbox: &'a Outbox,
    filter: RecordFilter,
    batcher: MessageBatcher,
    span: Span,
}

impl<'a> Unloader<'a> {
    pub fn new(
        store: &'a mut dyn RecordStore,
        outbox: &'a Outbox,
        filter: RecordFilter,
        batcher: MessageBatcher,
        span: Span,
    ) -> Self {
        Self {
            store,
            outbox,
            filter,
            batcher,
            span,
        }
    }

    /// Build an unloader from the unloader section of the client config.
    pub fn from_config(
        store: &'a mut dyn RecordStore,
        outbox: &'a Outbox,
        config: &UnloaderConfig,
        source: &str,
        span: Span,
    ) -> Self {
        let vos = VoFilter::from_lists(config.include_vos.as_deref(), config.exclude_vos.as_deref());
        let filter = RecordFilter::new(vos, config.withhold_dns);
        let batcher = MessageBatcher::new(source, config.max_records(), config.max_message_bytes);
        Self::new(store, outbox, filter, batcher, span)
    }

    /// Select, filter, batch and stage one table.
    pub fn unload(&mut self, plan: &UnloadPlan) -> Result<UnloadCounts, UnloadError> {
        let _enter = self.span.clone().entered();
        let selection = plan.selector.selection();
        info!(
            "Will unload from {} ({} interval)",
            plan.table,
            plan.selector.mode().name()
        );

        // Grouping by submitter would leave same-keyed summaries once the
        // identity is scrubbed; fold them in the store instead.
        let rows = if plan.table == TableKind::SummaryRecords && self.filter.withholds_identity() {
            self.store.select_anonymous_summaries(&selection)?
        } else {
            self.store.select_for_unload(plan.table, &selection)?
        };
        // Taken before filtering: rows a filter drops are still "handled".
        let high_water = rows.iter().map(|r| r.revision()).max();
        let selected = rows.len();

        let rows = self.filter.apply(rows);
        debug!(
            "{} rows selected, {} kept after filtering (withhold identity: {})",
            selected,
            rows.len(),
            self.filter.withholds_identity()
        );

        let messages = match plan.format {
            WireFormat::Blocks => self.batcher.batch(MessageKind::for_table(plan.table), &rows),
            WireFormat::UsageRecord => {
                let details: Vec<_> = rows
                    .into_iter()
                    .filter_map(|row| match row {
                        UnloadRow::Detail(record) => Some(record),
                        UnloadRow::Summary(_) => None,
                    })
                    .collect();
                self.batcher.batch_usage_records(&details)?
            }
        };
        let staged = self.outbox.stage_all(&messages)?;

        if plan.selector.mode().advances_marker() {
            if let Some(revision) = high_water {
                if let Err(e) = self.store.mark_unloaded(plan.table, revision) {
                    warn!(
                        "Marker update for {} failed, withdrawing {} staged message(s)",
                        plan.table,
                        staged.len()
                    );
                    self.outbox.discard(&staged);
                    return Err(e.into());
                }
            }
        }

        Ok(UnloadCounts::of(&messages))
    }

    /// Build and stage sync messages from current consolidated state.
    pub fn unload_sync(&mut self) -> Result<UnloadCounts, UnloadError> {
        let _enter = self.span.clone().entered();
        let records = self.store.sync_records()?;
        let messages = self.batcher.batch(MessageKind::Sync, &records);
        self.outbox.stage_all(&messages)?;
        Ok(UnloadCounts::of(&messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::{AccountingRecord, SyncRecord};
    use crate::store::{Selection, SqliteRecordStore};
    use chrono::{TimeZone, Utc};
    use tracing::info_span;

    /// Store whose publication marker cannot be written.
    struct StuckMarker(SqliteRecordStore);

    impl RecordStore for StuckMarker {
        fn test_connection(&self) -> Result<(), StoreError> {
            self.0.test_connection()
        }
        fn load_records(&mut self, records: &[AccountingRecord], source: &str) -> Result<usize, StoreError> {
            self.0.load_records(records, source)
        }
        fn update_spec(&mut self, site: &str, host: &str, spec_type: &str, value: f64) -> Result<(), StoreError> {
            self.0.update_spec(site, host, spec_type, value)
        }
        fn create_local_jobs(&mut self, lrms_server: &str) -> Result<usize, StoreError> {
            self.0.create_local_jobs(lrms_server)
        }
        fn consolidate(&mut self) -> Result<usize, StoreError> {
            self.0.consolidate()
        }
        fn summarise(&mut self) -> Result<usize, StoreError> {
            self.0.summarise()
        }
        fn select_for_unload(&self, kind: TableKind, selection: &Selection) -> Result<Vec<UnloadRow>, StoreError> {
            self.0.select_for_unload(kind, selection)
        }
        fn select_anonymous_summaries(&self, selection: &Selection) -> Result<Vec<UnloadRow>, StoreError> {
            self.0.select_anonymous_summaries(selection)
        }
        fn mark_unloaded(&mut self, _kind: TableKind, _revision: i64) -> Result<(), StoreError> {
            Err(StoreError::Corrupt {
                table: "publish_markers",
                reason: "database is read-only".into(),
            })
        }
        fn sync_records(&self) -> Result<Vec<SyncRecord>, StoreError> {
            self.0.sync_records()
        }
    }

    fn submit(store: &mut SqliteRecordStore, ids: &[(&str, &str)]) {
        let start = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let records: Vec<_> = ids
            .iter()
            .map(|(id, vo)| AccountingRecord {
                entity_id: id.to_string(),
                site: "Site1".into(),
                submit_host: None,
                status: "completed".into(),
                start_time: start,
                wall_duration: 60,
                cpu_duration: 30,
                vo: Some(vo.to_string()),
                vo_group: None,
                vo_role: None,
                global_user_name: Some("/CN=alice".into()),
            })
            .collect();
        store.load_records(&records, "test").unwrap();
        store.consolidate().unwrap();
    }

    fn config(interval: &str) -> UnloaderConfig {
        UnloaderConfig {
            interval: interval.into(),
            max_records_per_message: 2,
            withhold_dns: true,
            exclude_vos: Some(vec!["ops".into()]),
            ..UnloaderConfig::default()
        }
    }

    #[test]
    fn test_latest_unload_stages_and_advances_marker() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path()).unwrap();
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        submit(&mut store, &[("a", "atlas"), ("b", "ops"), ("c", "cms"), ("d", "atlas")]);

        let cfg = config("latest");
        let plan = UnloadPlan::from_config(&cfg).unwrap();
        let mut unloader = Unloader::from_config(&mut store, &outbox, &cfg, "Site1", info_span!("unload"));

        let counts = unloader.unload(&plan).unwrap();
        assert_eq!(counts, UnloadCounts { messages: 2, records: 3 });

        // Second pass finds nothing new, including the filtered-out row.
        let counts = unloader.unload(&plan).unwrap();
        assert_eq!(counts, UnloadCounts::default());

        let staged = outbox.pending().unwrap();
        assert_eq!(staged.len(), 2);
        assert!(staged
            .iter()
            .all(|s| !s.message().body().contains("GlobalUserName")));
    }

    #[test]
    fn test_sync_counts_all_consolidated_records() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path()).unwrap();
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        submit(&mut store, &[("a", "atlas"), ("b", "ops")]);

        let cfg = config("latest");
        let mut unloader = Unloader::from_config(&mut store, &outbox, &cfg, "Site1", info_span!("sync"));
        let counts = unloader.unload_sync().unwrap();
        assert_eq!(counts, UnloadCounts { messages: 1, records: 1 });

        let staged = outbox.pending().unwrap();
        assert!(staged[0].message().body().contains("NumberOfRecords: 2\n"));
    }

    #[test]
    fn test_plan_rejects_unknown_table_and_interval() {
        let mut cfg = config("latest");
        cfg.table = "VJobRecords".into();
        assert!(matches!(
            UnloadPlan::from_config(&cfg),
            Err(UnloadError::UnknownCategory(t)) if t == "VJobRecords"
        ));

        let cfg = config("fortnightly");
        assert!(matches!(
            UnloadPlan::from_config(&cfg),
            Err(UnloadError::UnrecognizedInterval(_))
        ));
    }

    #[test]
    fn test_marker_failure_withdraws_staged_messages() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path()).unwrap();
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        submit(&mut store, &[("a", "atlas"), ("b", "cms")]);
        let mut stuck = StuckMarker(store);

        let cfg = config("latest");
        let plan = UnloadPlan::from_config(&cfg).unwrap();
        let mut unloader = Unloader::from_config(&mut stuck, &outbox, &cfg, "Site1", info_span!("unload"));
        assert!(matches!(
            unloader.unload(&plan),
            Err(UnloadError::Store(StoreError::Corrupt { .. }))
        ));
        assert!(outbox.is_empty().unwrap());

        // Still unpublished, so the next run picks the same rows up once.
        let mut store = stuck.0;
        let mut unloader = Unloader::from_config(&mut store, &outbox, &cfg, "Site1", info_span!("unload"));
        assert_eq!(
            unloader.unload(&plan).unwrap(),
            UnloadCounts { messages: 1, records: 2 }
        );
        assert_eq!(outbox.len().unwrap(), 1);
    }

    #[test]
    fn test_withheld_summaries_fold_submitters() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path()).unwrap();
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap();
        let records: Vec<_> = [("a", "/CN=alice"), ("b", "/CN=bob"), ("c", "/CN=bob")]
            .iter()
            .map(|(id, dn)| AccountingRecord {
                entity_id: id.to_string(),
                site: "Site1".into(),
                submit_host: None,
                status: "completed".into(),
                start_time: start,
                wall_duration: 60,
                cpu_duration: 30,
                vo: Some("atlas".into()),
                vo_group: None,
                vo_role: None,
                global_user_name: Some(dn.to_string()),
            })
            .collect();
        store.load_records(&records, "test").unwrap();
        store.consolidate().unwrap();
        store.summarise().unwrap();

        let mut cfg = config("all");
        cfg.table = "summary".into();
        cfg.exclude_vos = None;
        let plan = UnloadPlan::from_config(&cfg).unwrap();
        let mut unloader = Unloader::from_config(&mut store, &outbox, &cfg, "Site1", info_span!("unload"));
        assert_eq!(
            unloader.unload(&plan).unwrap(),
            UnloadCounts { messages: 1, records: 1 }
        );

        let staged = outbox.pending().unwrap();
        let blocks = staged[0].message().decode().unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains(&("NumberOfRecords".to_string(), "3".to_string())));
        assert!(!blocks[0].iter().any(|(k, _)| k == "GlobalUserName"));
    }

    #[test]
    fn test_usage_record_format_for_details_only() {
        let mut cfg = config("latest");
        cfg.send_ur = true;
        cfg.table = "summary".into();
        assert!(matches!(
            UnloadPlan::from_config(&cfg),
            Err(UnloadError::UnsupportedFormat(t)) if t == "summary"
        ));

        cfg.table = "detail".into();
        let plan = UnloadPlan::from_config(&cfg).unwrap();
        assert_eq!(plan.format, WireFormat::UsageRecord);

        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::open(dir.path()).unwrap();
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        submit(&mut store, &[("a", "atlas"), ("b", "ops"), ("c", "cms")]);
        let mut unloader = Unloader::from_config(&mut store, &outbox, &cfg, "Site1", info_span!("unload"));
        assert_eq!(
            unloader.unload(&plan).unwrap(),
            UnloadCounts { messages: 1, records: 2 }
        );

        let staged = outbox.pending().unwrap();
        let message = staged[0].message();
        assert_eq!(message.format(), WireFormat::UsageRecord);
        assert!(message.body().contains("<urf:LocalJobId>a</urf:LocalJobId>"));
        assert!(!message.body().contains("GlobalUserName"));
    }
}
