//! Phase orchestration
//!
//! Phases run in a fixed order. Each one is isolated: a failure is reported
//! and the next phase still runs, except that transport only runs after an
//! enabled unload phase succeeded. Summarise and sync run on every invocation.
//!
//! | Phase       | Gate                    | Store call(s)            |
//! |-------------|-------------------------|--------------------------|
//! | spec_update | `spec_updater.enabled`  | `update_spec`            |
//! | join        | `joiner.enabled`        | `consolidate` (+ local)  |
//! | summarise   | always                  | `summarise`              |
//! | unload      | `unloader.enabled`      | `select_for_unload`, ... |
//! | sync        | always                  | `sync_records`           |
//! | transport   | `sender.enabled`, unload ok | none, drains the outbox |

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::broker::{BrokerResolver, DirectoryService};
use crate::config::{ClientConfig, SenderConfig};
use crate::error::{ConfigError, TransportError, UnloadError};
use crate::outbox::Outbox;
use crate::report::{Phase, Reporter, RunReport};
use crate::store::RecordStore;
use crate::transport::{Connector, TransportSecurity, TransportSession};
use crate::unload::{UnloadCounts, UnloadPlan, Unloader};

/// Transport settings resolved at startup.
#[derive(Debug, Clone)]
struct TransportSetup {
    resolver: BrokerResolver,
    security: TransportSecurity,
    destination: String,
    outbox_dir: PathBuf,
}

/// What one run produced, alongside the per-phase report.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub report: RunReport,
    pub unloaded: Option<UnloadCounts>,
    pub synced: Option<UnloadCounts>,
    /// Messages the broker confirmed, when transport got as far as sending
    pub delivered: Option<usize>,
}

pub struct Pipeline<'a> {
    client: &'a ClientConfig,
    transport: Option<TransportSetup>,
}

impl<'a> Pipeline<'a> {
    /// Resolve everything that must be right before any phase runs. The
    /// sender config is only needed when the sender is enabled.
    pub fn new(client: &'a ClientConfig, sender: Option<&SenderConfig>) -> Result<Self, ConfigError> {
        client.validate()?;

        let transport = if client.sender.enabled {
            let sender = sender.ok_or(ConfigError::Missing("sender configuration"))?;
            sender.validate()?;
            let resolver = BrokerResolver::new(&sender.broker)?;
            let destination = sender.messaging.destination()?.to_string();
            let security = sender.certificates.security()?;
            if security == TransportSecurity::Unencrypted {
                warn!("Encryption disabled: messages will be sent without TLS or client credentials");
            }
            match sender.certificates.server_certificate()? {
                Some(path) => warn!(
                    "Server certificate {} checked; message bodies are not encrypted to it and \
                     rely on the TLS session alone",
                    path.display()
                ),
                None => info!("No server certificate supplied. Will not encrypt messages."),
            }

            let staging_dir = client.unloader.outbox_dir();
            let outbox_dir = sender.messaging.path.clone().unwrap_or(staging_dir.clone());
            if outbox_dir != staging_dir {
                warn!(
                    "messaging.path {} differs from the unloader outbox {}: \
                     newly unloaded messages will not be sent by this client",
                    outbox_dir.display(),
                    staging_dir.display()
                );
            }
            Some(TransportSetup {
                resolver,
                security,
                destination,
                outbox_dir,
            })
        } else {
            None
        };

        Ok(Self { client, transport })
    }

    /// Directory service URL, when brokers are found by network lookup.
    pub fn directory_url(&self) -> Option<&str> {
        self.transport.as_ref()?.resolver.directory_url()
    }

    /// Outbox the transport phase drains, when the sender is enabled.
    pub fn transport_outbox(&self) -> Option<&Path> {
        self.transport.as_ref().map(|t| t.outbox_dir.as_path())
    }

    /// Whether transport drains the same outbox the unloader stages into.
    pub fn drains_staging_outbox(&self) -> bool {
        self.transport_outbox()
            .map_or(true, |dir| dir == self.client.unloader.outbox_dir().as_path())
    }

    pub fn run(
        &self,
        store: &mut dyn RecordStore,
        directory: &dyn DirectoryService,
        connector: &dyn Connector,
    ) -> RunSummary {
        let mut reporter = Reporter::start();

        self.spec_update(store, &mut reporter);
        self.join(store, &mut reporter);
        self.summarise(store, &mut reporter);

        let unloaded = self.unload(store, &mut reporter);
        let synced = self.sync(store, &mut reporter);

        let delivered = match (&self.transport, &unloaded) {
            (None, _) => {
                reporter.skipped(Phase::Transport, "sender disabled");
                None
            }
            (Some(_), UnloadStatus::Disabled) => {
                reporter.skipped(Phase::Transport, "unloader disabled");
                None
            }
            (Some(_), UnloadStatus::Failed) => {
                reporter.skipped(Phase::Transport, "unload phase failed");
                None
            }
            (Some(setup), UnloadStatus::Done(_)) => {
                self.transport(setup, directory, connector, &mut reporter)
            }
        };

        RunSummary {
            report: reporter.finish(),
            unloaded: unloaded.counts(),
            synced,
            delivered,
        }
    }

    fn spec_update(&self, store: &mut dyn RecordStore, reporter: &mut Reporter) {
        let config = &self.client.spec_updater;
        if !config.enabled {
            reporter.skipped(Phase::SpecUpdate, "disabled");
            return;
        }
        let _span = reporter.phase_span(Phase::SpecUpdate).entered();
        let site = self.client.source_name();

        let mut updated = 0;
        for entry in &config.benchmarks {
            if let Err(e) = store.update_spec(site, &entry.host, &entry.spec_type, entry.value) {
                reporter.failed(Phase::SpecUpdate, &e);
                return;
            }
            updated += 1;
        }
        reporter.completed(Phase::SpecUpdate, format!("{} benchmark(s) recorded", updated));
    }

    fn join(&self, store: &mut dyn RecordStore, reporter: &mut Reporter) {
        if !self.client.joiner.enabled {
            reporter.skipped(Phase::Join, "disabled");
            return;
        }
        let _span = reporter.phase_span(Phase::Join).entered();

        let mut local = 0;
        if let Some(jobs) = self.client.local_jobs() {
            let site = self.client.source_name();
            info!(
                "Updating benchmark information for local jobs: {}, {}, {}, {}",
                site, jobs.lrms_server, jobs.spec_type, jobs.spec_value
            );
            let created = store
                .update_spec(site, jobs.lrms_server, jobs.spec_type, jobs.spec_value)
                .and_then(|()| store.create_local_jobs(jobs.lrms_server));
            match created {
                Ok(n) => local = n,
                Err(e) => {
                    reporter.failed(Phase::Join, &e);
                    return;
                }
            }
        }

        match store.consolidate() {
            Ok(n) => reporter.completed(
                Phase::Join,
                format!("{} submission(s) consolidated, {} local job(s)", n, local),
            ),
            Err(e) => reporter.failed(Phase::Join, &e),
        }
    }

    fn summarise(&self, store: &mut dyn RecordStore, reporter: &mut Reporter) {
        let _span = reporter.phase_span(Phase::Summarise).entered();
        match store.summarise() {
            Ok(n) => reporter.completed(Phase::Summarise, format!("{} summary row(s)", n)),
            Err(e) => reporter.failed(Phase::Summarise, &e),
        }
    }

    fn open_outbox(&self) -> std::io::Result<Outbox> {
        Outbox::open(self.client.unloader.outbox_dir())
    }

    fn unload(&self, store: &mut dyn RecordStore, reporter: &mut Reporter) -> UnloadStatus {
        let config = &self.client.unloader;
        if !config.enabled {
            reporter.skipped(Phase::Unload, "disabled");
            return UnloadStatus::Disabled;
        }

        let span = reporter.phase_span(Phase::Unload);
        let result = UnloadPlan::from_config(config).and_then(|plan| {
            let outbox = self.open_outbox()?;
            let mut unloader =
                Unloader::from_config(store, &outbox, config, self.client.source_name(), span);
            unloader.unload(&plan)
        });

        match result {
            Ok(counts) => {
                reporter.completed(
                    Phase::Unload,
                    format!("{} message(s), {} record(s)", counts.messages, counts.records),
                );
                UnloadStatus::Done(counts)
            }
            Err(e) => {
                reporter.failed(Phase::Unload, &e);
                UnloadStatus::Failed
            }
        }
    }

    fn sync(&self, store: &mut dyn RecordStore, reporter: &mut Reporter) -> Option<UnloadCounts> {
        let span = reporter.phase_span(Phase::Sync);
        let result = self.open_outbox().map_err(UnloadError::Staging).and_then(|outbox| {
            let mut unloader = Unloader::from_config(
                store,
                &outbox,
                &self.client.unloader,
                self.client.source_name(),
                span,
            );
            unloader.unload_sync()
        });

        match result {
            Ok(counts) => {
                reporter.completed(
                    Phase::Sync,
                    format!("{} message(s), {} record(s)", counts.messages, counts.records),
                );
                Some(counts)
            }
            Err(e) => {
                reporter.failed(Phase::Sync, &e);
                None
            }
        }
    }

    fn transport(
        &self,
        setup: &TransportSetup,
        directory: &dyn DirectoryService,
        connector: &dyn Connector,
        reporter: &mut Reporter,
    ) -> Option<usize> {
        let _span = reporter.phase_span(Phase::Transport).entered();

        let outbox = match Outbox::open(&setup.outbox_dir) {
            Ok(outbox) => outbox,
            Err(e) => {
                reporter.failed(Phase::Transport, &format!("cannot open outbox: {}", e));
                return None;
            }
        };
        let pending = match outbox.pending() {
            Ok(pending) => pending,
            Err(e) => {
                reporter.failed(Phase::Transport, &format!("cannot read outbox: {}", e));
                return None;
            }
        };
        if pending.is_empty() {
            reporter.completed(Phase::Transport, "nothing to send");
            return Some(0);
        }

        let brokers = match setup.resolver.resolve(directory) {
            Ok(brokers) => brokers,
            Err(e) => {
                reporter.failed(Phase::Transport, &format!("broker lookup failed: {}", e));
                return None;
            }
        };

        let mut session =
            match TransportSession::new(connector, &setup.destination, setup.security.clone()) {
                Ok(session) => session,
                Err(e) => {
                    reporter.failed(Phase::Transport, &e);
                    return None;
                }
            };

        let endpoint = match session.connect(&brokers) {
            Ok(endpoint) => endpoint.to_string(),
            Err(e) => {
                reporter.failed(Phase::Transport, &e);
                return None;
            }
        };
        info!("Sending {} staged message(s) to {}", pending.len(), endpoint);

        let result = session.send_all(pending.iter().map(|s| s.message()), |message| {
            // Messages are matched back by id; delivery order equals outbox order.
            if let Some(staged) = pending.iter().find(|s| s.message().id() == message.id()) {
                if let Err(e) = outbox.remove(staged) {
                    warn!(
                        "Message {} delivered but could not be removed from {}: {}",
                        message.id(),
                        staged.path().display(),
                        e
                    );
                }
            }
        });

        if let Err(e) = session.close() {
            warn!("Error closing broker session: {}", e);
        }

        match result {
            Ok(sent) => {
                reporter.completed(Phase::Transport, format!("{} message(s) sent to {}", sent, endpoint));
                Some(sent)
            }
            Err(e) => {
                reporter.failed(Phase::Transport, &e);
                match e {
                    TransportError::Send { delivered, .. } => Some(delivered),
                    _ => None,
                }
            }
        }
    }
}

/// Unload phase result as seen by the later phases.
#[derive(Debug, Clone, Copy)]
enum UnloadStatus {
    Disabled,
    Done(UnloadCounts),
    Failed,
}

impl UnloadStatus {
    fn counts(&self) -> Option<UnloadCounts> {
        match self {
            Self::Done(counts) => Some(*counts),
            Self::Disabled | Self::Failed => None,
        }
    }
}
