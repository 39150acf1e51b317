//! Error taxonomy
//!
//! Every phase boundary returns one of these. The pipeline inspects the kind
//! to decide between aborting the run (configuration) and skipping a phase
//! (everything else).

use std::path::PathBuf;

use thiserror::Error;

/// Misconfiguration discovered at startup. Always fatal to the run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required option `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("no destination queue is configured")]
    BlankDestination,
    #[error("options incorrectly supplied for either single broker or broker network")]
    BrokerUnconfigured,
    #[error("{key} not found at {}", path.display())]
    CredentialNotFound { key: &'static str, path: PathBuf },
}

/// Failures of the directory-service broker lookup. The transport phase is
/// skipped for the run; nothing else is affected.
#[derive(Debug, Error)]
pub enum DirectoryLookupError {
    #[error("directory service unreachable: {0}")]
    Unreachable(String),
    #[error("malformed directory response: {0}")]
    Malformed(String),
    #[error("no {service} brokers found on network `{network}`")]
    NotFound { service: String, network: String },
}

/// Record store failures. The phase that hit one returns without output.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
    #[error("rejected record {entity_id}: {reason}")]
    InvalidRecord { entity_id: String, reason: String },
}

/// Connect or send failures. The session is closed and whatever was not
/// confirmed stays staged for the next run.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("no broker accepted a session ({attempted} tried)")]
    NoBrokerAccepted { attempted: usize },
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("broker protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session is not connected")]
    NotConnected,
    #[error("failed to send message {message_id} after {delivered} delivered: {reason}")]
    Send {
        message_id: String,
        delivered: usize,
        reason: String,
    },
}

/// Unload-phase failures. All of them skip the unload phase for the run.
#[derive(Debug, Error)]
pub enum UnloadError {
    #[error("unrecognised interval: {0}")]
    UnrecognizedInterval(String),
    #[error("invalid gap interval: {0}")]
    InvalidGap(String),
    #[error("invalid table name: {0}")]
    UnknownCategory(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("usage record format is only available for detail records, not {0}")]
    UnsupportedFormat(String),
    #[error("failed to encode usage record: {0}")]
    Encode(String),
    #[error("failed to stage messages: {0}")]
    Staging(#[from] std::io::Error),
}
