//! usage-relay
//!
//! Unloads consolidated accounting records from the local store, stages them
//! as bounded messages and ships them to a collector through a STOMP broker.
//! The binary in `main.rs` wires these modules into one run.

pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod outbox;
pub mod pipeline;
pub mod report;
pub mod store;
pub mod transport;
pub mod unload;

pub use error::{ConfigError, DirectoryLookupError, StoreError, TransportError, UnloadError};
pub use pipeline::{Pipeline, RunSummary};
