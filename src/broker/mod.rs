//! Broker resolution
//!
//! Two ways to find a broker, tried in order:
//! 1. network lookup through a directory service (`bdii` + `network`)
//! 2. a single statically configured `host` + `port`
//!
//! Which one applies is decided once, at startup, from the sender config.
//! Resolution itself happens per run and never yields an empty list.

pub mod directory;

use std::fmt;

use tracing::{debug, info};

use crate::config::BrokerSettings;
use crate::error::{ConfigError, DirectoryLookupError};

pub use directory::HttpDirectory;

/// One broker to try. Produced per run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if self.secure {
            f.write_str(" (ssl)")?;
        }
        Ok(())
    }
}

/// Ordered, non-empty list of endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerList(Vec<BrokerEndpoint>);

impl BrokerList {
    /// `None` for an empty list.
    pub fn new(endpoints: Vec<BrokerEndpoint>) -> Option<Self> {
        (!endpoints.is_empty()).then_some(Self(endpoints))
    }

    pub fn first(&self) -> &BrokerEndpoint {
        &self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BrokerEndpoint> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a BrokerList {
    type Item = &'a BrokerEndpoint;
    type IntoIter = std::slice::Iter<'a, BrokerEndpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Service type advertised by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Stomp,
    StompSsl,
}

impl ServiceKind {
    pub fn for_ssl(use_ssl: bool) -> Self {
        if use_ssl {
            Self::StompSsl
        } else {
            Self::Stomp
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stomp => "msg.broker.stomp",
            Self::StompSsl => "msg.broker.stomp-ssl",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Self::StompSsl)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directory lookup contract.
pub trait DirectoryService {
    /// Hosts and ports offering `service` on `network`, in preference order.
    fn resolve_brokers(
        &self,
        service: ServiceKind,
        network: &str,
    ) -> Result<Vec<(String, u16)>, DirectoryLookupError>;
}

/// The strategy chosen from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Strategy {
    NetworkLookup {
        bdii: String,
        network: String,
        service: ServiceKind,
    },
    Static(BrokerEndpoint),
}

#[derive(Debug, Clone)]
pub struct BrokerResolver {
    strategy: Strategy,
}

impl BrokerResolver {
    /// Pick a strategy. Neither configured is `BrokerUnconfigured`.
    pub fn new(settings: &BrokerSettings) -> Result<Self, ConfigError> {
        let strategy = try_network_lookup(settings)
            .or_else(|| try_static_config(settings))
            .ok_or(ConfigError::BrokerUnconfigured)?;
        Ok(Self { strategy })
    }

    /// Directory base URL when the network strategy is in use.
    pub fn directory_url(&self) -> Option<&str> {
        match &self.strategy {
            Strategy::NetworkLookup { bdii, .. } => Some(bdii),
            Strategy::Static(_) => None,
        }
    }

    pub fn resolve(&self, directory: &dyn DirectoryService) -> Result<BrokerList, DirectoryLookupError> {
        match &self.strategy {
            Strategy::Static(endpoint) => {
                debug!("Using statically configured broker {}", endpoint);
                Ok(BrokerList(vec![endpoint.clone()]))
            }
            Strategy::NetworkLookup {
                bdii,
                network,
                service,
            } => {
                info!("Retrieving {} brokers for network {} from {}", service, network, bdii);
                let endpoints = directory
                    .resolve_brokers(*service, network)?
                    .into_iter()
                    .map(|(host, port)| BrokerEndpoint {
                        host,
                        port,
                        secure: service.is_secure(),
                    })
                    .collect();
                let brokers = BrokerList::new(endpoints).ok_or_else(|| {
                    DirectoryLookupError::NotFound {
                        service: service.to_string(),
                        network: network.clone(),
                    }
                })?;
                info!("Found {} brokers", brokers.len());
                Ok(brokers)
            }
        }
    }
}

/// Both keys present selects the lookup, even when either value is empty.
fn try_network_lookup(settings: &BrokerSettings) -> Option<Strategy> {
    let bdii = settings.bdii.as_ref()?;
    let network = settings.network.as_ref()?;
    Some(Strategy::NetworkLookup {
        bdii: bdii.trim().to_string(),
        network: network.trim().to_string(),
        service: ServiceKind::for_ssl(settings.use_ssl),
    })
}

fn try_static_config(settings: &BrokerSettings) -> Option<Strategy> {
    let host = settings.host.as_ref()?.trim();
    let port = settings.port?;
    Some(Strategy::Static(BrokerEndpoint {
        host: host.to_string(),
        port,
        secure: settings.use_ssl,
    }))
}
