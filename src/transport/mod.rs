//! Broker transport
//!
//! One [`TransportSession`] per run. It walks the resolved broker list until
//! one accepts a connection, sends staged messages in order waiting for a
//! receipt each, and is always closed at the end, whatever happened.
//!
//! The wire protocol sits behind [`Connector`]/[`Connection`]; the STOMP
//! implementation lives in [`stomp`].

pub mod stomp;
pub mod tls;

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::broker::{BrokerEndpoint, BrokerList};
use crate::error::{ConfigError, TransportError};
use crate::unload::OutboundMessage;

pub use stomp::StompConnector;

/// Client credential files for mutual TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub certificate: PathBuf,
    pub key: PathBuf,
    /// CA bundle file or directory of PEM files
    pub capath: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSecurity {
    MutualTls(Credentials),
    /// Degraded mode, enabled explicitly with `no_encryption`
    Unencrypted,
}

impl TransportSecurity {
    pub fn credentials(&self) -> Option<&Credentials> {
        match self {
            Self::MutualTls(credentials) => Some(credentials),
            Self::Unencrypted => None,
        }
    }
}

/// Opens protocol sessions to a single broker.
pub trait Connector {
    fn connect(
        &self,
        endpoint: &BrokerEndpoint,
        security: &TransportSecurity,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// An established protocol session.
pub trait Connection {
    /// Send one message and wait until the broker confirms it.
    fn send(&mut self, destination: &str, message: &OutboundMessage) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connected,
    Sent,
    Closed,
}

pub struct TransportSession<'c> {
    connector: &'c dyn Connector,
    security: TransportSecurity,
    destination: String,
    state: SessionState,
    connection: Option<Box<dyn Connection>>,
    endpoint: Option<BrokerEndpoint>,
}

impl<'c> TransportSession<'c> {
    /// A blank destination is refused here, before any connection attempt.
    pub fn new(
        connector: &'c dyn Connector,
        destination: &str,
        security: TransportSecurity,
    ) -> Result<Self, ConfigError> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(ConfigError::BlankDestination);
        }
        Ok(Self {
            connector,
            security,
            destination: destination.to_string(),
            state: SessionState::Unconnected,
            connection: None,
            endpoint: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoint(&self) -> Option<&BrokerEndpoint> {
        self.endpoint.as_ref()
    }

    /// Try each broker in order and keep the first that accepts.
    pub fn connect(&mut self, brokers: &BrokerList) -> Result<&BrokerEndpoint, TransportError> {
        if self.state != SessionState::Unconnected {
            return Err(TransportError::Protocol(format!(
                "connect called in state {:?}",
                self.state
            )));
        }

        for endpoint in brokers {
            if endpoint.secure && self.security.credentials().is_none() {
                warn!("Skipping {}: secure broker but encryption is disabled", endpoint);
                continue;
            }
            match self.connector.connect(endpoint, &self.security) {
                Ok(connection) => {
                    info!("Connected to {}", endpoint);
                    self.connection = Some(connection);
                    self.state = SessionState::Connected;
                    return Ok(self.endpoint.insert(endpoint.clone()));
                }
                Err(e) => warn!("Failed to connect to {}: {}", endpoint, e),
            }
        }

        Err(TransportError::NoBrokerAccepted {
            attempted: brokers.len(),
        })
    }

    /// Send messages in order. Each confirmed message is passed to
    /// `on_confirmed` before the next is sent; the first failure stops the
    /// pass and carries the number already confirmed.
    pub fn send_all<'m, I, F>(&mut self, messages: I, mut on_confirmed: F) -> Result<usize, TransportError>
    where
        I: IntoIterator<Item = &'m OutboundMessage>,
        F: FnMut(&OutboundMessage),
    {
        let connection = match (&self.state, self.connection.as_mut()) {
            (SessionState::Connected | SessionState::Sent, Some(connection)) => connection,
            _ => return Err(TransportError::NotConnected),
        };

        let mut delivered = 0;
        for message in messages {
            if let Err(e) = connection.send(&self.destination, message) {
                return Err(TransportError::Send {
                    message_id: message.id().to_string(),
                    delivered,
                    reason: e.to_string(),
                });
            }
            debug!("Broker confirmed message {}", message.id());
            delivered += 1;
            on_confirmed(message);
        }

        self.state = SessionState::Sent;
        Ok(delivered)
    }

    /// Close the connection if one is open. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), TransportError> {
        let result = match self.connection.take() {
            Some(mut connection) => connection.close(),
            None => Ok(()),
        };
        if self.state != SessionState::Unconnected || result.is_err() {
            self.state = SessionState::Closed;
        }
        result
    }
}

impl Drop for TransportSession<'_> {
    fn drop(&mut self) {
        if self.connection.is_some() {
            if let Err(e) = self.close() {
                warn!("Error closing broker session: {}", e);
            }
        }
    }
}
