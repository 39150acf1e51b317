//! HTTP directory client
//!
//! `GET {base}/services?type={kind}&network={network}` answering a JSON array
//! of `{ "host": ..., "port": ... }` objects in preference order.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use super::{DirectoryService, ServiceKind};
use crate::error::DirectoryLookupError;

const SERVICES_PATH: &str = "/services";

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    host: String,
    port: u16,
}

#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DirectoryLookupError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryLookupError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn services_url(&self) -> String {
        format!("{}{}", self.base_url, SERVICES_PATH)
    }
}

impl DirectoryService for HttpDirectory {
    fn resolve_brokers(
        &self,
        service: ServiceKind,
        network: &str,
    ) -> Result<Vec<(String, u16)>, DirectoryLookupError> {
        let url = self.services_url();
        debug!("Querying {} for {} on {}", url, service, network);

        let response = self
            .client
            .get(&url)
            .query(&[("type", service.as_str()), ("network", network)])
            .send()
            .map_err(|e| DirectoryLookupError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryLookupError::Unreachable(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        let entries: Vec<ServiceEntry> = response
            .json()
            .map_err(|e| DirectoryLookupError::Malformed(e.to_string()))?;

        entries
            .into_iter()
            .map(|e| {
                let host = e.host.trim();
                if host.is_empty() {
                    Err(DirectoryLookupError::Malformed("entry with empty host".into()))
                } else {
                    Ok((host.to_string(), e.port))
                }
            })
            .collect()
    }
}
