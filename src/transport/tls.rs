//! Mutual TLS client setup (rustls, ring provider)

use std::fs;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use tracing::{debug, warn};

use super::Credentials;
use crate::error::TransportError;

pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

fn tls_err(context: &str, path: &Path, e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(format!("{} {}: {}", context, path.display(), e))
}

/// Trust anchors from a PEM bundle, or from every `.pem`/`.crt` file in a
/// directory.
pub fn load_roots(capath: &Path) -> Result<RootCertStore, TransportError> {
    let files = if capath.is_dir() {
        let mut files: Vec<_> = fs::read_dir(capath)
            .map_err(|e| tls_err("cannot read CA directory", capath, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext == "pem" || ext == "crt")
            })
            .collect();
        files.sort();
        files
    } else {
        vec![capath.to_path_buf()]
    };

    let mut roots = RootCertStore::empty();
    for file in &files {
        let certs = CertificateDer::pem_file_iter(file)
            .map_err(|e| tls_err("cannot read CA file", file, e))?;
        for cert in certs {
            match cert {
                Ok(cert) => {
                    if let Err(e) = roots.add(cert) {
                        warn!("Ignoring CA certificate in {}: {}", file.display(), e);
                    }
                }
                Err(e) => warn!("Ignoring unparsable PEM in {}: {}", file.display(), e),
            }
        }
    }

    if roots.is_empty() {
        return Err(TransportError::Tls(format!(
            "no usable CA certificates under {}",
            capath.display()
        )));
    }
    debug!("Loaded {} trust anchors from {}", roots.len(), capath.display());
    Ok(roots)
}

/// First certificate in a PEM file.
pub fn load_certificate(path: &Path) -> Result<CertificateDer<'static>, TransportError> {
    CertificateDer::from_pem_file(path).map_err(|e| tls_err("cannot read certificate", path, e))
}

pub fn client_config(credentials: &Credentials) -> Result<Arc<ClientConfig>, TransportError> {
    let roots = load_roots(&credentials.capath)?;

    let chain: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(&credentials.certificate)
        .map_err(|e| tls_err("cannot read certificate", &credentials.certificate, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| tls_err("bad certificate", &credentials.certificate, e))?;
    if chain.is_empty() {
        return Err(tls_err(
            "no certificate in",
            &credentials.certificate,
            "empty PEM file",
        ));
    }
    let key = PrivateKeyDer::from_pem_file(&credentials.key)
        .map_err(|e| tls_err("cannot read key", &credentials.key, e))?;

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Wrap a connected socket in a client TLS session for `host`.
pub fn wrap(
    config: Arc<ClientConfig>,
    host: &str,
    socket: TcpStream,
) -> Result<TlsStream, TransportError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid server name {}: {}", host, e)))?;
    let connection =
        ClientConnection::new(config, server_name).map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(StreamOwned::new(connection, socket))
}
