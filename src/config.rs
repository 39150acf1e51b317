//! Client and sender configuration
//!
//! Two TOML files: the client file drives the phases, the sender file
//! describes how to reach the broker. Both are loaded once at startup,
//! validated, and then only passed around by reference.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::broker::BrokerResolver;
use crate::error::ConfigError;
use crate::transport::{tls, Credentials, TransportSecurity};

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Client file
// ---------------------------------------------------------------------------

/// Phase configuration (`client.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub site: SiteConfig,

    #[serde(default)]
    pub db: DbConfig,

    #[serde(default)]
    pub spec_updater: SpecUpdaterConfig,

    #[serde(default)]
    pub joiner: JoinerConfig,

    #[serde(default)]
    pub unloader: UnloaderConfig,

    #[serde(default)]
    pub sender: SenderToggle,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load from TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_toml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if (self.spec_updater.enabled || self.joiner.enabled) && self.site_name().is_none() {
            return Err(ConfigError::Missing("site.name"));
        }
        if self.unloader.max_records_per_message == 0 {
            return Err(ConfigError::Invalid {
                key: "unloader.max_records_per_message",
                reason: "must be greater than zero".into(),
            });
        }
        if self.unloader.max_message_bytes == Some(0) {
            return Err(ConfigError::Invalid {
                key: "unloader.max_message_bytes",
                reason: "must be greater than zero when set".into(),
            });
        }
        for entry in &self.spec_updater.benchmarks {
            if !entry.value.is_finite() || entry.value < 0.0 {
                return Err(ConfigError::Invalid {
                    key: "spec_updater.benchmarks",
                    reason: format!("{} has value {}", entry.host, entry.value),
                });
            }
        }
        if self.joiner.local_jobs {
            let updater = &self.spec_updater;
            if non_blank(updater.lrms_server.as_deref()).is_none() {
                return Err(ConfigError::Missing("spec_updater.lrms_server"));
            }
            if non_blank(updater.spec_type.as_deref()).is_none() {
                return Err(ConfigError::Missing("spec_updater.spec_type"));
            }
            match updater.spec_value {
                None => return Err(ConfigError::Missing("spec_updater.spec_value")),
                Some(v) if !v.is_finite() || v < 0.0 => {
                    return Err(ConfigError::Invalid {
                        key: "spec_updater.spec_value",
                        reason: format!("{} is not a benchmark value", v),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Local batch jobs to fold in during the join, when enabled.
    pub fn local_jobs(&self) -> Option<LocalJobs<'_>> {
        if !self.joiner.local_jobs {
            return None;
        }
        let updater = &self.spec_updater;
        Some(LocalJobs {
            lrms_server: non_blank(updater.lrms_server.as_deref())?,
            spec_type: non_blank(updater.spec_type.as_deref())?,
            spec_value: updater.spec_value?,
        })
    }

    pub fn site_name(&self) -> Option<&str> {
        non_blank(self.site.name.as_deref())
    }

    /// Source label stamped on every outbound message.
    pub fn source_name(&self) -> &str {
        self.site_name().unwrap_or("unknown-site")
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Benchmark and host used for jobs that ran on the local batch system
/// without a grid submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalJobs<'a> {
    pub lrms_server: &'a str,
    pub spec_type: &'a str,
    pub spec_value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteConfig {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("usage-relay.db")
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecUpdaterConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Benchmark values to record for hosts of this site
    #[serde(default)]
    pub benchmarks: Vec<BenchmarkEntry>,

    /// Batch system head node; local jobs are attributed to it
    #[serde(default)]
    pub lrms_server: Option<String>,
    #[serde(default)]
    pub spec_type: Option<String>,
    #[serde(default)]
    pub spec_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkEntry {
    pub host: String,
    #[serde(default = "default_spec_type")]
    pub spec_type: String,
    pub value: f64,
}

fn default_spec_type() -> String {
    "HEPSPEC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Also publish jobs that never went through a grid gateway
    #[serde(default)]
    pub local_jobs: bool,
}

impl Default for JoinerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_jobs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloaderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Spool directory; staged messages live in its `outgoing` subdirectory
    #[serde(default = "default_dir_location")]
    pub dir_location: PathBuf,

    /// `detail` or `summary`
    #[serde(default = "default_table")]
    pub table: String,

    /// `latest`, `gap` or `all`
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Inclusive bounds for `gap`, `YYYY-MM-DD`
    #[serde(default)]
    pub gap_start: Option<String>,
    #[serde(default)]
    pub gap_end: Option<String>,

    #[serde(default)]
    pub include_vos: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_vos: Option<Vec<String>>,

    /// Leave submitter identities out of published records
    #[serde(default)]
    pub withhold_dns: bool,

    #[serde(default = "default_max_records")]
    pub max_records_per_message: usize,

    #[serde(default)]
    pub max_message_bytes: Option<usize>,

    /// Publish detail records as XML usage records instead of blocks
    #[serde(default)]
    pub send_ur: bool,
}

fn default_dir_location() -> PathBuf {
    PathBuf::from("/var/spool/usage-relay")
}

fn default_table() -> String {
    "detail".to_string()
}

fn default_interval() -> String {
    "latest".to_string()
}

fn default_max_records() -> usize {
    1000
}

impl Default for UnloaderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir_location: default_dir_location(),
            table: default_table(),
            interval: default_interval(),
            gap_start: None,
            gap_end: None,
            include_vos: None,
            exclude_vos: None,
            withhold_dns: false,
            max_records_per_message: default_max_records(),
            max_message_bytes: None,
            send_ur: false,
        }
    }
}

impl UnloaderConfig {
    pub fn outbox_dir(&self) -> PathBuf {
        self.dir_location.join("outgoing")
    }

    /// Per-message record bound. Zero is rejected by `validate`; treat it as
    /// one here rather than panic on a config built in code.
    pub fn max_records(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_records_per_message).unwrap_or(NonZeroUsize::MIN)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderToggle {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SenderToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_true")]
    pub console: bool,

    #[serde(default)]
    pub logfile: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            console: true,
            logfile: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sender file
// ---------------------------------------------------------------------------

/// Broker and credential configuration (`sender.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub certificates: CertificateSettings,

    #[serde(default)]
    pub messaging: MessagingSettings,
}

impl SenderConfig {
    /// Load from TOML file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_toml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        BrokerResolver::new(&self.broker)?;
        self.messaging.destination()?;
        if self.messaging.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "messaging.timeout_secs",
                reason: "must be greater than zero".into(),
            });
        }
        let security = self.certificates.security()?;
        if self.broker.use_ssl && security == TransportSecurity::Unencrypted {
            return Err(ConfigError::Invalid {
                key: "broker.use_ssl",
                reason: "secure brokers need certificates but no_encryption is set".into(),
            });
        }
        self.certificates.server_certificate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Directory service base URL
    pub bdii: Option<String>,
    /// Broker network name to look up
    pub network: Option<String>,
    /// Single broker host, used when no network is configured
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub use_ssl: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificateSettings {
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// CA bundle file or directory of PEM files
    pub capath: Option<PathBuf>,
    /// Collector certificate for message body encryption
    #[serde(default)]
    pub server_cert: Option<PathBuf>,
    /// Connect without TLS or client credentials
    #[serde(default)]
    pub no_encryption: bool,
}

impl CertificateSettings {
    /// Resolve the transport security mode, checking credential files exist
    /// unless encryption is switched off.
    pub fn security(&self) -> Result<TransportSecurity, ConfigError> {
        if self.no_encryption {
            return Ok(TransportSecurity::Unencrypted);
        }
        let certificate = existing(self.certificate.as_deref(), "certificates.certificate")?;
        let key = existing(self.key.as_deref(), "certificates.key")?;
        let capath = existing(self.capath.as_deref(), "certificates.capath")?;
        Ok(TransportSecurity::MutualTls(Credentials {
            certificate,
            key,
            capath,
        }))
    }

    /// The configured server certificate, checked on disk and parsed.
    /// `None` when the option is absent.
    pub fn server_certificate(&self) -> Result<Option<&Path>, ConfigError> {
        let Some(path) = self.server_cert.as_deref() else {
            return Ok(None);
        };
        existing(Some(path), "certificates.server_cert")?;
        tls::load_certificate(path).map_err(|e| ConfigError::Invalid {
            key: "certificates.server_cert",
            reason: e.to_string(),
        })?;
        Ok(Some(path))
    }
}

fn existing(path: Option<&Path>, key: &'static str) -> Result<PathBuf, ConfigError> {
    let path = path.ok_or(ConfigError::Missing(key))?;
    if !path.exists() {
        return Err(ConfigError::CredentialNotFound {
            key,
            path: path.to_path_buf(),
        });
    }
    Ok(path.to_path_buf())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingSettings {
    /// Queue or topic on the broker
    #[serde(default)]
    pub destination: String,

    /// Outbox to drain; defaults to the unloader's outbox
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            destination: String::new(),
            path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl MessagingSettings {
    /// Trimmed destination, or `BlankDestination`.
    pub fn destination(&self) -> Result<&str, ConfigError> {
        let destination = self.destination.trim();
        if destination.is_empty() {
            return Err(ConfigError::BlankDestination);
        }
        Ok(destination)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_client_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "client.toml", "[site]\nname = \"Site1\"\n");
        let config = ClientConfig::load(&path).unwrap();

        assert_eq!(config.site_name(), Some("Site1"));
        assert!(config.joiner.enabled);
        assert!(config.unloader.enabled);
        assert!(!config.spec_updater.enabled);
        assert_eq!(config.unloader.table, "detail");
        assert_eq!(config.unloader.interval, "latest");
        assert_eq!(config.unloader.max_records().get(), 1000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_site_required_for_joiner() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "client.toml", "[site]\nname = \"  \"\n");
        assert!(matches!(
            ClientConfig::load(&path),
            Err(ConfigError::Missing("site.name"))
        ));

        let path = write(
            dir.path(),
            "client2.toml",
            "[joiner]\nenabled = false\n[unloader]\ninterval = \"all\"\n",
        );
        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.source_name(), "unknown-site");
    }

    #[test]
    fn test_zero_record_bound_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "client.toml",
            "[site]\nname = \"Site1\"\n[unloader]\nmax_records_per_message = 0\n",
        );
        assert!(matches!(
            ClientConfig::load(&path),
            Err(ConfigError::Invalid { key: "unloader.max_records_per_message", .. })
        ));
    }

    #[test]
    fn test_parse_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "client.toml", "[site\nname = 1");
        match ClientConfig::load(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {:?}", other),
        }
        assert!(matches!(
            ClientConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_sender_blank_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "sender.toml",
            r#"
[broker]
host = "broker.example.org"
port = 61613

[certificates]
no_encryption = true

[messaging]
destination = "   "
"#,
        );
        assert!(matches!(
            SenderConfig::load(&path),
            Err(ConfigError::BlankDestination)
        ));
    }

    #[test]
    fn test_sender_broker_unconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "sender.toml",
            "[broker]\nhost = \"broker.example.org\"\n[messaging]\ndestination = \"/queue/usage\"\n",
        );
        assert!(matches!(
            SenderConfig::load(&path),
            Err(ConfigError::BrokerUnconfigured)
        ));
    }

    #[test]
    fn test_sender_credentials_checked_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cert = write(dir.path(), "host.pem", "cert");
        let path = write(
            dir.path(),
            "sender.toml",
            &format!(
                r#"
[broker]
bdii = "http://directory.example.org"
network = "PROD"

[certificates]
certificate = "{}"
key = "{}"
capath = "{}"

[messaging]
destination = "/queue/usage"
"#,
                cert.display(),
                dir.path().join("hostkey.pem").display(),
                dir.path().display()
            ),
        );
        match SenderConfig::load(&path) {
            Err(ConfigError::CredentialNotFound { key, .. }) => {
                assert_eq!(key, "certificates.key")
            }
            other => panic!("expected missing key, got {:?}", other),
        }

        write(dir.path(), "hostkey.pem", "key");
        let config = SenderConfig::load(&path).unwrap();
        assert!(matches!(
            config.certificates.security().unwrap(),
            TransportSecurity::MutualTls(_)
        ));
        assert_eq!(config.messaging.timeout_secs, 30);
    }

    #[test]
    fn test_local_jobs_need_lrms_benchmark() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "client.toml",
            "[site]\nname = \"Site1\"\n[joiner]\nlocal_jobs = true\n[spec_updater]\nlrms_server = \" \"\n",
        );
        assert!(matches!(
            ClientConfig::load(&path),
            Err(ConfigError::Missing("spec_updater.lrms_server"))
        ));

        let path = write(
            dir.path(),
            "client2.toml",
            r#"
[site]
name = "Site1"

[joiner]
local_jobs = true

[spec_updater]
lrms_server = "lrms.site1.example.org"
spec_type = "HEPSPEC"
"#,
        );
        assert!(matches!(
            ClientConfig::load(&path),
            Err(ConfigError::Missing("spec_updater.spec_value"))
        ));

        let path = write(
            dir.path(),
            "client3.toml",
            r#"
[site]
name = "Site1"

[joiner]
local_jobs = true

[spec_updater]
lrms_server = "lrms.site1.example.org"
spec_type = "HEPSPEC"
spec_value = 9.5
"#,
        );
        let config = ClientConfig::load(&path).unwrap();
        assert!(!config.spec_updater.enabled);
        assert_eq!(
            config.local_jobs(),
            Some(LocalJobs {
                lrms_server: "lrms.site1.example.org",
                spec_type: "HEPSPEC",
                spec_value: 9.5,
            })
        );
    }

    #[test]
    fn test_ssl_broker_rejects_no_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "sender.toml",
            r#"
[broker]
host = "broker.example.org"
port = 61614
use_ssl = true

[certificates]
no_encryption = true

[messaging]
destination = "/queue/usage"
"#,
        );
        assert!(matches!(
            SenderConfig::load(&path),
            Err(ConfigError::Invalid { key: "broker.use_ssl", .. })
        ));
    }

    #[test]
    fn test_server_cert_checked_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let sender = |server_cert: &Path| {
            format!(
                "[broker]\nhost = \"b\"\nport = 61613\n[certificates]\nno_encryption = true\n\
                 server_cert = \"{}\"\n[messaging]\ndestination = \"/queue/usage\"\n",
                server_cert.display()
            )
        };

        let missing = dir.path().join("collector.pem");
        let path = write(dir.path(), "sender.toml", &sender(&missing));
        match SenderConfig::load(&path) {
            Err(ConfigError::CredentialNotFound { key, .. }) => {
                assert_eq!(key, "certificates.server_cert")
            }
            other => panic!("expected missing server cert, got {:?}", other),
        }

        write(dir.path(), "collector.pem", "not a certificate\n");
        assert!(matches!(
            SenderConfig::load(&path),
            Err(ConfigError::Invalid { key: "certificates.server_cert", .. })
        ));

        write(
            dir.path(),
            "collector.pem",
            "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n",
        );
        let config = SenderConfig::load(&path).unwrap();
        assert_eq!(
            config.certificates.server_certificate().unwrap(),
            Some(missing.as_path())
        );

        let without = SenderConfig::default();
        assert_eq!(without.certificates.server_certificate().unwrap(), None);
    }
}
