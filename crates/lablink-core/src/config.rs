//! # Application Configuration
//!
//! Human-editable TOML configuration for the receiver.
//!
//! ## Configuration File Format
//! ```toml
//! # lablink.toml
//! app_name = "LabLink Receiver"
//! instance_id = "XN-L-001"
//! idle_timeout_secs = 60
//!
//! [[listeners]]
//! port = 5000
//! analyzer_type = "sysmex_xn_l"
//! protocol = "astm"
//!
//! [[listeners]]
//! port = 5001
//! analyzer_type = "mindray_bs_430"
//! protocol = "hl7"
//!
//! [external_server]
//! enabled = true
//! url = "https://lis.example.org/api/results"
//! sync_frequency = "realtime"   # realtime | scheduled | cron
//! interval_seconds = 900
//! cron_schedule = "0 * * * *"
//! batch_size = 100
//!
//! [external_server.auth]
//! scheme = "api_key"
//! header = "X-API-Key"
//! key = "secret"
//! ```
//!
//! A single-port legacy form (`port`, `analyzer_type`, `protocol` at top
//! level) is still accepted and treated as a one-element listener list.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConfigError, ValidationError};
use crate::types::{AnalyzerType, ListenerSpec, WireProtocol};
use crate::validation;

// =============================================================================
// Sync Frequency
// =============================================================================

/// When the sync engine pushes local rows to the external server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
    /// Push as soon as new results are stored.
    Realtime,
    /// Push on a fixed interval.
    #[default]
    Scheduled,
    /// Push on a 5-field cron schedule.
    Cron,
}

impl std::fmt::Display for SyncFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncFrequency::Realtime => write!(f, "realtime"),
            SyncFrequency::Scheduled => write!(f, "scheduled"),
            SyncFrequency::Cron => write!(f, "cron"),
        }
    }
}

// =============================================================================
// Authentication
// =============================================================================

/// Credential injected into outbound requests.
///
/// The receiver treats credentials as opaque; the sync engine's auth
/// provider turns them into request headers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication.
    #[default]
    None,

    /// Static API key in a configurable header.
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        key: String,
    },

    /// Static bearer token.
    Bearer { token: String },

    /// HTTP basic auth. Password may be empty.
    Basic {
        username: String,
        #[serde(default)]
        password: String,
    },

    /// Arbitrary custom header set.
    Headers { headers: BTreeMap<String, String> },

    /// OAuth 2.0 client-credentials grant. The token is cached and
    /// refreshed ahead of expiry, and force-refreshed once on a 401.
    #[serde(rename = "oauth2")]
    OAuth2 {
        token_url: String,
        client_id: String,
        #[serde(default)]
        client_secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

// =============================================================================
// External Server
// =============================================================================

/// Outbound sync endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalServerConfig {
    /// Master switch for outbound sync.
    #[serde(default)]
    pub enabled: bool,

    /// Endpoint receiving `POST` batches.
    #[serde(default)]
    pub url: String,

    /// Credential for the endpoint.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Push cadence.
    #[serde(default)]
    pub sync_frequency: SyncFrequency,

    /// Interval for `scheduled` mode, in seconds.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,

    /// 5-field cron expression for `cron` mode.
    #[serde(default = "default_cron_schedule")]
    pub cron_schedule: String,

    /// Maximum results per request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent upload workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Base delay of the delivery retry schedule, in seconds. The n-th
    /// retry waits `retry_base_secs × 2^min(n, 6)` with ±20% jitter.
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,
}

fn default_interval_seconds() -> u64 {
    900
}

fn default_cron_schedule() -> String {
    "0 * * * *".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_workers() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    30
}

fn default_retry_base() -> u64 {
    5
}

impl Default for ExternalServerConfig {
    fn default() -> Self {
        ExternalServerConfig {
            enabled: false,
            url: String::new(),
            auth: AuthConfig::None,
            sync_frequency: SyncFrequency::default(),
            interval_seconds: default_interval_seconds(),
            cron_schedule: default_cron_schedule(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            request_timeout_secs: default_request_timeout(),
            retry_base_secs: default_retry_base(),
        }
    }
}

// =============================================================================
// Application Config
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Display name, used in logs and the remote payload user agent.
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Stable identifier of this receiver installation, included in every
    /// outbound batch.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Seconds of socket silence before a connection is closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Database file path.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Legacy single-port form. Folded into `listeners` by
    /// [`AppConfig::listener_specs`]. Declared before the table-valued
    /// fields so TOML serialization keeps scalars first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer_type: Option<AnalyzerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<WireProtocol>,

    /// Multi-port listener set.
    #[serde(default)]
    pub listeners: Vec<ListenerSpec>,

    /// Outbound sync settings.
    #[serde(default)]
    pub external_server: ExternalServerConfig,
}

fn default_app_name() -> String {
    "LabLink Receiver".to_string()
}

fn default_instance_id() -> String {
    "LABLINK-001".to_string()
}

fn default_idle_timeout() -> u64 {
    crate::DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_database_path() -> PathBuf {
    PathBuf::from("lablink.db")
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            app_name: default_app_name(),
            instance_id: default_instance_id(),
            idle_timeout_secs: default_idle_timeout(),
            database_path: default_database_path(),
            port: None,
            analyzer_type: None,
            protocol: None,
            listeners: vec![ListenerSpec {
                port: 5000,
                analyzer_type: AnalyzerType::SysmexXnL,
                protocol: WireProtocol::Astm,
                field_map_id: None,
            }],
            external_server: ExternalServerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration, writing the defaults on first run.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            info!(path = %path.display(), "No config file found, writing defaults");
            let config = AppConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// The effective listener set: `listeners[]` plus the legacy
    /// single-port form if present and not already covered.
    pub fn listener_specs(&self) -> Vec<ListenerSpec> {
        let mut specs = self.listeners.clone();

        if let Some(port) = self.port {
            if specs.iter().any(|s| s.port == port) {
                warn!(port, "Legacy port duplicates a listeners[] entry, ignoring");
            } else {
                let analyzer_type = self.analyzer_type.unwrap_or(AnalyzerType::SysmexXnL);
                let protocol = self
                    .protocol
                    .unwrap_or_else(|| analyzer_type.default_protocol());
                specs.push(ListenerSpec {
                    port,
                    analyzer_type,
                    protocol,
                    field_map_id: None,
                });
            }
        }

        specs
    }

    /// Semantic validation of the whole file.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_instance_id(&self.instance_id)?;
        validation::validate_listeners(&self.listener_specs())?;

        if self.idle_timeout_secs == 0 {
            return Err(ValidationError::OutOfRange {
                field: "idle_timeout_secs".into(),
                reason: "must be at least 1".into(),
            });
        }

        let ext = &self.external_server;
        if ext.enabled {
            url::Url::parse(&ext.url).map_err(|e| ValidationError::InvalidFormat {
                field: "external_server.url".into(),
                reason: e.to_string(),
            })?;

            match ext.sync_frequency {
                SyncFrequency::Cron => validation::validate_cron(&ext.cron_schedule)?,
                SyncFrequency::Scheduled if ext.interval_seconds == 0 => {
                    return Err(ValidationError::OutOfRange {
                        field: "external_server.interval_seconds".into(),
                        reason: "must be at least 1".into(),
                    });
                }
                _ => {}
            }

            if ext.batch_size == 0 {
                return Err(ValidationError::OutOfRange {
                    field: "external_server.batch_size".into(),
                    reason: "must be at least 1".into(),
                });
            }

            if ext.workers == 0 {
                return Err(ValidationError::OutOfRange {
                    field: "external_server.workers".into(),
                    reason: "must be at least 1".into(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listener_specs().len(), 1);
        assert_eq!(config.listener_specs()[0].port, 5000);
    }

    #[test]
    fn roundtrip_through_toml() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn legacy_single_port_form() {
        let text = r#"
            app_name = "XN-L Data Receiver"
            instance_id = "XN-L-001"
            port = 5000
            analyzer_type = "sysmex_xn_l"
            protocol = "astm"
            listeners = []
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        let specs = config.listener_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].port, 5000);
        assert_eq!(specs[0].analyzer_type, AnalyzerType::SysmexXnL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn auth_scheme_parses() {
        let text = r#"
            port = 5000

            [external_server]
            enabled = true
            url = "https://lis.example.org/api/results"
            sync_frequency = "cron"
            cron_schedule = "*/30 * * * *"

            [external_server.auth]
            scheme = "oauth2"
            token_url = "https://auth.example.org/token"
            client_id = "lablink"
            client_secret = "secret"
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        assert!(matches!(
            config.external_server.auth,
            AuthConfig::OAuth2 { .. }
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_sync_requires_valid_url() {
        let mut config = AppConfig::default();
        config.external_server.enabled = true;
        config.external_server.url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_cron_rejected() {
        let mut config = AppConfig::default();
        config.external_server.enabled = true;
        config.external_server.url = "https://example.org/x".into();
        config.external_server.sync_frequency = SyncFrequency::Cron;
        config.external_server.cron_schedule = "every hour".into();
        assert!(config.validate().is_err());
    }
}
