//! TOML configuration for the abuse scanner.
//!
//! A layered model with compiled-in defaults for every section, an
//! environment variable override for the config file path, and a standard
//! filesystem location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "ABUSESCAN_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/abusescan/abusescan.toml";

/// Upper bound for `thresholds.flag_window_hours` (one year).
pub const MAX_FLAG_WINDOW_HOURS: i64 = 24 * 365;

/// Upper bound for `thresholds.recent_account_days` (ten years).
pub const MAX_RECENT_ACCOUNT_DAYS: i64 = 3650;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the scanner process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default)]
    pub scanner: ScanConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default)]
    pub intel: IntelConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ScannerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        info!(path = %path.display(), "loaded scanner configuration");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. An explicit path (the `--config` flag).
    /// 2. The path in the `ABUSESCAN_CONFIG` environment variable.
    /// 3. `/etc/abusescan/abusescan.toml`.
    /// 4. Compiled-in defaults.
    ///
    /// An explicitly requested file that fails to load is an error; the
    /// implicit locations fall through with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ABUSESCAN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scanner.batch_size == 0 {
            return Err(ConfigError::Invalid("scanner.batch_size must be at least 1".into()));
        }
        if self.scanner.interval_secs == 0 {
            return Err(ConfigError::Invalid("scanner.interval_secs must be at least 1".into()));
        }
        if self.intel.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid("intel.sync_interval_secs must be at least 1".into()));
        }
        if self.storage.max_detections == 0 {
            return Err(ConfigError::Invalid("storage.max_detections must be at least 1".into()));
        }
        if !(1..=MAX_FLAG_WINDOW_HOURS).contains(&self.thresholds.flag_window_hours) {
            return Err(ConfigError::Invalid(format!(
                "thresholds.flag_window_hours must be between 1 and {}",
                MAX_FLAG_WINDOW_HOURS
            )));
        }
        if !(0..=MAX_RECENT_ACCOUNT_DAYS).contains(&self.thresholds.recent_account_days) {
            return Err(ConfigError::Invalid(format!(
                "thresholds.recent_account_days must be between 0 and {}",
                MAX_RECENT_ACCOUNT_DAYS
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Scan loop and per-container inspection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Sleep between the end of one cycle and the start of the next.
    pub interval_secs: u64,
    /// Containers scanned concurrently within one batch.
    pub batch_size: usize,
    /// Lines of log tail fetched per container.
    pub log_tail_lines: u32,
    /// In-container destination of the persistent-storage bind mount.
    pub mount_target: String,
    /// Files larger than this are not hashed.
    pub max_hash_bytes: u64,
    /// Files larger than this are not read as text.
    pub max_content_bytes: u64,
    /// Container runtime CLI binary.
    pub docker_bin: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            batch_size: 5,
            log_tail_lines: 100,
            mount_target: "/home/container".to_string(),
            max_hash_bytes: 64 * 1024 * 1024,
            max_content_bytes: 1024 * 1024,
            docker_bin: "docker".to_string(),
        }
    }
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Classification thresholds. Comparisons are strict greater/less-than.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub small_volume_mb: f64,
    pub high_cpu_percent: f64,
    pub high_network_bytes: u64,
    pub max_jar_bytes: u64,
    pub recent_account_days: i64,
    pub flag_window_hours: i64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            small_volume_mb: 50.0,
            high_cpu_percent: 90.0,
            high_network_bytes: 5 * 1024 * 1024 * 1024,
            max_jar_bytes: 5_242_880,
            recent_account_days: 7,
            flag_window_hours: 24,
        }
    }
}

// ---------------------------------------------------------------------------
// Panel (hosting control plane)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Base URL of the control plane, e.g. `https://panel.example.com`.
    pub url: String,
    /// Application API key, sent as a bearer credential.
    pub api_key: String,
    pub server_cache_secs: u64,
    pub page_size: u32,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1".to_string(),
            api_key: String::new(),
            server_cache_secs: 300,
            page_size: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Hash intelligence
// ---------------------------------------------------------------------------

/// Remote hash authority and local cache sizing. Without a `url` the store
/// runs local-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntelConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub sync_interval_secs: u64,
    pub max_hashes: u64,
    pub max_flags: u64,
    pub flag_ttl_secs: u64,
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            sync_interval_secs: 3600,
            max_hashes: 100_000,
            max_flags: 10_000,
            flag_ttl_secs: 86_400,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
    /// Suspend the owning account when a detection carries any type.
    pub auto_suspend: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            auto_suspend: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Control API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_address: String,
    /// When set, every `/api` route requires `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".to_string(),
            auth_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Ring-buffer capacity of the in-memory detection store.
    pub max_detections: usize,
    /// Optional SQLite file for detection persistence across restarts.
    pub db_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_detections: 10_000,
            db_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = ScannerConfig::default();
        assert_eq!(cfg.scanner.batch_size, 5);
        assert_eq!(cfg.scanner.interval_secs, 300);
        assert_eq!(cfg.thresholds.max_jar_bytes, 5_242_880);
        assert_eq!(cfg.thresholds.flag_window_hours, 24);
        assert!(cfg.intel.url.is_none());
        assert!(cfg.alerts.auto_suspend);
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = ScannerConfig::from_toml(
            r#"
            [scanner]
            batch_size = 3

            [panel]
            url = "https://panel.example.com"
            api_key = "ptla_secret"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.scanner.batch_size, 3);
        assert_eq!(cfg.scanner.log_tail_lines, 100);
        assert_eq!(cfg.panel.url, "https://panel.example.com");
        assert_eq!(cfg.panel.server_cache_secs, 300);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = ScannerConfig::from_toml("[scanner]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_out_of_range_time_thresholds_rejected() {
        for body in [
            "[thresholds]\nflag_window_hours = 9223372036854775807\n",
            "[thresholds]\nflag_window_hours = 0\n",
            "[thresholds]\nflag_window_hours = -24\n",
            "[thresholds]\nrecent_account_days = 9223372036854775807\n",
            "[thresholds]\nrecent_account_days = -1\n",
        ] {
            let err = ScannerConfig::from_toml(body).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "accepted: {}", body);
        }
        let cfg = ScannerConfig::from_toml(
            "[thresholds]\nflag_window_hours = 8760\nrecent_account_days = 0\n",
        )
        .unwrap();
        assert_eq!(cfg.thresholds.flag_window_hours, 8760);
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "[intel]\nurl = \"https://intel.example.com\"").unwrap();
        tmp.flush().unwrap();

        let cfg = ScannerConfig::load(tmp.path()).unwrap();
        assert_eq!(cfg.intel.url.as_deref(), Some("https://intel.example.com"));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = ScannerConfig::resolve(Some(Path::new("/nonexistent/abusescan.toml")));
        assert!(matches!(err, Err(ConfigError::Read { .. })));
    }
}
