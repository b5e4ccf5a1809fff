use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::domain::{normalize_url, ServiceDescriptor};
use crate::error::{OpsdeckError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Monitored services. Empty means the built-in set.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Console backend base address (e.g. "http://localhost:8000")
    #[serde(default)]
    pub base_url: Option<String>,
    /// Bearer token for authenticated calls
    #[serde(default)]
    pub token: Option<String>,
    /// Timeout for a single backend request in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout() -> u64 {
    10_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

/// Health source strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// `GET /statuses` returning `{serviceName: bool}`
    #[default]
    Aggregate,
    /// `GET /ping` returning `{category: [{name, status}]}`
    Grouped,
    /// One probe per descriptor health URL
    FanOut,
}

impl PollMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollMode::Aggregate => "aggregate",
            PollMode::Grouped => "grouped",
            PollMode::FanOut => "fan_out",
        }
    }
}

impl std::str::FromStr for PollMode {
    type Err = OpsdeckError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "aggregate" => Ok(PollMode::Aggregate),
            "grouped" => Ok(PollMode::Grouped),
            "fan_out" | "fanout" => Ok(PollMode::FanOut),
            other => Err(OpsdeckError::Configuration(format!(
                "unknown poll mode '{}' (expected aggregate, grouped or fan_out)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default)]
    pub mode: PollMode,
    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Default per-probe timeout in fan-out mode
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    3_000
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            mode: PollMode::default(),
            interval_secs: default_poll_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Delay before reconnecting the push channel
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// How long a notification stays visible
    #[serde(default = "default_display_window")]
    pub display_window_ms: u64,
}

fn default_reconnect_delay() -> u64 {
    3_000
}

fn default_display_window() -> u64 {
    5_000
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay(),
            display_window_ms: default_display_window(),
        }
    }
}

impl NotifyConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn display_window(&self) -> Duration {
        Duration::from_millis(self.display_window_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportConfig {
    /// Where downloads are saved
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

impl ReportConfig {
    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rotated log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

/// Raw `[[services]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ServiceConfig {
    fn new(name: &str, category: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            health_url: None,
            web_url: None,
            timeout_ms: None,
        }
    }

    fn to_descriptor(&self) -> Result<ServiceDescriptor> {
        let parse = |field: &str, raw: &Option<String>| -> Result<Option<Url>> {
            match raw.as_deref().map(str::trim) {
                None | Some("") => Ok(None),
                Some(raw) => normalize_url(raw).map(Some).map_err(|e| {
                    OpsdeckError::Configuration(format!(
                        "service {}: invalid {} '{}': {}",
                        self.name, field, raw, e
                    ))
                }),
            }
        };

        Ok(ServiceDescriptor {
            name: self.name.trim().to_string(),
            category: self.category.trim().to_string(),
            health_url: parse("health_url", &self.health_url)?,
            web_url: parse("web_url", &self.web_url)?,
            timeout: self.timeout_ms.map(Duration::from_millis),
        })
    }
}

/// Built-in monitored set
fn default_services() -> Vec<ServiceConfig> {
    [
        ("Docker Server", "Services"),
        ("Zabbix", "Services"),
        ("Prometheus", "Services"),
        ("Fluentd", "Logging"),
        ("OpenSearch", "Logging"),
        ("Grafana", "Dashboard"),
        ("Uptime Kuma", "Dashboard"),
    ]
    .iter()
    .map(|(name, category)| ServiceConfig::new(name, category))
    .collect()
}

/// `OPSDECK_<SECTION>__<KEY>` variables; a single `_` follows the prefix
fn env_overrides() -> Environment {
    Environment::with_prefix("OPSDECK")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Self::defaults()?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("OPSDECK_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (OPSDECK_BACKEND__BASE_URL, etc.)
            .add_source(env_overrides());

        builder.build()?.try_deserialize()
    }

    /// Load a single explicit file, still honouring environment overrides
    pub fn load_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        Self::defaults()?
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(env_overrides())
            .build()?
            .try_deserialize()
    }

    fn defaults() -> std::result::Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError>
    {
        Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("poller.mode", "aggregate")?
            .set_default("poller.interval_secs", default_poll_interval())?
            .set_default("poller.probe_timeout_ms", default_probe_timeout())?
            .set_default("notify.reconnect_delay_ms", default_reconnect_delay())?
            .set_default("notify.display_window_ms", default_display_window())?
            .set_default("backend.request_timeout_ms", default_request_timeout())
    }

    /// Parsed backend base address. Missing is a configuration error.
    pub fn base_url(&self) -> Result<Url> {
        let raw = self
            .backend
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                OpsdeckError::Configuration("backend.base_url is not set".to_string())
            })?;
        normalize_url(raw).map_err(|e| {
            OpsdeckError::Configuration(format!("invalid backend.base_url '{}': {}", raw, e))
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.request_timeout_ms)
    }

    /// Service descriptors in configured order
    pub fn descriptors(&self) -> Result<Vec<ServiceDescriptor>> {
        let raw = if self.services.is_empty() {
            default_services()
        } else {
            self.services.clone()
        };
        raw.iter().map(ServiceConfig::to_descriptor).collect()
    }

    /// Check invariants the components rely on
    pub fn validate(&self) -> Result<()> {
        if !(1..=300).contains(&self.poller.interval_secs) {
            return Err(OpsdeckError::Configuration(format!(
                "poller.interval_secs must be within 1..=300, got {}",
                self.poller.interval_secs
            )));
        }
        if self.poller.probe_timeout_ms == 0 {
            return Err(OpsdeckError::Configuration(
                "poller.probe_timeout_ms must be positive".to_string(),
            ));
        }
        if self.notify.display_window_ms == 0 {
            return Err(OpsdeckError::Configuration(
                "notify.display_window_ms must be positive".to_string(),
            ));
        }

        let descriptors = self.descriptors()?;
        let mut seen = HashSet::new();
        for d in &descriptors {
            if d.name.is_empty() || d.category.is_empty() {
                return Err(OpsdeckError::Configuration(
                    "service name and category must not be empty".to_string(),
                ));
            }
            if !seen.insert(d.name.clone()) {
                return Err(OpsdeckError::Configuration(format!(
                    "duplicate service name: {}",
                    d.name
                )));
            }
        }
        Ok(())
    }
}
