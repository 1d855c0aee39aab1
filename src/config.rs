//! Configuration management for Probeguard.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tracing::info;

use crate::error::{ProbeGuardError, Result};
use crate::ratelimit::{
    LimiterParams, DEFAULT_GAP_CEILING, DEFAULT_MAX_REQUESTS_PER_SECOND, DEFAULT_SMOOTHING_WEIGHT,
};

/// Prefix for environment variable overrides, e.g. `PROBEGUARD__SERVER__LISTEN_ADDR`.
pub const ENV_PREFIX: &str = "PROBEGUARD";

/// Main configuration for the Probeguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeGuardConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Prober backend configuration
    #[serde(default)]
    pub prober: ProberConfig,

    /// Rate limit policies keyed by config key
    #[serde(default)]
    pub rate_limits: HashMap<String, PolicyConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Peers allowed to set the client address via `X-Forwarded-For`
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trusted_proxies: Vec::new(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Prober backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProberConfig {
    /// Prober base URLs; one is picked at random per probe
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Prober module names per check type
    #[serde(default)]
    pub modules: ProbeModules,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_secs: default_timeout_secs(),
            modules: ProbeModules::default(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// Prober module names for each check route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeModules {
    #[serde(default = "default_xmpp_server")]
    pub xmpp_server: String,
    #[serde(default = "default_xmpps_server")]
    pub xmpps_server: String,
    #[serde(default = "default_xmpp_client")]
    pub xmpp_client: String,
    #[serde(default = "default_xmpps_client")]
    pub xmpps_client: String,
}

impl Default for ProbeModules {
    fn default() -> Self {
        Self {
            xmpp_server: default_xmpp_server(),
            xmpps_server: default_xmpps_server(),
            xmpp_client: default_xmpp_client(),
            xmpps_client: default_xmpps_client(),
        }
    }
}

fn default_xmpp_server() -> String {
    "xmpp_server".to_string()
}

fn default_xmpps_server() -> String {
    "xmpps_server".to_string()
}

fn default_xmpp_client() -> String {
    "xmpp_client".to_string()
}

fn default_xmpps_client() -> String {
    "xmpps_client".to_string()
}

/// One rate limit policy's options. Absent options take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Admission threshold
    #[serde(default)]
    pub max_requests_per_second: Option<f64>,

    /// Cap on a single observed gap before smoothing, in seconds
    #[serde(default)]
    pub gap_ceiling: Option<f64>,

    /// EMA weight on history, in [0, 1)
    #[serde(default)]
    pub smoothing_weight: Option<f64>,

    /// Size of the hash table
    #[serde(default)]
    pub bucket_count: Option<usize>,
}

impl PolicyConfig {
    /// Fill defaults and validate into limiter parameters.
    ///
    /// `bucket_count` is decided by the caller, which knows whether the
    /// policy pins its size.
    pub fn params(&self, bucket_count: usize) -> Result<LimiterParams> {
        LimiterParams::new(
            self.max_requests_per_second
                .unwrap_or(DEFAULT_MAX_REQUESTS_PER_SECOND),
            self.gap_ceiling.unwrap_or(DEFAULT_GAP_CEILING),
            self.smoothing_weight.unwrap_or(DEFAULT_SMOOTHING_WEIGHT),
            bucket_count,
        )
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ProbeGuardConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ProbeGuardError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load layered configuration: an optional file, then `PROBEGUARD__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }
        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("prober.endpoints")
                    .with_list_parse_key("server.trusted_proxies"),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Check settings that cannot be expressed through defaults.
    pub fn validate(&self) -> Result<()> {
        if self.prober.endpoints.is_empty() {
            return Err(ProbeGuardError::Config(
                "prober.endpoints must list at least one prober URL".to_string(),
            ));
        }
        if self.prober.timeout_secs == 0 {
            return Err(ProbeGuardError::Config(
                "prober.timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
