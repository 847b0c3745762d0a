//! Configuration for the gateway
//!
//! The configuration file is YAML. Plugin sections are kept as ordered
//! [`Mapping`]s so that authentication plugins run in the order they appear
//! in the file, and each plugin parses its own settings into a typed struct.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Mapping;

use crate::error::{GatewayError, Result};

/// Default PostgreSQL port for upstream targets
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;

/// Allow-list entry that matches every database
pub const ANY_DATABASE: &str = "*";

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Logging plugins used by listeners that do not configure their own
    #[serde(default)]
    pub logging: Mapping,

    /// Listeners to start
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

/// One bound address and its policy
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Address to bind, `host:port`
    pub bind: String,

    /// Client-facing TLS
    #[serde(default)]
    pub ssl: SslConfig,

    /// Databases clients may request; empty allows all
    #[serde(default)]
    pub databases: Vec<String>,

    /// Logging plugin name -> settings
    #[serde(default)]
    pub logging: Mapping,

    /// Authentication plugin name -> settings, evaluated in this order
    #[serde(default)]
    pub authentication: Mapping,
}

/// Client-facing TLS settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslConfig {
    /// Answer SSLRequest with 'S' and upgrade
    #[serde(default)]
    pub enabled: bool,

    /// Refuse clients that do not request TLS
    #[serde(default)]
    pub required: bool,

    /// PEM certificate chain
    pub certificate: Option<PathBuf>,

    /// PEM private key
    pub key: Option<PathBuf>,
}

/// Upstream PostgreSQL server used by an authentication plugin
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Host name or address
    pub host: String,

    /// Port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upstream role (required by plugins that log in on the client's behalf)
    pub user: Option<String>,

    /// Upstream password
    pub password: Option<String>,

    /// Whether to require TLS towards the upstream
    pub ssl: Option<bool>,

    /// CA bundle used to verify the upstream certificate; unverified when absent
    pub ca_certificate: Option<PathBuf>,

    /// Databases this target serves; empty allows all
    #[serde(default)]
    pub databases: Vec<String>,
}

fn default_port() -> u16 {
    DEFAULT_POSTGRES_PORT
}

impl TargetConfig {
    /// `host:port` of the target
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the target serves `database`
    pub fn database_allowed(&self, database: &str) -> bool {
        database_allowed(&self.databases, database)
    }
}

/// Whether `database` passes an allow-list; an empty list allows everything
pub fn database_allowed(allowed: &[String], database: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|entry| entry == ANY_DATABASE || entry == database)
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate YAML configuration
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| GatewayError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the structural rules serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            return Err(GatewayError::Config("at least one listener is required".to_string()));
        }

        let problems: Vec<String> = self
            .listeners
            .iter()
            .flat_map(|listener| {
                listener
                    .problems()
                    .into_iter()
                    .map(move |problem| format!("listener {}: {}", listener.bind, problem))
            })
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Config(problems.join("; ")))
        }
    }
}

impl ListenerConfig {
    /// Create a listener configuration with no TLS and no plugins
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            ssl: SslConfig::default(),
            databases: Vec::new(),
            logging: Mapping::new(),
            authentication: Mapping::new(),
        }
    }

    /// Every rule this listener breaks
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.bind.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => problems.push(format!("bind address {:?} must be host:port", self.bind)),
        }
        if self.ssl.enabled && (self.ssl.certificate.is_none() || self.ssl.key.is_none()) {
            problems.push("ssl.enabled requires ssl.certificate and ssl.key".to_string());
        }
        if self.ssl.required && !self.ssl.enabled {
            problems.push("ssl.required requires ssl.enabled".to_string());
        }
        if self.authentication.is_empty() {
            problems.push("at least one authentication plugin is required".to_string());
        }

        problems
    }

    /// Whether clients may request `database`
    pub fn database_allowed(&self, database: &str) -> bool {
        database_allowed(&self.databases, database)
    }
}
