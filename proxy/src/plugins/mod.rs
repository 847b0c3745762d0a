//! Authentication and logging plugins
//!
//! Plugins are constructed from their configuration section through a
//! [`PluginCatalog`], an explicit name -> factory table the host fills at
//! startup (see [`register_builtin_plugins`]). A listener turns its
//! configuration into a [`PluginRegistry`] using that catalog.

mod log_facade;
mod passthrough;
mod registry;
mod virtualuser;

pub use log_facade::{ConfiguredLevel, LogFacadeConfig, LogFacadePlugin};
pub use passthrough::{PassthroughConfig, PassthroughPlugin};
pub use registry::PluginRegistry;
pub use virtualuser::{StoredSecret, VirtualUserConfig, VirtualUserPlugin};

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::{GatewayError, Result};
use crate::session::Session;

/// Name of the passthrough authentication plugin
pub const PASSTHROUGH_PLUGIN: &str = "passthrough";

/// Name of the virtual-user authentication plugin
pub const VIRTUALUSER_PLUGIN: &str = "virtualuser-authentication";

/// Name of the logging plugin that forwards to the `log` facade
pub const LOG_FACADE_PLUGIN: &str = "log";

/// Decides whether a session may proceed and, if so, connects it upstream
#[async_trait]
pub trait AuthenticationPlugin: Send + Sync {
    /// Authenticate the client on `session`
    ///
    /// `Ok(true)` means the client is verified and the upstream connection is
    /// ready for proxying. `Ok(false)` means this plugin does not handle the
    /// session and the next one should be tried; it must only be returned
    /// before anything was exchanged with the client.
    async fn authenticate(&self, session: &mut Session) -> Result<bool>;
}

/// Receives structured log events
///
/// Implementations are only ever called with the registry's log lock held,
/// so they need not be `Sync`.
pub trait LoggingPlugin: Send {
    /// Record one event
    fn log(&mut self, level: LogLevel, context: &LogContext, message: &str);

    /// Whether events at `level` would be recorded
    fn enabled(&self, _level: LogLevel) -> bool {
        true
    }
}

/// Severity of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Per-message tracing
    Debug,
    /// Normal lifecycle events
    Info,
    /// Recoverable problems
    Warn,
    /// Failed sessions and listeners
    Error,
    /// Failures that stop the process
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Key/value context attached to a log event
pub type LogContext = BTreeMap<String, serde_json::Value>;

/// Builds an authentication plugin from its configuration section
pub type AuthPluginFactory = Box<dyn Fn(&serde_yaml::Value) -> Result<Box<dyn AuthenticationPlugin>> + Send + Sync>;

/// Builds a logging plugin from its configuration section
pub type LoggingPluginFactory = Box<dyn Fn(&serde_yaml::Value) -> Result<Box<dyn LoggingPlugin>> + Send + Sync>;

/// Name -> factory table for every plugin the process can instantiate
#[derive(Default)]
pub struct PluginCatalog {
    auth: HashMap<String, AuthPluginFactory>,
    logging: HashMap<String, LoggingPluginFactory>,
}

impl PluginCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog holding the built-in plugins
    pub fn with_builtin_plugins() -> Self {
        let mut catalog = Self::new();
        register_builtin_plugins(&mut catalog);
        catalog
    }

    /// Register an authentication plugin factory, replacing any with the same name
    pub fn register_auth_plugin<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&serde_yaml::Value) -> Result<Box<dyn AuthenticationPlugin>> + Send + Sync + 'static,
    {
        self.auth.insert(name.to_string(), Box::new(factory));
    }

    /// Register a logging plugin factory, replacing any with the same name
    pub fn register_logging_plugin<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&serde_yaml::Value) -> Result<Box<dyn LoggingPlugin>> + Send + Sync + 'static,
    {
        self.logging.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiate an authentication plugin
    pub fn create_auth_plugin(&self, name: &str, settings: &serde_yaml::Value) -> Result<Box<dyn AuthenticationPlugin>> {
        let factory = self
            .auth
            .get(name)
            .ok_or_else(|| GatewayError::Config(format!("unknown authentication plugin {:?}", name)))?;
        factory(settings)
    }

    /// Instantiate a logging plugin
    pub fn create_logging_plugin(&self, name: &str, settings: &serde_yaml::Value) -> Result<Box<dyn LoggingPlugin>> {
        let factory = self
            .logging
            .get(name)
            .ok_or_else(|| GatewayError::Config(format!("unknown logging plugin {:?}", name)))?;
        factory(settings)
    }

    /// Registered authentication plugin names, sorted
    pub fn auth_plugin_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.auth.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("auth", &self.auth_plugin_names())
            .field("logging", &self.logging.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Register the plugins that ship with the gateway
pub fn register_builtin_plugins(catalog: &mut PluginCatalog) {
    catalog.register_auth_plugin(PASSTHROUGH_PLUGIN, |settings| {
        let config: PassthroughConfig = parse_settings(PASSTHROUGH_PLUGIN, settings)?;
        Ok(Box::new(PassthroughPlugin::new(config)?))
    });
    catalog.register_auth_plugin(VIRTUALUSER_PLUGIN, |settings| {
        let config: VirtualUserConfig = parse_settings(VIRTUALUSER_PLUGIN, settings)?;
        Ok(Box::new(VirtualUserPlugin::new(config)?))
    });
    catalog.register_logging_plugin(LOG_FACADE_PLUGIN, |settings| {
        let config: LogFacadeConfig = parse_settings(LOG_FACADE_PLUGIN, settings)?;
        Ok(Box::new(LogFacadePlugin::new(config)?))
    });
}

/// Deserialize a plugin's settings into its typed configuration
///
/// A missing (`null`) section is treated as an empty mapping.
pub fn parse_settings<T: DeserializeOwned>(plugin: &str, settings: &serde_yaml::Value) -> Result<T> {
    let settings = match settings {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
        other => other.clone(),
    };
    serde_yaml::from_value(settings).map_err(|e| GatewayError::Config(format!("plugin {:?}: {}", plugin, e)))
}
