//! Per-listener plugin registry
//!
//! Holds the authentication chain and the logging fan-out for one listener.
//! Built once when the listener starts and shared by every session it spawns.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde_yaml::Mapping;

use super::{AuthenticationPlugin, LogContext, LogLevel, LoggingPlugin, PluginCatalog};
use crate::error::{GatewayError, Result};
use crate::session::Session;

/// Authentication chain and logging fan-out of one listener
pub struct PluginRegistry {
    /// Authentication plugins in evaluation order
    auth: Vec<(String, Box<dyn AuthenticationPlugin>)>,

    /// Logging plugins; the lock serialises fan-out across sessions
    logging: Mutex<Vec<(String, Box<dyn LoggingPlugin>)>>,
}

impl PluginRegistry {
    /// Create a registry from already constructed plugins
    pub fn new(
        auth: Vec<(String, Box<dyn AuthenticationPlugin>)>,
        logging: Vec<(String, Box<dyn LoggingPlugin>)>,
    ) -> Self {
        Self {
            auth,
            logging: Mutex::new(logging),
        }
    }

    /// Instantiate every configured plugin through `catalog`
    ///
    /// Unknown names and invalid settings are collected and reported as one
    /// configuration error.
    pub fn build(catalog: &PluginCatalog, authentication: &Mapping, logging: &Mapping) -> Result<Self> {
        let mut problems = Vec::new();

        let mut auth = Vec::with_capacity(authentication.len());
        for (key, settings) in authentication {
            let Some(name) = key.as_str() else {
                problems.push(format!("authentication plugin name {:?} is not a string", key));
                continue;
            };
            match catalog.create_auth_plugin(name, settings) {
                Ok(plugin) => auth.push((name.to_string(), plugin)),
                Err(e) => problems.push(config_problem(e)),
            }
        }

        let mut loggers = Vec::with_capacity(logging.len());
        for (key, settings) in logging {
            let Some(name) = key.as_str() else {
                problems.push(format!("logging plugin name {:?} is not a string", key));
                continue;
            };
            match catalog.create_logging_plugin(name, settings) {
                Ok(plugin) => loggers.push((name.to_string(), plugin)),
                Err(e) => problems.push(config_problem(e)),
            }
        }

        if !problems.is_empty() {
            return Err(GatewayError::Config(problems.join("; ")));
        }

        Ok(Self::new(auth, loggers))
    }

    /// Names of the authentication plugins in evaluation order
    pub fn auth_plugin_names(&self) -> Vec<&str> {
        self.auth.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Run the authentication chain for `session`
    ///
    /// The first plugin reporting success wins, a plugin reporting `false`
    /// is skipped and the first error aborts the chain.
    pub async fn authenticate(&self, session: &mut Session) -> Result<bool> {
        for (name, plugin) in &self.auth {
            let accepted = plugin.authenticate(session).await?;
            if accepted {
                self.debug(&session.log_context(), &format!("authenticated by {}", name));
                return Ok(true);
            }
            self.debug(&session.log_context(), &format!("{} skipped session", name));
        }
        Ok(false)
    }

    /// Send an event to every logging plugin
    pub fn log(&self, level: LogLevel, context: &LogContext, message: &str) {
        // A plugin that panicked mid-write leaves nothing inconsistent behind
        let mut plugins = self.logging.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, plugin) in plugins.iter_mut() {
            plugin.log(level, context, message);
        }
    }

    /// Whether any logging plugin records events at `level`
    pub fn enabled(&self, level: LogLevel) -> bool {
        let plugins = self.logging.lock().unwrap_or_else(PoisonError::into_inner);
        plugins.iter().any(|(_, plugin)| plugin.enabled(level))
    }

    /// Log at debug level
    pub fn debug(&self, context: &LogContext, message: &str) {
        self.log(LogLevel::Debug, context, message);
    }

    /// Log at info level
    pub fn info(&self, context: &LogContext, message: &str) {
        self.log(LogLevel::Info, context, message);
    }

    /// Log at warn level
    pub fn warn(&self, context: &LogContext, message: &str) {
        self.log(LogLevel::Warn, context, message);
    }

    /// Log at error level
    pub fn error(&self, context: &LogContext, message: &str) {
        self.log(LogLevel::Error, context, message);
    }

    /// Log at fatal level
    pub fn fatal(&self, context: &LogContext, message: &str) {
        self.log(LogLevel::Fatal, context, message);
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("auth", &self.auth_plugin_names())
            .finish_non_exhaustive()
    }
}

fn config_problem(error: GatewayError) -> String {
    match error {
        GatewayError::Config(message) => message,
        other => other.to_string(),
    }
}
