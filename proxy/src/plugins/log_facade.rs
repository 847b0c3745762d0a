//! Logging plugin that forwards registry events to the `log` facade

use log::{log, log_enabled, Level};
use serde::Deserialize;

use super::{LogContext, LogLevel, LoggingPlugin};
use crate::error::Result;

/// Settings of the `log` plugin
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogFacadeConfig {
    /// Minimum level forwarded; everything when absent
    pub level: Option<ConfiguredLevel>,
}

/// Level names accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfiguredLevel {
    /// debug
    Debug,
    /// info
    Info,
    /// warn
    Warn,
    /// error
    Error,
    /// fatal
    Fatal,
}

impl From<ConfiguredLevel> for LogLevel {
    fn from(level: ConfiguredLevel) -> Self {
        match level {
            ConfiguredLevel::Debug => LogLevel::Debug,
            ConfiguredLevel::Info => LogLevel::Info,
            ConfiguredLevel::Warn => LogLevel::Warn,
            ConfiguredLevel::Error => LogLevel::Error,
            ConfiguredLevel::Fatal => LogLevel::Fatal,
        }
    }
}

/// Writes session events through `log`, with the context rendered as JSON
#[derive(Debug)]
pub struct LogFacadePlugin {
    min_level: LogLevel,
}

impl LogFacadePlugin {
    /// Create the plugin from its settings
    pub fn new(config: LogFacadeConfig) -> Result<Self> {
        Ok(Self {
            min_level: config.level.map(LogLevel::from).unwrap_or(LogLevel::Debug),
        })
    }

    /// Whether events at `level` pass the configured minimum
    pub fn accepts(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }
}

fn facade_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Debug => Level::Debug,
        LogLevel::Info => Level::Info,
        LogLevel::Warn => Level::Warn,
        LogLevel::Error | LogLevel::Fatal => Level::Error,
    }
}

impl LoggingPlugin for LogFacadePlugin {
    fn log(&mut self, level: LogLevel, context: &LogContext, message: &str) {
        if !self.enabled(level) {
            return;
        }

        let target_level = facade_level(level);

        let fatal = if level == LogLevel::Fatal { "FATAL " } else { "" };
        if context.is_empty() {
            log!(target: "pggateway::session", target_level, "{}{}", fatal, message);
        } else {
            let rendered = serde_json::to_string(context).unwrap_or_default();
            log!(target: "pggateway::session", target_level, "{}{} {}", fatal, message, rendered);
        }
    }

    fn enabled(&self, level: LogLevel) -> bool {
        self.accepts(level) && log_enabled!(target: "pggateway::session", facade_level(level))
    }
}
