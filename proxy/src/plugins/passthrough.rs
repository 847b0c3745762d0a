//! Passthrough authentication
//!
//! Performs no credential check of its own: the client's startup packet is
//! forwarded to a fixed target and the real server's authentication exchange
//! is relayed to the client.

use async_trait::async_trait;
use serde::Deserialize;

use super::AuthenticationPlugin;
use crate::config::TargetConfig;
use crate::error::{GatewayError, PolicyViolation, Result};
use crate::session::Session;
use crate::tls::TlsConnector;

/// Settings of the passthrough plugin
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassthroughConfig {
    /// Server every session is forwarded to
    pub target: TargetConfig,
}

/// Forwards clients to one upstream server unchanged
#[derive(Debug)]
pub struct PassthroughPlugin {
    target: TargetConfig,
    connector: TlsConnector,
}

impl PassthroughPlugin {
    /// Create the plugin from its settings
    pub fn new(config: PassthroughConfig) -> Result<Self> {
        if config.target.host.is_empty() {
            return Err(GatewayError::Config("passthrough: target.host is required".to_string()));
        }
        if config.target.user.is_some() || config.target.password.is_some() {
            return Err(GatewayError::Config(
                "passthrough: target.user and target.password are not used; the client authenticates with the server"
                    .to_string(),
            ));
        }

        let connector = match &config.target.ca_certificate {
            Some(path) => TlsConnector::with_ca(path)?,
            None => TlsConnector::new_insecure()?,
        };

        Ok(Self {
            target: config.target,
            connector,
        })
    }
}

#[async_trait]
impl AuthenticationPlugin for PassthroughPlugin {
    async fn authenticate(&self, session: &mut Session) -> Result<bool> {
        let database = session.database();
        if !self.target.database_allowed(database) {
            return Err(GatewayError::Policy(PolicyViolation::UnknownDatabase(database.to_string())));
        }

        let ssl = self.target.ssl.unwrap_or_else(|| session.is_encrypted());
        session.dial(&self.target, &self.connector, ssl).await?;
        session.forward_startup().await?;
        Ok(true)
    }
}
