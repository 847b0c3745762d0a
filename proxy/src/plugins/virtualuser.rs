//! Virtual-user authentication
//!
//! Clients log in as virtual users whose credentials live in the gateway
//! configuration. Once verified, the gateway logs in to the target with one
//! real upstream role, whatever method the server asks for.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use pggateway_core::StoredCredentials;
use serde::Deserialize;

use super::AuthenticationPlugin;
use crate::config::TargetConfig;
use crate::error::{GatewayError, PolicyViolation, Result};
use crate::session::Session;
use crate::tls::TlsConnector;

const SCRAM_PREFIX: &str = "SCRAM-SHA-256$";
const MD5_PREFIX: &str = "md5";

/// Settings of the virtual-user plugin
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualUserConfig {
    /// Virtual user name -> stored credential
    #[serde(alias = "virtualusers")]
    pub users: BTreeMap<String, String>,

    /// Upstream server and the real role used there
    #[serde(alias = "db")]
    pub target: TargetConfig,
}

/// A parsed stored credential
///
/// The prefix of the configured string selects the mechanism:
/// `SCRAM-SHA-256$` for SCRAM, `md5` for salted MD5, anything else is a
/// plaintext password.
#[derive(Clone, PartialEq, Eq)]
pub enum StoredSecret {
    /// Compared byte for byte
    Plaintext(String),
    /// `md5<hex>`
    Md5(String),
    /// SCRAM-SHA-256 verifier
    Scram(StoredCredentials),
}

impl StoredSecret {
    /// Classify and validate a configured credential string
    pub fn parse(secret: &str) -> Result<Self> {
        if secret.starts_with(SCRAM_PREFIX) {
            Ok(StoredSecret::Scram(StoredCredentials::parse(secret)?))
        } else if secret.starts_with(MD5_PREFIX) {
            Ok(StoredSecret::Md5(secret.to_string()))
        } else {
            Ok(StoredSecret::Plaintext(secret.to_string()))
        }
    }

    /// Short mechanism name
    pub fn mechanism(&self) -> &'static str {
        match self {
            StoredSecret::Plaintext(_) => "plaintext",
            StoredSecret::Md5(_) => "md5",
            StoredSecret::Scram(_) => "scram-sha-256",
        }
    }
}

impl fmt::Debug for StoredSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoredSecret({}, redacted)", self.mechanism())
    }
}

/// Verifies virtual users and logs in upstream as a real role
pub struct VirtualUserPlugin {
    users: BTreeMap<String, StoredSecret>,
    target: TargetConfig,
    upstream_user: String,
    upstream_password: String,
    upstream_ssl: bool,
    connector: TlsConnector,
}

impl VirtualUserPlugin {
    /// Create the plugin, parsing every stored credential up front
    pub fn new(config: VirtualUserConfig) -> Result<Self> {
        let mut problems = Vec::new();

        let upstream_user = match &config.target.user {
            Some(user) if !user.is_empty() => user.clone(),
            _ => {
                problems.push("target.user is required".to_string());
                String::new()
            }
        };
        if config.users.is_empty() {
            problems.push("at least one virtual user is required".to_string());
        }

        let mut users = BTreeMap::new();
        for (name, secret) in &config.users {
            match StoredSecret::parse(secret) {
                Ok(parsed) => {
                    users.insert(name.clone(), parsed);
                }
                Err(e) => problems.push(format!("user {:?}: {}", name, e)),
            }
        }

        if !problems.is_empty() {
            return Err(GatewayError::Config(format!(
                "virtualuser-authentication: {}",
                problems.join(", ")
            )));
        }

        let connector = match &config.target.ca_certificate {
            Some(path) => TlsConnector::with_ca(path)?,
            None => TlsConnector::new_insecure()?,
        };

        Ok(Self {
            users,
            upstream_user,
            upstream_password: config.target.password.clone().unwrap_or_default(),
            upstream_ssl: config.target.ssl.unwrap_or(true),
            target: config.target,
            connector,
        })
    }

    /// Whether `user` is a configured virtual user
    pub fn has_user(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }
}

impl fmt::Debug for VirtualUserPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualUserPlugin")
            .field("users", &self.users.keys().collect::<Vec<_>>())
            .field("target", &self.target.address())
            .field("upstream_user", &self.upstream_user)
            .field("upstream_ssl", &self.upstream_ssl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthenticationPlugin for VirtualUserPlugin {
    async fn authenticate(&self, session: &mut Session) -> Result<bool> {
        // An unknown user ends the chain; later plugins never see it
        let Some(secret) = self.users.get(session.user()) else {
            return Err(GatewayError::Auth(format!("virtual user {} does not exist", session.user())));
        };

        match secret {
            StoredSecret::Scram(credentials) => session.authenticate_client_scram(credentials).await?,
            StoredSecret::Md5(stored) => session.authenticate_client_md5(stored).await?,
            StoredSecret::Plaintext(stored) => session.authenticate_client_plaintext(stored).await?,
        }

        let database = session.database();
        if !self.target.database_allowed(database) {
            return Err(GatewayError::Policy(PolicyViolation::UnknownDatabase(database.to_string())));
        }

        session
            .dial(&self.target, &self.connector, self.upstream_ssl)
            .await?;
        session
            .auth_on_server(&self.upstream_user, &self.upstream_password)
            .await?;
        Ok(true)
    }
}
