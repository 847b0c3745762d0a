//! Server: the set of listeners of one gateway process

use std::io;
use std::sync::Arc;

use log::{error, info};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::listener::Listener;
use crate::plugins::PluginCatalog;

/// Owns every listener and starts and stops them together
pub struct Server {
    config: Config,
    catalog: PluginCatalog,
    listeners: Vec<Arc<Listener>>,
}

impl Server {
    /// Create a server; nothing is bound until [`start`](Self::start)
    pub fn new(config: Config, catalog: PluginCatalog) -> Self {
        Self {
            config,
            catalog,
            listeners: Vec::new(),
        }
    }

    /// Server configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Listeners bound by the last call to [`start`](Self::start)
    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    /// Bind every listener and run their accept loops
    ///
    /// Fails before accepting anything if a listener cannot bind or build its
    /// plugins. Otherwise runs until every listener is closed or one fails.
    pub async fn start(&mut self) -> Result<()> {
        let mut listeners = Vec::with_capacity(self.config.listeners.len());
        for listener_config in &self.config.listeners {
            let mut listener = Listener::new(listener_config.clone(), self.config.logging.clone());
            listener.listen(&self.catalog).await.map_err(|e| {
                error!("failed to start listener {}: {}", listener_config.bind, e);
                e
            })?;
            listeners.push(Arc::new(listener));
        }
        self.listeners = listeners.clone();
        info!("gateway started with {} listener(s)", listeners.len());

        let mut accept_loops = JoinSet::new();
        for listener in listeners {
            accept_loops.spawn(async move { listener.handle().await });
        }

        while let Some(joined) = accept_loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(GatewayError::Io(io::Error::new(io::ErrorKind::Other, e))),
            }
        }
        Ok(())
    }

    /// Stop accepting on every listener
    pub fn close(&self) {
        for listener in &self.listeners {
            listener.close();
        }
    }

    /// Wait for the sessions of every closed listener to finish
    pub async fn wait_for_sessions(&self) {
        for listener in &self.listeners {
            listener.wait_for_sessions().await;
        }
    }
}
