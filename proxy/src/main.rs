use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use pggateway_proxy::config::Config;
use pggateway_proxy::plugins::PluginCatalog;
use pggateway_proxy::server::Server;

#[derive(Parser, Debug)]
#[clap(author, version, about = "PostgreSQL wire protocol gateway")]
struct Args {
    /// Config file path
    #[clap(short, long, env = "PGGATEWAY_CONFIG", default_value = "pggateway.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let mut server = Server::new(config, PluginCatalog::with_builtin_plugins());

    tokio::select! {
        result = server.start() => {
            if let Err(e) = &result {
                error!("Server failed: {}", e);
            }
            result.context("running gateway")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl+C")?;
            info!("Shutting down");
        }
    }

    server.close();
    server.wait_for_sessions().await;

    info!("Server stopped");

    Ok(())
}
