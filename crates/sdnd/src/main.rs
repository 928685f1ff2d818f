//! sdnd entry point.
//!
//! Startup order: logging, configuration, cluster store, switch session,
//! integration bridge, command core, membership listener, control surface.

use anyhow::{Context, Result};
use clap::Parser;
use sdnd::{open_store, Args, Daemon, DaemonConfig, StaticMembership};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("sdnd: Starting SDN control-plane daemon v{}", sdnd::VERSION);

    match run_daemon(&args).await {
        Ok(()) => {
            info!("sdnd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "sdnd: Daemon exiting with error");
            Err(e)
        }
    }
}

/// `RUST_LOG` wins over `--log-level`.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level '{}'", level))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")?;
    Ok(())
}

async fn run_daemon(args: &Args) -> Result<()> {
    let config = DaemonConfig::load(args).context("Failed to load configuration")?;
    info!(
        listen = %config.listen,
        switch = %config.switch.endpoint,
        store = %config.store,
        bridge = %config.bridge.bridge_name,
        "sdnd: Configuration loaded"
    );

    let store = open_store(&config.store)
        .await
        .context("Failed to open cluster store")?;
    let endpoint = config.switch.endpoint()?;
    let agent = Arc::new(StaticMembership::new(config.local_address()));

    let daemon = Daemon::start(&config, &endpoint, store, agent)
        .await
        .context("Failed to start daemon")?;

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    let shutdown = daemon.shutdown_token();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("sdnd: Received shutdown signal");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "sdnd: Failed to listen for shutdown signal"),
        }
    });

    let served = daemon.serve(listener).await;
    daemon.shutdown().await;
    served.context("Control surface failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["sdnd"]);
        assert_eq!(args.log_level, "info");
        assert!(args.config.is_none());

        let config = DaemonConfig::load(&args).unwrap();
        assert_eq!(config.listen.to_string(), "127.0.0.1:6675");
    }
}
