//! Gateway node binary.
//!
//! Loads the connector configuration, starts every connector against a shared
//! managed connection registry, and on shutdown stops the connectors so that
//! each session is closed once its last connector is gone.

use clap::Parser;
use gateway_connection::ConnectionRegistry;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod connector;
mod logging;

use config::GatewayConfig;
use connector::{Connector, TcpSession};
use logging::GatewayLogFormatter;

/// Industrial data gateway node
#[derive(Parser, Debug)]
#[command(name = "oibus-gateway", version, about = "Industrial data gateway node")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Deadline for opening a session, e.g. 10s (overrides the config file)
    #[arg(long)]
    create_timeout: Option<humantime::Duration>,

    /// Deadline for closing a session, e.g. 5s (overrides the config file)
    #[arg(long)]
    close_timeout: Option<humantime::Duration>,

    /// Stop after this long instead of waiting for Ctrl-C, e.g. 30s
    #[arg(long)]
    run_for: Option<humantime::Duration>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("oibus_gateway={}", args.log_level).parse()?)
        .add_directive(format!("gateway_connection={}", args.log_level).parse()?);

    let formatter = GatewayLogFormatter::new("gateway".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting OIBus gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = GatewayConfig::load_from_file(&args.config)?;
    config.connection.override_timeouts(
        args.create_timeout.map(Duration::from),
        args.close_timeout.map(Duration::from),
    )?;

    let registry: Arc<ConnectionRegistry<TcpSession>> =
        Arc::new(ConnectionRegistry::with_timeouts(config.connection.timeouts()));

    let connectors = config
        .connectors
        .iter()
        .cloned()
        .map(|connector| Connector::start(registry.clone(), connector).map(Arc::new))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if connectors.is_empty() {
        warn!("No connector configured, waiting for shutdown");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks: Vec<_> = connectors
        .iter()
        .map(|connector| {
            let connector = connector.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move { connector.run(shutdown_rx).await })
        })
        .collect();

    wait_for_shutdown(args.run_for.map(Duration::from)).await;
    info!("Shutting down {} connector(s)", connectors.len());
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Connector task ended abnormally: {}", e);
        }
    }

    let mut failures = 0;
    for connector in &connectors {
        if let Err(e) = connector.stop().await {
            error!("Failed to stop connector {}: {:#}", connector.id(), e);
            failures += 1;
        }
    }

    if failures > 0 {
        anyhow::bail!("{} connector(s) could not close their session", failures);
    }
    info!("Gateway stopped");
    Ok(())
}

async fn wait_for_shutdown(run_for: Option<Duration>) {
    let deadline = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Received Ctrl-C");
        }
        _ = deadline => info!("Run duration elapsed"),
    }
}
