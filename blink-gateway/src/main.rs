//! Blink Gateway entry point
//!
//! Reads `device.prop` (or `$BLINK_GATEWAY_CONFIG`), connects the gateway and
//! publishes blink events every second until Ctrl+C / SIGTERM.

use anyhow::{Context, Result};
use blink_gateway::config::resolve_config_path;
use blink_gateway::metrics::system_name;
use blink_gateway::{initialize, Publisher, SysinfoMetrics};
use std::io::IsTerminal;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status for any startup failure
const STARTUP_FAILURE: i32 = -1;

#[tokio::main]
async fn main() {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("blink_gateway=info")),
        )
        // stdout carries the startup line only
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let config_path = resolve_config_path();
    let gateway = match initialize(&config_path)
        .await
        .with_context(|| format!("Failed to start gateway from {}", config_path.display()))
    {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(STARTUP_FAILURE);
        }
    };

    println!("{}", startup_line(&gateway.config.client_id()));
    info!("Publishing as {}", gateway.config.client_id());

    if let Err(e) = run(gateway).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn startup_line(client_id: &str) -> String {
    format!("Gateway started ({client_id})")
}

async fn run(gateway: blink_gateway::Initialized<blink_gateway::MqttGatewaySession>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_shutdown(shutdown_tx));

    let publisher = Publisher::new(
        gateway.session,
        SysinfoMetrics::new(),
        gateway.settings,
        system_name(),
    );

    let report = publisher
        .run(shutdown_rx)
        .await
        .context("Publisher execution failed")?;

    info!(
        "Gateway stopped: {} cycles, {} events published",
        report.cycles, report.published
    );
    Ok(())
}

/// Flip the shutdown channel on Ctrl+C or SIGTERM
async fn wait_for_shutdown(shutdown: watch::Sender<bool>) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }

    let _ = shutdown.send(true);
    // sender must outlive the publisher loop
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_line() {
        let line = startup_line("g:abc123:gwType:G1");
        assert!(line.starts_with("Gateway started"));
        assert!(line.contains("g:abc123:gwType:G1"));
    }
}
