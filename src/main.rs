use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cmdbus::{CommandStatus, RelayConfig, RelayServer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "cmdbus")]
#[command(about = "Command bus relay daemon")]
struct Cli {
    /// Interface to bind on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port the relay publishes on; clients subscribe here
    #[arg(long, default_value_t = 5555)]
    outbound_port: u16,

    /// Port the relay receives on; clients publish here
    #[arg(long, default_value_t = 5556)]
    inbound_port: u16,

    /// Seconds a finished command stays visible in the queue
    #[arg(long, default_value_t = 10)]
    finished_grace_secs: u64,

    /// Serve the HTTP monitor on this address, e.g. 127.0.0.1:8080
    #[arg(long)]
    monitor: Option<String>,

    /// Seconds between queue summary log lines; 0 disables them
    #[arg(long, default_value_t = 30)]
    summary_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = RelayConfig::new(&cli.host)
        .outbound_port(cli.outbound_port)
        .inbound_port(cli.inbound_port)
        .finished_grace(Duration::from_secs(cli.finished_grace_secs));

    let relay = RelayServer::bind(config)
        .await
        .context("failed to start relay")?;
    let handle = relay.handle();

    if let Some(monitor_addr) = cli.monitor.clone() {
        let monitor_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = cmdbus::web::serve(&monitor_addr, monitor_handle).await {
                error!("monitor failed: {e}");
            }
        });
    }

    if cli.summary_interval_secs > 0 {
        let summary_handle = handle.clone();
        let interval = Duration::from_secs(cli.summary_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if summary_handle.is_stopped() {
                    return;
                }
                match summary_handle.snapshot() {
                    Ok(rows) => {
                        let pending = rows
                            .iter()
                            .filter(|row| row.status == CommandStatus::Pending)
                            .count();
                        let running = rows
                            .iter()
                            .filter(|row| row.status == CommandStatus::Running)
                            .count();
                        let finished = rows.len() - pending - running;
                        info!(pending, running, finished, "command queue");
                    }
                    Err(e) => {
                        error!("queue summary failed: {e}");
                        return;
                    }
                }
            }
        });
    }

    let stop_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        stop_handle.stop();
    });

    relay.run().await.context("relay error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cmdbus=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install ctrl+c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
