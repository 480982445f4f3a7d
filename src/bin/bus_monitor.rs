use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use cmdbus::core::Envelope;
use cmdbus::transport::{BusSubscriber, TcpSubscriber};

/// Tap the bus and print every relayed message.
///
/// Connects to the relay's outbound port like any other subscriber, so it
/// sees exactly what the clients see.
#[derive(Parser)]
#[command(name = "bus-monitor")]
#[command(about = "Print every message flowing through a command bus relay")]
struct Cli {
    /// Relay host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Relay outbound port
    #[arg(long, default_value_t = 5555)]
    outbound_port: u16,

    /// Also append every line to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

const POLL: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let addr = format!("{}:{}", cli.host, cli.outbound_port);
    let mut subscriber = TcpSubscriber::connect(&addr, CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("failed to subscribe to {addr}"))?;

    let mut log_file = match &cli.log_file {
        Some(path) => Some(
            File::create(path)
                .with_context(|| format!("failed to create log file '{}'", path.display()))?,
        ),
        None => None,
    };

    println!("Monitoring bus on {addr}...");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Monitor stopped.");
                return Ok(());
            }
            result = subscriber.recv_timeout(POLL) => {
                let Some(payload) = result.context("bus connection lost")? else {
                    continue;
                };
                let line = describe(&payload);
                println!("{line}");
                if let Some(file) = log_file.as_mut() {
                    writeln!(file, "{line}").context("failed to write log file")?;
                    file.flush().context("failed to flush log file")?;
                }
            }
        }
    }
}

fn describe(payload: &[u8]) -> String {
    let timestamp = Local::now().format("%H:%M:%S");
    match Envelope::decode(payload) {
        Ok(envelope) => format!("[{timestamp}] {envelope}"),
        Err(_) => format!("[{timestamp}] raw: {}", String::from_utf8_lossy(payload)),
    }
}
