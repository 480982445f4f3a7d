/// Example: a listening component that executes commands.
///
/// The motor answers commands addressed to `motor_X`: `move_long` simulates
/// a three second movement with FDB progress reports, and `status_get`
/// reports TRUE or FALSE so repeat-until scripts have something to poll.
///
/// Start a relay first (`cargo run --bin cmdbus`), then this motor, then
/// drive it from a third terminal with the `run_script` example.
///
/// Run: cargo run --example motor
use std::time::Duration;

use async_trait::async_trait;
use cmdbus::client::{CommandHandler, FeedbackSender, HandlerResult};
use cmdbus::core::{now_ms, Envelope, Result};
use cmdbus::{BusClient, BusConfig};

struct Motor;

#[async_trait]
impl CommandHandler for Motor {
    async fn handle(
        &mut self,
        feedback: &mut FeedbackSender<'_>,
        command: &Envelope,
    ) -> HandlerResult {
        match command.command.as_str() {
            "move_long" => {
                for step in 1..=3 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let report = format!("Moving... {step}/3 sec");
                    println!("   ↳ {report}");
                    feedback.send(&report).await.map_err(|e| e.to_string())?;
                }
                Ok("Position Reached".to_string())
            }
            "status_get" => {
                // Toggles with the wall clock so repeat-until loops
                // eventually see TRUE.
                let ready = (now_ms() / 1000) % 2 == 0;
                Ok(if ready { "TRUE" } else { "FALSE" }.to_string())
            }
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Motor Component ===\n");

    let config = BusConfig::default().comp_type("motor_rig");
    let mut client = BusClient::connect(config).await?;

    let stop = client.stop_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        stop.stop();
    });

    println!("Online as 'motor_X', waiting for commands (Ctrl-C to stop)...\n");
    client.listen_and_process("motor_X", &mut Motor).await?;

    println!("\nMotor offline.");
    Ok(())
}
