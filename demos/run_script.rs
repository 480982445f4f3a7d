/// Example: a commander script driving the motor component.
///
/// Mirrors a small test-bench script: one long running command whose FDB
/// progress is printed as it arrives, then a repeat-until poll that blocks
/// the script until the motor reports TRUE.
///
/// Start a relay (`cargo run --bin cmdbus`) and the `motor` example first.
///
/// Run: cargo run --example run_script
use cmdbus::core::Result;
use cmdbus::{BusClient, BusConfig};

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Script Runner ===\n");

    let config = BusConfig::default().comp_type("script_runner");
    let mut client = BusClient::connect(config).await?;

    println!("--- TEST 1: long running command with feedback ---");
    let reply = client
        .send_command_with("motor_X", "move_long", "", "", |feedback| {
            println!("   progress: {}", feedback.reply);
        })
        .await?;
    match reply {
        Some(reply) => println!("Final result: {}\n", reply.reply),
        None => println!("Command timed out or failed.\n"),
    }

    println!("--- TEST 2: repeat until TRUE ---");
    let success = client
        .send_command_until("motor_X", "status_get", "TRUE")
        .await?;
    if success {
        println!("Script continued after receiving TRUE.");
    } else {
        println!("Script aborted (timeout).");
    }

    Ok(())
}
