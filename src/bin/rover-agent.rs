//! rover-agent entry point.
//!
//! Connects a simulated rover to a rover-link server and keeps the link
//! alive until Ctrl-C. Lines typed on stdin are executed as local
//! commands and reported to the server.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use rover_link::agent::{self, SimulatedBridge};
use rover_link::config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env();
    tracing::info!(
        rover_id = %config.rover_id,
        server_url = %config.server_url,
        telemetry_ms = config.telemetry_interval.as_millis(),
        reconnect_ms = config.reconnect_interval.as_millis(),
        "starting rover-agent"
    );

    let handle = agent::spawn(config, SimulatedBridge::default());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                tracing::info!("shutdown signal received");
                break;
            }
            line = stdin.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) if !line.trim().is_empty() => {
                        if !handle.local_command(line.trim()).await {
                            break;
                        }
                    }
                    Some(_) => {}
                    // stdin closed: keep running until ctrl-c.
                    None => {
                        tokio::signal::ctrl_c()
                            .await
                            .context("failed to listen for ctrl-c")?;
                        break;
                    }
                }
            }
        }
    }

    handle.shutdown();
    handle.join().await.context("agent task failed")?;
    Ok(())
}
