use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, error, info, warn};
use venus_bridge::dbus::connector_for;
use venus_bridge::logging::init_logging;
use venus_bridge::{Bridge, BridgeEvent, Config, DeviceClass};

/// One line of the update feed on stdin
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateLine {
    path: String,
    value: Value,
    device_type: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => Config::load().context("Failed to load configuration")?,
    };
    config.validate().context("Invalid configuration")?;
    init_logging(&config.logging).context("Failed to initialize logging")?;

    info!(
        "Venus bridge {} starting up (bus: {})",
        env!("CARGO_PKG_VERSION"),
        config.dbus.address
    );

    let connector = connector_for(&config.dbus);
    let persist_every = Duration::from_secs(config.battery.persist_interval_secs.max(1));
    let (bridge, mut events) = Bridge::new(config, connector);
    let bridge = Arc::new(bridge);

    // Remote writes go to stdout for the upstream side; status lines are logged
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                BridgeEvent::ValueChanged { .. } => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Could not encode event: {}", e),
                },
                BridgeEvent::DataUpdated { category, text } => {
                    debug!("[{}] {}", category, text);
                }
            }
        }
    });

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut persist_tick = tokio::time::interval(persist_every);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => handle_line(&bridge, &line).await,
                Some(Err(e)) => {
                    error!("Reading update feed failed: {}", e);
                    break;
                }
                None => {
                    info!("Update feed closed");
                    break;
                }
            },
            _ = persist_tick.tick() => {
                if let Err(e) = bridge.persist_history() {
                    warn!("Saving history failed: {}", e);
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let result = bridge.shutdown().await;
    printer.abort();
    match result {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Shutdown failed: {}", e);
            Err(anyhow::anyhow!("Shutdown error: {}", e))
        }
    }
}

async fn handle_line(bridge: &Bridge, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let update: UpdateLine = match serde_json::from_str(line) {
        Ok(u) => u,
        Err(e) => {
            warn!("Skipping malformed update line: {}", e);
            return;
        }
    };
    let class: DeviceClass = match update.device_type.parse() {
        Ok(c) => c,
        Err(e) => {
            warn!("Skipping update for {}: {}", update.path, e);
            return;
        }
    };
    if let Err(e) = bridge.apply_update(&update.path, update.value, class).await {
        error!("Update {} failed: {}", update.path, e);
    }
}
