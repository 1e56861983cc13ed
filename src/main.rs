mod bot;
mod config;
mod health;
mod platform;
mod relay;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::AppState;
use crate::config::Config;
use crate::platform::discord::{self, DiscordPlatform};
use crate::relay::RelayClient;

/// Capacity of the queue between the gateway and the relay loop.
const EVENT_QUEUE_SIZE: usize = 64;
/// How long to wait for in-flight relays once the gateway is down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,receipt_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Optional config file; environment variables take precedence
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path.display());
    }
    let config = Config::load(config_path.as_deref()).context("Invalid configuration")?;

    info!("Configuration loaded successfully");
    info!("  Relay endpoint: {}", config.relay.endpoint_url);
    info!("  Health port: {}", config.health.port);
    match config.relay.timeout_secs {
        Some(secs) => info!("  Relay timeout: {}s", secs),
        None => info!("  Relay timeout: none"),
    }

    let relay = RelayClient::new(&config.relay)?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
    let mut client = discord::connect(&config.discord.bot_token, events_tx).await?;
    let shard_manager = client.shard_manager.clone();

    let state = Arc::new(AppState::new(
        Arc::new(DiscordPlatform::new(client.http.clone())),
        Arc::new(relay),
    ));

    let (health_stop_tx, health_stop_rx) = oneshot::channel::<()>();
    let mut health = tokio::spawn(health::serve(config.health.port, async move {
        let _ = health_stop_rx.await;
    }));

    let consumer = tokio::spawn(bot::run(state, events_rx));

    info!("Bot is starting...");
    let result = tokio::select! {
        res = client.start() => res.context("Discord client error"),
        res = &mut health => match res {
            Ok(Ok(())) => Err(anyhow!("Health server stopped unexpectedly")),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(e).context("Health server task failed"),
        },
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    shard_manager.shutdown_all().await;
    let _ = health_stop_tx.send(());
    // Dropping the client drops the gateway handler and closes the event queue.
    drop(client);

    if tokio::time::timeout(DRAIN_TIMEOUT, consumer).await.is_err() {
        warn!("Timed out waiting for in-flight relays");
    }

    info!("Bot stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
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
