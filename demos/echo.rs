//! Connects to an echo server, sends a few envelopes and prints what comes back.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info cargo run --example echo --features tracing -- wss://echo.websocket.org
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use resilient_ws::types::{Message, WILDCARD};
use resilient_ws::ws::config::{Config, HeartbeatConfig, ReconnectConfig};
use resilient_ws::ws::events::Hooks;
use resilient_ws::ws::{ConnectionEvent, ConnectionManager};
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());

    let config = Config::builder()
        .address(address)
        .debug(true)
        .reconnect(ReconnectConfig::builder().max_attempts(3).build())
        .heartbeat(
            HeartbeatConfig::builder()
                .interval(Duration::from_secs(10))
                .build(),
        )
        .hooks(
            Hooks::new()
                .on_connect(|| info!("connected"))
                .on_disconnect(|reason| warn!(%reason, "disconnected"))
                .on_reconnect(|attempt| info!(attempt, "reconnecting")),
        )
        .build();

    let connection = ConnectionManager::new(config)?;

    let mut events = connection.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ConnectionEvent::ReconnectExhausted { attempts } = event {
                warn!(attempts, "giving up");
            }
        }
    });

    let echoes = connection.stream(WILDCARD);
    let mut echoes = Box::pin(echoes);

    // Queued until the connection opens
    connection.send(&Message::new("greeting", json!({ "text": "hello" })))?;
    connection.connect().await?;

    for n in 1..=3 {
        connection.send(&Message::new("count", json!(n)))?;
    }

    while let Ok(Some(message)) = timeout(Duration::from_secs(5), echoes.next()).await {
        info!(msg_type = %message.msg_type, data = %message.data, "echo");
    }

    let state = connection.state();
    info!(
        sent = state.messages_sent,
        received = state.messages_received,
        "done"
    );
    connection.disconnect();

    Ok(())
}
