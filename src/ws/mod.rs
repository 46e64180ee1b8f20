//! Resilient WebSocket connection management.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: one logical connection with reconnection, heartbeat, an outbound
//!   queue and type-based inbound dispatch
//! - [`MessageHandler`]: receives the messages a subscription selects
//! - [`events`]: lifecycle hooks and the broadcast event channel
//!
//! # Example
//!
//! ```ignore
//! let config = Config::builder().address("wss://example.com/socket").build();
//! let connection = ConnectionManager::new(config)?;
//!
//! let id = connection.subscribe("price", |message: &Message| println!("{}", message.data));
//! connection.connect().await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub(crate) mod queue;
pub mod subscription;
pub mod traits;

pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, Delivery, RawFrame};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use events::{ConnectionEvent, DisconnectReason, Hooks};
pub use subscription::SubscriptionId;
pub use traits::*;
