//! Keyed collection of connections shared by an application.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::Result;
use crate::error::Error;
use crate::types::Message;
use crate::ws::config::Config;
use crate::ws::{ConnectionManager, Delivery};

/// Owns a set of [`ConnectionManager`]s addressed by string keys.
///
/// Dropping the registry disconnects every connection it holds.
///
/// ```no_run
/// use resilient_ws::registry::Registry;
/// use resilient_ws::ws::config::Config;
///
/// # async fn run() -> resilient_ws::Result<()> {
/// let registry = Registry::new();
/// registry.create("prices", Config::builder().address("wss://example.com/prices").build())?;
/// registry.connect("prices").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Registry {
    connections: DashMap<String, ConnectionManager>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a connection under `key`.
    ///
    /// If `key` is already taken the existing connection is returned unchanged and `config` is
    /// ignored.
    pub fn create<K: Into<String>>(&self, key: K, config: Config) -> Result<ConnectionManager> {
        match self.connections.entry(key.into()) {
            Entry::Occupied(existing) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(key = %existing.key(), "connection already registered, reusing it");
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                let connection = ConnectionManager::new(config)?;
                slot.insert(connection.clone());
                Ok(connection)
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<ConnectionManager> {
        self.connections.get(key).map(|entry| entry.value().clone())
    }

    pub async fn connect(&self, key: &str) -> Result<()> {
        self.require(key)?.connect().await
    }

    pub fn disconnect(&self, key: &str) -> Result<()> {
        self.require(key)?.disconnect();
        Ok(())
    }

    pub async fn reconnect(&self, key: &str) -> Result<()> {
        self.require(key)?.reconnect().await
    }

    /// Disconnect and forget the connection under `key`. Returns whether one was registered.
    pub fn remove(&self, key: &str) -> bool {
        match self.connections.remove(key) {
            Some((_, connection)) => {
                connection.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn send<T: Serialize>(&self, key: &str, message: &Message<T>) -> Result<Delivery> {
        self.require(key)?.send(message)
    }

    /// Send `message` to every connected connection. Returns how many accepted it.
    pub fn broadcast<T: Serialize>(&self, message: &Message<T>) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|(_, connection)| connection.is_connected())
            .filter(|(key, connection)| match connection.send(message) {
                Ok(delivery) => delivery == Delivery::Sent,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(key = %key, error = %e, "broadcast send failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = (key, e);
                    false
                }
            })
            .count()
    }

    /// Registered keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort_unstable();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_connected())
            .count()
    }

    /// Disconnect and remove every connection.
    pub fn teardown(&self) {
        let connections = self.snapshot();
        self.connections.clear();
        for (_, connection) in connections {
            connection.disconnect();
        }
    }

    fn require(&self, key: &str) -> Result<ConnectionManager> {
        self.get(key).ok_or_else(|| Error::unknown_connection(key))
    }

    /// Clone the entries out so no shard lock is held while calling into connections.
    fn snapshot(&self) -> Vec<(String, ConnectionManager)> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.teardown();
    }
}
