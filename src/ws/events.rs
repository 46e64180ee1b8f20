//! Connection lifecycle notifications.
//!
//! Two equivalent ways to observe the engine:
//!
//! - [`Hooks`]: callbacks supplied up front in the [`Config`](super::config::Config)
//! - [`ConnectionEvent`]: a broadcast channel obtained from
//!   [`ConnectionManager::events`](super::ConnectionManager::events)
//!
//! A panicking hook is caught and logged; it never reaches the transport task.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use super::error::WsError;
use crate::types::Message;

/// Close code sent on a manual `disconnect()`.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close reason sent on a manual `disconnect()`.
pub const MANUAL_DISCONNECT_REASON: &str = "Manual disconnect";

/// Why an established connection went away.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    /// WebSocket close code, if one was exchanged (1000 = normal, 1006 = abnormal).
    pub code: Option<u16>,
    /// Human-readable description.
    pub message: String,
}

impl DisconnectReason {
    pub fn new<S: Into<String>>(code: Option<u16>, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The reason recorded for a caller-initiated `disconnect()`.
    #[must_use]
    pub fn manual() -> Self {
        Self::new(Some(NORMAL_CLOSURE), MANUAL_DISCONNECT_REASON)
    }

    /// Whether the connection ended with a normal closure.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.code == Some(NORMAL_CLOSURE)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<&WsError> for DisconnectReason {
    fn from(error: &WsError) -> Self {
        match error {
            WsError::ConnectionClosed { code, reason } => Self::new(*code, reason.clone()),
            other => Self::new(None, other.to_string()),
        }
    }
}

/// Lifecycle event published on the broadcast channel.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The transport opened
    Connected,
    /// An established connection closed
    Disconnected(DisconnectReason),
    /// An open attempt failed or the transport reported an error
    Error(WsError),
    /// A reconnection attempt was scheduled
    Reconnecting {
        /// 1-indexed attempt number
        attempt: u32,
        /// Delay before the attempt starts
        delay: Duration,
    },
    /// The reconnection budget is used up; no further attempts will be scheduled
    ReconnectExhausted {
        /// Number of attempts that were made
        attempts: u32,
    },
}

pub type OnConnect = Arc<dyn Fn() + Send + Sync>;
pub type OnDisconnect = Arc<dyn Fn(&DisconnectReason) + Send + Sync>;
pub type OnError = Arc<dyn Fn(&WsError) + Send + Sync>;
pub type OnReconnect = Arc<dyn Fn(u32) + Send + Sync>;
pub type OnMessage = Arc<dyn Fn(&Message) + Send + Sync>;

/// Optional lifecycle callbacks.
///
/// ```
/// use resilient_ws::ws::events::Hooks;
///
/// let hooks = Hooks::new()
///     .on_connect(|| println!("connected"))
///     .on_reconnect(|attempt| println!("reconnect attempt {attempt}"));
/// ```
#[derive(Clone, Default)]
pub struct Hooks {
    on_connect: Option<OnConnect>,
    on_disconnect: Option<OnDisconnect>,
    on_error: Option<OnError>,
    on_reconnect: Option<OnReconnect>,
    on_message: Option<OnMessage>,
}

impl Hooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DisconnectReason) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WsError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called with the 1-indexed attempt number whenever a reconnection is scheduled.
    #[must_use]
    pub fn on_reconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_reconnect = Some(Arc::new(callback));
        self
    }

    /// Called for every inbound message before any subscription handler.
    #[must_use]
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(callback));
        self
    }

    pub(crate) fn connected(&self) {
        if let Some(callback) = &self.on_connect {
            isolate("on_connect", || callback());
        }
    }

    pub(crate) fn disconnected(&self, reason: &DisconnectReason) {
        if let Some(callback) = &self.on_disconnect {
            isolate("on_disconnect", || callback(reason));
        }
    }

    pub(crate) fn errored(&self, error: &WsError) {
        if let Some(callback) = &self.on_error {
            isolate("on_error", || callback(error));
        }
    }

    pub(crate) fn reconnecting(&self, attempt: u32) {
        if let Some(callback) = &self.on_reconnect {
            isolate("on_reconnect", || callback(attempt));
        }
    }

    pub(crate) fn message(&self, message: &Message) {
        if let Some(callback) = &self.on_message {
            isolate("on_message", || callback(message));
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_reconnect", &self.on_reconnect.is_some())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

/// Run user code, swallowing (and logging) a panic. Returns whether it completed normally.
pub(crate) fn isolate<F: FnOnce()>(label: &str, callback: F) -> bool {
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(payload) => {
            #[cfg(feature = "tracing")]
            tracing::error!(
                callback = label,
                panic = panic_message(payload.as_ref()),
                "callback panicked"
            );
            #[cfg(not(feature = "tracing"))]
            let _ = (label, panic_message(payload.as_ref()));
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn hooks_invoke_registered_callbacks() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let hooks = Hooks::new().on_reconnect(move |attempt| {
            seen.fetch_add(attempt, Ordering::SeqCst);
        });

        hooks.reconnecting(2);
        hooks.reconnecting(3);
        hooks.connected();

        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn panicking_hook_is_contained() {
        let hooks = Hooks::new().on_connect(|| panic!("boom"));

        hooks.connected();
    }

    #[test]
    fn isolate_reports_outcome() {
        assert!(isolate("ok", || {}));
        assert!(!isolate("bad", || panic!("bad")));
    }

    #[test]
    fn debug_lists_registered_hooks() {
        let hooks = Hooks::new().on_error(|_| {});
        let rendered = format!("{hooks:?}");

        assert!(rendered.contains("on_error: true"), "{rendered}");
        assert!(rendered.contains("on_connect: false"), "{rendered}");
    }

    #[test]
    fn manual_reason_is_normal_closure() {
        let reason = DisconnectReason::manual();

        assert!(reason.is_normal());
        assert_eq!(reason.to_string(), "Manual disconnect (code: 1000)");
    }

    #[test]
    fn reason_from_close_error_keeps_code() {
        let reason = DisconnectReason::from(&WsError::ConnectionClosed {
            code: Some(1001),
            reason: "going away".to_owned(),
        });

        assert_eq!(reason, DisconnectReason::new(Some(1001), "going away"));
        assert!(!reason.is_normal());
    }
}
