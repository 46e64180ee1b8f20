#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use backoff::backoff::Backoff as _;
use chrono::{DateTime, Utc};
use futures::{SinkExt as _, Stream, StreamExt as _};
use serde::Serialize;
use strum_macros::Display;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message as Frame, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::config::{Config, ReconnectBackoff};
use super::error::WsError;
use super::events::{
    ConnectionEvent, DisconnectReason, MANUAL_DISCONNECT_REASON, NORMAL_CLOSURE,
};
use super::queue::OutboundQueue;
use super::subscription::{SubscriptionId, SubscriptionTable, dispatch};
use super::traits::{AsyncHandler, MessageHandler};
use crate::Result;
use crate::types::{Message, Value, now_millis};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcast channel capacity for lifecycle events.
const EVENT_CAPACITY: usize = 64;

/// Lifecycle chatter, emitted only when [`Config::debug`] is set.
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($inner:expr, $($arg:tt)+) => {
        if $inner.config.debug {
            tracing::debug!($($arg)+);
        }
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($inner:expr, $($arg:tt)+) => {};
}

/// Connection status.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected; initial state and the state after `disconnect()`
    Disconnected,
    /// Opening handshake in progress
    Connecting,
    /// Transport open
    Connected,
    /// Waiting to retry, or out of retries
    Reconnecting,
    /// The last open attempt failed
    Error,
}

/// Snapshot of the connection's observable state.
///
/// Returned by value, so holding or modifying one never affects the engine.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Current lifecycle status
    pub status: ConnectionStatus,
    /// Always `status == Connected`
    pub is_connected: bool,
    /// Reconnection attempts scheduled since the last successful open
    pub reconnect_attempts: u32,
    /// Most recent transport or protocol failure
    pub last_error: Option<WsError>,
    /// When the current (or most recent) connection was established
    pub connected_at: Option<DateTime<Utc>>,
    /// Envelopes handed to the transport, including flushed queue entries
    pub messages_sent: u64,
    /// Inbound frames delivered to dispatch, raw frames included
    pub messages_received: u64,
}

impl ConnectionState {
    const fn initial() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            is_connected: false,
            reconnect_attempts: 0,
            last_error: None,
            connected_at: None,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// How long the current connection has been up.
    #[must_use]
    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.connected_at
            .filter(|_| self.is_connected)
            .map(|since| Utc::now() - since)
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        self.is_connected = status == ConnectionStatus::Connected;
    }
}

/// Outcome of a successful [`ConnectionManager::send`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the open transport
    Sent,
    /// Buffered until the next successful open
    Queued,
}

/// A pre-serialized frame for [`ConnectionManager::send_raw`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl From<String> for RawFrame {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for RawFrame {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for RawFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<RawFrame> for Frame {
    fn from(frame: RawFrame) -> Self {
        match frame {
            RawFrame::Text(text) => Frame::Text(text.into()),
            RawFrame::Binary(bytes) => Frame::Binary(bytes.into()),
        }
    }
}

type OpenWaiter = oneshot::Sender<std::result::Result<(), WsError>>;

/// Everything the engine mutates, guarded by one lock.
struct Core {
    state: ConnectionState,
    /// Runtime override of `config.reconnect.enabled`, cleared by `disconnect()`
    reconnect_enabled: bool,
    /// Set by `disconnect()`, cleared by `reconnect()`
    shut_down: bool,
    /// Bumped for every open attempt and on `disconnect()`; late events from an older session
    /// are ignored
    session: u64,
    /// Outbound frames for the live session's writer
    writer: Option<mpsc::UnboundedSender<Frame>>,
    session_token: Option<CancellationToken>,
    queue: OutboundQueue,
    subscriptions: SubscriptionTable,
    backoff: ReconnectBackoff,
    waiters: Vec<OpenWaiter>,
    opening: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl Core {
    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(handle) = self.reconnect_timer.take() {
            handle.abort();
        }
    }

    /// Drop the live session, if any, returning whether it was established.
    fn detach_session(&mut self) -> bool {
        self.stop_heartbeat();
        self.writer = None;
        if let Some(token) = self.session_token.take() {
            token.cancel();
        }
        self.state.is_connected
    }
}

struct Inner {
    config: Config,
    core: Mutex<Core>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

/// Manages one logical WebSocket connection: lifecycle, reconnection, heartbeat, outbound
/// buffering and inbound dispatch.
///
/// The handle is cheap to clone; all clones drive the same connection. Background work (the
/// open attempt, the session reader/writer, heartbeat and reconnect timers) runs in tokio tasks
/// that hold only weak references, so dropping the last handle tears everything down.
///
/// # Example
///
/// ```rust, no_run
/// use resilient_ws::types::Message;
/// use resilient_ws::ws::ConnectionManager;
/// use resilient_ws::ws::config::Config;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::builder().address("wss://example.com/socket").build();
///     let connection = ConnectionManager::new(config)?;
///
///     connection.subscribe("chat", |message: &Message| {
///         println!("chat: {}", message.data);
///     });
///
///     connection.connect().await?;
///     connection.send(&Message::new("chat", json!({ "text": "hello" })))?;
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a connection manager. Nothing is opened until [`connect`](Self::connect).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let core = Core {
            state: ConnectionState::initial(),
            reconnect_enabled: config.reconnect.enabled,
            shut_down: false,
            session: 0,
            writer: None,
            session_token: None,
            queue: OutboundQueue::new(config.queue.max_size),
            subscriptions: SubscriptionTable::default(),
            backoff: config.reconnect.backoff(),
            waiters: Vec::new(),
            opening: None,
            heartbeat: None,
            reconnect_timer: None,
        };
        let (state_tx, _) = watch::channel(core.state.clone());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            config,
            core: Mutex::new(core),
            state_tx,
            events_tx,
        });
        debug_log!(inner, address = %inner.config.address, "connection manager initialized");

        Ok(Self { inner })
    }

    /// Open the connection.
    ///
    /// Resolves once the transport is open, or with the open failure. Returns immediately if
    /// already connected; joins the outstanding attempt if one is in flight.
    pub async fn connect(&self) -> Result<()> {
        let outcome = {
            let mut core = self.inner.lock();
            if core.shut_down {
                return Err(WsError::Shutdown.into());
            }
            if core.state.is_connected {
                debug_log!(self.inner, "already connected");
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            core.waiters.push(tx);
            if core.opening.is_none() {
                core.cancel_reconnect();
                self.inner.begin_open(&mut core);
            }
            rx
        };

        match outcome.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_closed) => Err(WsError::Shutdown.into()),
        }
    }

    /// Close the connection with a normal closure and retire this instance.
    ///
    /// Cancels the heartbeat and any pending reconnection, detaches the transport and fails any
    /// outstanding `connect()`. Safe to call repeatedly. Use [`reconnect`](Self::reconnect) to
    /// bring a retired instance back.
    pub fn disconnect(&self) {
        let (was_connected, waiters) = {
            let mut core = self.inner.lock();
            core.shut_down = true;
            core.reconnect_enabled = false;
            core.session = core.session.wrapping_add(1);
            core.cancel_reconnect();
            if let Some(handle) = core.opening.take() {
                handle.abort();
            }
            let was_connected = core.detach_session();
            core.state.set_status(ConnectionStatus::Disconnected);
            self.inner.publish(&core);
            (was_connected, mem::take(&mut core.waiters))
        };

        for waiter in waiters {
            _ = waiter.send(Err(WsError::Shutdown));
        }

        if was_connected {
            debug_log!(self.inner, "disconnected manually");
            let reason = DisconnectReason::manual();
            self.inner.config.hooks.disconnected(&reason);
            self.inner.emit(ConnectionEvent::Disconnected(reason));
        }
    }

    /// Disconnect, re-arm automatic reconnection and connect again.
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect();
        {
            let mut core = self.inner.lock();
            core.shut_down = false;
            core.reconnect_enabled = self.inner.config.reconnect.enabled;
        }
        self.connect().await
    }

    /// Send a message.
    ///
    /// While connected the message goes straight to the transport. Otherwise it is buffered
    /// (evicting the oldest buffered message when full) if queueing is enabled, and rejected with
    /// [`WsError::NotConnected`] if not. A payload that fails to serialize is rejected without
    /// touching the connection.
    pub fn send<T: Serialize>(&self, message: &Message<T>) -> Result<Delivery> {
        let mut message = message.to_value().inspect_err(|e| {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "failed to serialize outbound message");
            #[cfg(not(feature = "tracing"))]
            let _ = e;
        })?;

        let mut core = self.inner.lock();
        if core.state.is_connected {
            match self.inner.write_message(&mut core, &message) {
                Ok(()) => return Ok(Delivery::Sent),
                Err(WsError::NotConnected) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let queue = &self.inner.config.queue;
        if !queue.enabled || queue.max_size == 0 {
            debug_log!(self.inner, msg_type = %message.msg_type, "not connected, message dropped");
            return Err(WsError::NotConnected.into());
        }

        if message.timestamp.is_none() {
            message.timestamp = Some(now_millis());
        }
        if let Some(evicted) = core.queue.push(message) {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                msg_type = %evicted.msg_type,
                max_size = queue.max_size,
                "outbound queue full, evicted oldest message"
            );
            #[cfg(not(feature = "tracing"))]
            drop(evicted);
        }
        debug_log!(self.inner, queued = core.queue.len(), "message queued");
        Ok(Delivery::Queued)
    }

    /// Send a pre-serialized frame, bypassing serialization and the queue. Only valid while
    /// connected.
    pub fn send_raw<F: Into<RawFrame>>(&self, frame: F) -> Result<()> {
        let core = self.inner.lock();
        self.inner.write_raw(&core, frame.into()).map_err(Into::into)
    }

    /// Send one heartbeat frame now.
    pub fn ping(&self) -> Result<()> {
        let core = self.inner.lock();
        self.inner
            .write_raw(&core, RawFrame::Text(self.inner.config.heartbeat.payload.clone()))
            .map_err(Into::into)
    }

    /// Register `handler` for messages whose type is `msg_type`, or every message when
    /// `msg_type` is [`WILDCARD`](crate::types::WILDCARD).
    pub fn subscribe<S, H>(&self, msg_type: S, handler: H) -> SubscriptionId
    where
        S: Into<String>,
        H: MessageHandler,
    {
        self.register(msg_type.into(), Arc::new(handler), false)
    }

    /// Like [`subscribe`](Self::subscribe), but removed after the first matching message.
    pub fn once<S, H>(&self, msg_type: S, handler: H) -> SubscriptionId
    where
        S: Into<String>,
        H: MessageHandler,
    {
        self.register(msg_type.into(), Arc::new(handler), true)
    }

    /// Register an `async` handler. Each matching message spawns the handler's future; dispatch
    /// does not wait for it.
    pub fn subscribe_async<S, F, Fut>(&self, msg_type: S, handler: F) -> SubscriptionId
    where
        S: Into<String>,
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(msg_type, AsyncHandler::new(handler))
    }

    /// Remove a subscription. Returns whether one was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.lock().subscriptions.remove(id);
        debug_log!(self.inner, subscription = %id, removed, "unsubscribed");
        removed
    }

    /// Stream of messages matching `msg_type`. The backing subscription is removed when the
    /// stream is dropped.
    pub fn stream(&self, msg_type: &str) -> impl Stream<Item = Message> + use<> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.subscribe(msg_type, move |message: &Message| {
            _ = tx.send(message.clone());
        });
        let guard = SubscriptionGuard {
            inner: Arc::downgrade(&self.inner),
            id,
        };

        async_stream::stream! {
            let _guard = guard;
            while let Some(message) = rx.recv().await {
                yield message;
            }
        }
    }

    /// Get a snapshot of the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.lock().state.is_connected
    }

    /// Subscribe to connection state changes.
    ///
    /// The receiver is updated on every status change and counter update, so consumers never
    /// need to poll [`state`](Self::state).
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Number of messages waiting in the outbound queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Discard every buffered message, returning how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let mut core = self.inner.lock();
        let dropped = core.queue.len();
        core.queue.clear();
        debug_log!(self.inner, dropped, "outbound queue cleared");
        dropped
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn register(
        &self,
        filter: String,
        handler: Arc<dyn MessageHandler>,
        once: bool,
    ) -> SubscriptionId {
        let id = self
            .inner
            .lock()
            .subscriptions
            .insert(filter, handler, once);
        debug_log!(self.inner, subscription = %id, once, "subscribed");
        id
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("address", &self.inner.config.address)
            .field("status", &core.state.status)
            .field("queued", &core.queue.len())
            .field("subscriptions", &core.subscriptions.len())
            .finish_non_exhaustive()
    }
}

/// Removes a subscription when dropped.
struct SubscriptionGuard {
    inner: Weak<Inner>,
    id: SubscriptionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().subscriptions.remove(self.id);
        }
    }
}

/// What to report after the engine lock is released, following a failed or closed session.
struct Aftermath {
    error: Option<WsError>,
    disconnected: Option<DisconnectReason>,
    scheduled: Option<(u32, Duration)>,
    exhausted: Option<u32>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Core> {
        // Core is kept consistent at every unlock point and user code never runs under the lock
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, core: &Core) {
        self.state_tx.send_replace(core.state.clone());
    }

    fn emit(&self, event: ConnectionEvent) {
        _ = self.events_tx.send(event);
    }

    /// Start an open attempt. The caller holds the lock and has checked no attempt is in flight.
    fn begin_open(self: &Arc<Self>, core: &mut Core) {
        core.session = core.session.wrapping_add(1);
        let session = core.session;
        core.state.set_status(ConnectionStatus::Connecting);
        self.publish(core);
        debug_log!(self, address = %self.config.address, session, "connecting");

        let weak = Arc::downgrade(self);
        let address = self.config.address.clone();
        let protocols = self.config.protocols.clone();
        let connect_timeout = self.config.connect_timeout;

        core.opening = Some(tokio::spawn(async move {
            let result = open(&address, &protocols, connect_timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(stream) => inner.on_open(session, stream),
                Err(e) => inner.on_open_failed(session, e),
            }
        }));
    }

    fn on_open(self: &Arc<Self>, session: u64, stream: WsStream) {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let waiters = {
            let mut core = self.lock();
            if core.session != session || core.shut_down {
                // Superseded by disconnect(); dropping the stream closes it
                return;
            }

            core.opening = None;
            core.cancel_reconnect();
            core.backoff.reset();
            core.state.reconnect_attempts = 0;
            core.state.connected_at = Some(Utc::now());
            core.writer = Some(writer_tx);
            core.session_token = Some(token.clone());
            core.state.set_status(ConnectionStatus::Connected);

            self.start_heartbeat(&mut core);
            self.flush_queue(&mut core);
            self.publish(&core);

            mem::take(&mut core.waiters)
        };

        #[cfg(feature = "tracing")]
        tracing::info!(address = %self.config.address, "WebSocket connected");

        tokio::spawn(run_session(
            Arc::downgrade(self),
            session,
            stream,
            writer_rx,
            token,
        ));

        self.config.hooks.connected();
        self.emit(ConnectionEvent::Connected);

        for waiter in waiters {
            _ = waiter.send(Ok(()));
        }
    }

    fn on_open_failed(self: &Arc<Self>, session: u64, error: WsError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(address = %self.config.address, error = %error, "unable to connect");

        let (waiters, aftermath) = {
            let mut core = self.lock();
            if core.session != session {
                return;
            }

            core.opening = None;
            core.state.last_error = Some(error.clone());
            core.state.set_status(ConnectionStatus::Error);
            let waiters = mem::take(&mut core.waiters);
            let aftermath = Aftermath {
                error: Some(error.clone()),
                disconnected: None,
                ..self.schedule_reconnect(&mut core)
            };
            self.publish(&core);
            (waiters, aftermath)
        };

        for waiter in waiters {
            _ = waiter.send(Err(error.clone()));
        }
        self.report(aftermath);
    }

    /// The session task ended: the peer closed, the network failed, or a write failed.
    fn on_closed(self: &Arc<Self>, session: u64, cause: WsError) {
        let aftermath = {
            let mut core = self.lock();
            if core.session != session {
                return;
            }

            let was_connected = core.detach_session();
            let error = matches!(cause, WsError::Connection(_)).then(|| cause.clone());
            if let Some(error) = &error {
                core.state.last_error = Some(error.clone());
            }
            core.state.set_status(ConnectionStatus::Disconnected);

            let aftermath = Aftermath {
                error,
                disconnected: was_connected.then(|| DisconnectReason::from(&cause)),
                ..self.schedule_reconnect(&mut core)
            };
            self.publish(&core);
            aftermath
        };

        #[cfg(feature = "tracing")]
        tracing::info!(address = %self.config.address, cause = %cause, "WebSocket closed");

        self.report(aftermath);
    }

    /// Decide what follows a failed or closed session and arm the reconnect timer if there is
    /// budget left. Leaves the status untouched when reconnection is off.
    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core) -> Aftermath {
        let mut aftermath = Aftermath {
            error: None,
            disconnected: None,
            scheduled: None,
            exhausted: None,
        };
        if !core.reconnect_enabled || core.shut_down {
            return aftermath;
        }

        core.cancel_reconnect();
        core.state.set_status(ConnectionStatus::Reconnecting);

        let Some(delay) = core.backoff.next_backoff() else {
            aftermath.exhausted = Some(core.backoff.attempt());
            return aftermath;
        };

        let attempt = core.backoff.attempt();
        core.state.reconnect_attempts = attempt;

        let weak = Arc::downgrade(self);
        core.reconnect_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.retry();
            }
        }));

        aftermath.scheduled = Some((attempt, delay));
        aftermath
    }

    /// Reconnect timer fired.
    fn retry(self: &Arc<Self>) {
        let mut core = self.lock();
        core.reconnect_timer = None;
        if core.shut_down || core.state.is_connected || core.opening.is_some() {
            return;
        }
        self.begin_open(&mut core);
    }

    /// Invoke hooks and publish events for a failure, outside the lock.
    fn report(&self, aftermath: Aftermath) {
        if let Some(error) = aftermath.error {
            self.config.hooks.errored(&error);
            self.emit(ConnectionEvent::Error(error));
        }

        if let Some(reason) = aftermath.disconnected {
            self.config.hooks.disconnected(&reason);
            self.emit(ConnectionEvent::Disconnected(reason));
        }

        if let Some((attempt, delay)) = aftermath.scheduled {
            debug_log!(self, attempt, delay_ms = delay.as_millis(), "scheduling reconnect");
            self.config.hooks.reconnecting(attempt);
            self.emit(ConnectionEvent::Reconnecting { attempt, delay });
        }

        if let Some(attempts) = aftermath.exhausted {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                address = %self.config.address,
                attempts,
                "max reconnect attempts reached, giving up"
            );
            self.emit(ConnectionEvent::ReconnectExhausted { attempts });
        }
    }

    fn start_heartbeat(self: &Arc<Self>, core: &mut Core) {
        core.stop_heartbeat();
        if !self.config.heartbeat.enabled {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.heartbeat.interval;
        core.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.beat() {
                    break;
                }
            }
        }));
        debug_log!(self, interval_ms = period.as_millis(), "heartbeat started");
    }

    /// Send one heartbeat; returns whether the connection is still usable.
    fn beat(&self) -> bool {
        let core = self.lock();
        let payload = RawFrame::Text(self.config.heartbeat.payload.clone());
        match self.write_raw(&core, payload) {
            Ok(()) => {
                debug_log!(self, "heartbeat sent");
                true
            }
            Err(_not_connected) => false,
        }
    }

    /// Drain the queue into the live session in FIFO order.
    fn flush_queue(&self, core: &mut Core) {
        if core.queue.is_empty() {
            return;
        }
        debug_log!(self, queued = core.queue.len(), "flushing outbound queue");

        while let Some(message) = core.queue.pop_front() {
            if let Err(e) = self.write_message(core, &message) {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    error = %e,
                    remaining = core.queue.len() + 1,
                    "queue flush interrupted"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = e;
                core.queue.push_front(message);
                break;
            }
        }
    }

    /// Serialize and hand a message to the live session, counting it as sent.
    fn write_message(
        &self,
        core: &mut Core,
        message: &Message<Value>,
    ) -> std::result::Result<(), WsError> {
        let text =
            serde_json::to_string(message).map_err(|e| WsError::MessageParse(Arc::new(e)))?;
        self.write_raw(core, RawFrame::Text(text))?;
        core.state.messages_sent = core.state.messages_sent.saturating_add(1);
        self.publish(core);
        debug_log!(self, msg_type = %message.msg_type, "message sent");
        Ok(())
    }

    fn write_raw(&self, core: &Core, frame: RawFrame) -> std::result::Result<(), WsError> {
        if !core.state.is_connected {
            return Err(WsError::NotConnected);
        }
        let writer = core.writer.as_ref().ok_or(WsError::NotConnected)?;
        writer
            .send(frame.into())
            .map_err(|_closed| WsError::NotConnected)
    }

    /// Count, announce and fan out one inbound message.
    fn receive(&self, session: u64, message: &Message) {
        let matched = {
            let mut core = self.lock();
            if core.session != session {
                return;
            }
            core.state.messages_received = core.state.messages_received.saturating_add(1);
            self.publish(&core);
            core.subscriptions.take_matching(message)
        };
        debug_log!(self, msg_type = %message.msg_type, handlers = matched.len(), "message received");

        self.config.hooks.message(message);
        dispatch(&matched, message);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let core = self
            .core
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        core.cancel_reconnect();
        if let Some(handle) = core.opening.take() {
            handle.abort();
        }
        core.detach_session();
    }
}

/// Perform the opening handshake.
async fn open(
    address: &str,
    protocols: &[String],
    connect_timeout: Option<Duration>,
) -> std::result::Result<WsStream, WsError> {
    let mut request = address.into_client_request()?;
    if !protocols.is_empty() {
        let offered = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|e| WsError::InvalidMessage(format!("invalid sub-protocol list: {e}")))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);
    }

    let handshake = connect_async(request);
    let (stream, _response) = match connect_timeout {
        Some(limit) => timeout(limit, handshake)
            .await
            .map_err(|_elapsed| WsError::Timeout(limit))??,
        None => handshake.await?,
    };
    Ok(stream)
}

/// Pump one open session: inbound frames to dispatch, queued frames to the socket.
async fn run_session(
    inner: Weak<Inner>,
    session: u64,
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    token: CancellationToken,
) {
    let (mut write, mut read) = stream.split();

    let cause = loop {
        tokio::select! {
            () = token.cancelled() => {
                let close = CloseFrame {
                    code: CloseCode::from(NORMAL_CLOSURE),
                    reason: Utf8Bytes::from_static(MANUAL_DISCONNECT_REASON),
                };
                _ = write.send(Frame::Close(Some(close))).await;
                _ = write.close().await;
                return;
            }

            frame = read.next() => {
                let message = match frame {
                    Some(Ok(Frame::Text(text))) => Message::from_frame(text.as_str()),
                    Some(Ok(Frame::Binary(bytes))) => Message::from_binary(&bytes),
                    Some(Ok(Frame::Close(close))) => {
                        break WsError::ConnectionClosed {
                            code: close.as_ref().map(|frame| u16::from(frame.code)),
                            reason: close.map(|frame| frame.reason.as_str().to_owned()).unwrap_or_default(),
                        };
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite
                        continue;
                    }
                    Some(Err(e)) => break e.into(),
                    None => {
                        break WsError::ConnectionClosed {
                            code: None,
                            reason: "stream ended".to_owned(),
                        };
                    }
                };

                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.receive(session, &message);
            }

            Some(frame) = outbound.recv() => {
                if let Err(e) = write.send(frame).await {
                    break e.into();
                }
            }
        }
    };

    _ = write.close().await;

    if let Some(inner) = inner.upgrade() {
        inner.on_closed(session, cause);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ws::config::QueueConfig;

    fn manager(queue: QueueConfig) -> ConnectionManager {
        let config = Config::builder()
            .address("ws://127.0.0.1:9")
            .queue(queue)
            .build();
        ConnectionManager::new(config).unwrap()
    }

    #[test]
    fn status_displays_lowercase() {
        assert_eq!(ConnectionStatus::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Connected).unwrap(),
            r#""connected""#
        );
    }

    #[test]
    fn new_rejects_non_websocket_address() {
        let config = Config::builder().address("http://example.com").build();

        let err = ConnectionManager::new(config).unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Validation);
    }

    #[test]
    fn initial_state_is_disconnected() {
        let connection = manager(QueueConfig::default());
        let state = connection.state();

        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(!state.is_connected());
        assert_eq!(state.reconnect_attempts, 0);
        assert!(state.last_error.is_none());
        assert!(state.connected_at.is_none());
        assert_eq!(state.uptime(), None);
    }

    #[test]
    fn send_while_disconnected_queues_and_evicts_oldest() {
        let connection = manager(QueueConfig::builder().max_size(2).build());

        for n in 1..=3 {
            let delivery = connection.send(&Message::bare("n", json!(n))).unwrap();
            assert_eq!(delivery, Delivery::Queued);
        }

        assert_eq!(connection.queued(), 2);
        let core = connection.inner.lock();
        assert_eq!(core.queue.len(), 2);
        assert_eq!(core.state.messages_sent, 0);
    }

    #[test]
    fn queued_messages_are_timestamped() {
        let connection = manager(QueueConfig::default());
        connection.send(&Message::bare("n", json!(1))).unwrap();

        let mut core = connection.inner.lock();
        let queued = core.queue.pop_front().unwrap();
        assert!(queued.timestamp.is_some());
    }

    #[test]
    fn clear_queue_discards_buffered_messages() {
        let connection = manager(QueueConfig::default());
        connection.send(&Message::bare("n", json!(1))).unwrap();
        connection.send(&Message::bare("n", json!(2))).unwrap();

        assert_eq!(connection.clear_queue(), 2);
        assert_eq!(connection.queued(), 0);
    }

    #[test]
    fn send_without_queue_fails_when_disconnected() {
        let connection = manager(QueueConfig::builder().enabled(false).build());

        let err = connection
            .send(&Message::bare("n", json!(1)))
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::NotConnected)
        ));
        assert_eq!(connection.queued(), 0);
    }

    #[test]
    fn unserializable_payload_is_rejected_before_queueing() {
        let connection = manager(QueueConfig::default());
        let payload = std::collections::HashMap::from([((1, 2), 3)]);

        let err = connection.send(&Message::bare("n", payload)).unwrap_err();

        assert_eq!(err.kind(), crate::error::Kind::Internal);
        assert_eq!(connection.queued(), 0);
        assert_eq!(connection.state().messages_sent, 0);
    }

    #[test]
    fn flush_stops_and_keeps_the_rest_when_the_session_drops() {
        let connection = manager(QueueConfig::default());
        for n in 1..=3 {
            connection.send(&Message::bare("n", json!(n))).unwrap();
        }

        let mut core = connection.inner.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        core.writer = Some(tx);
        core.state.set_status(ConnectionStatus::Connected);
        connection.inner.flush_queue(&mut core);

        assert_eq!(core.queue.len(), 3);
        assert_eq!(core.state.messages_sent, 0);
        let head = core.queue.pop_front().unwrap();
        assert_eq!(head.data, json!(1));
    }

    #[test]
    fn zero_sized_queue_behaves_as_disabled() {
        let connection = manager(QueueConfig::builder().max_size(0).build());

        assert!(connection.send(&Message::bare("n", json!(1))).is_err(), "queued into nothing");
    }

    #[test]
    fn send_raw_requires_connection() {
        let connection = manager(QueueConfig::default());

        assert!(connection.send_raw("hello").is_err(), "raw send while disconnected");
        assert!(connection.ping().is_err(), "ping while disconnected");
        assert_eq!(connection.queued(), 0);
    }

    #[test]
    fn snapshot_is_detached_from_engine() {
        let connection = manager(QueueConfig::default());
        let mut snapshot = connection.state();

        snapshot.messages_sent = 99;
        snapshot.status = ConnectionStatus::Connected;

        let fresh = connection.state();
        assert_eq!(fresh.messages_sent, 0);
        assert_eq!(fresh.status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let connection = manager(QueueConfig::default());

        connection.disconnect();
        connection.disconnect();

        let state = connection.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        let core = connection.inner.lock();
        assert!(core.heartbeat.is_none());
        assert!(core.reconnect_timer.is_none());
        assert!(core.shut_down);
    }

    #[tokio::test]
    async fn connect_after_disconnect_is_refused() {
        let connection = manager(QueueConfig::default());
        connection.disconnect();

        let err = connection.connect().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<WsError>(), Some(WsError::Shutdown)));
    }

    #[test]
    fn unsubscribe_unknown_id_is_harmless() {
        let connection = manager(QueueConfig::default());
        let id = connection.subscribe("a", |_: &Message| {});

        assert_eq!(connection.subscription_count(), 1);
        assert!(connection.unsubscribe(id));
        assert!(!connection.unsubscribe(id));
        assert_eq!(connection.subscription_count(), 0);
    }

    #[tokio::test]
    async fn dropping_a_stream_removes_its_subscription() {
        let connection = manager(QueueConfig::default());
        let stream = connection.stream("a");

        assert_eq!(connection.subscription_count(), 1);
        drop(stream);
        assert_eq!(connection.subscription_count(), 0);
    }

    #[test]
    fn debug_shows_address_and_status() {
        let connection = manager(QueueConfig::default());
        let rendered = format!("{connection:?}");

        assert!(rendered.contains("ws://127.0.0.1:9"), "{rendered}");
        assert!(rendered.contains("Disconnected"), "{rendered}");
    }
}
