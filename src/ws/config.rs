#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Backoff;
use bon::Builder;
use rand::Rng as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use url::Url;

use super::events::Hooks;
use crate::Result;
use crate::error::Error;

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_PAYLOAD: &str = r#"{"type":"ping","data":{}}"#;
const DEFAULT_MAX_QUEUE_SIZE: usize = 100;

/// Upper bound of the random component added by [`retry_delay_with_jitter`].
const JITTER_CEILING_MILLIS: u64 = 1_000;

/// Configuration for a [`ConnectionManager`](super::ConnectionManager).
///
/// Only the address is required:
///
/// ```
/// use std::time::Duration;
///
/// use resilient_ws::ws::config::{Config, ReconnectConfig};
///
/// let config = Config::builder()
///     .address("wss://example.com/socket")
///     .reconnect(
///         ReconnectConfig::builder()
///             .max_attempts(10)
///             .initial_backoff(Duration::from_millis(250))
///             .build(),
///     )
///     .build();
///
/// assert_eq!(config.reconnect.max_attempts, 10);
/// assert!(config.heartbeat.enabled);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// `ws://` or `wss://` endpoint
    #[builder(into)]
    pub address: String,
    /// Sub-protocols offered in the `Sec-WebSocket-Protocol` header
    #[builder(default)]
    pub protocols: Vec<String>,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Keep-alive configuration
    #[builder(default)]
    pub heartbeat: HeartbeatConfig,
    /// Outbound buffering while disconnected
    #[builder(default)]
    pub queue: QueueConfig,
    /// Maximum time to wait for the opening handshake. `None` relies on the transport's own
    /// failure signaling.
    pub connect_timeout: Option<Duration>,
    /// Emit lifecycle chatter at `debug` level (requires the `tracing` feature)
    #[builder(default)]
    pub debug: bool,
    /// Lifecycle callbacks
    #[builder(default)]
    pub hooks: Hooks,
}

impl Config {
    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<Url> {
        let url = validate_url(&self.address)?;

        for protocol in &self.protocols {
            if protocol.is_empty() || HeaderValue::from_str(protocol).is_err() {
                return Err(Error::validation(format!(
                    "sub-protocol `{protocol}` is not a valid header value"
                )));
            }
        }

        if self.heartbeat.enabled && self.heartbeat.interval.is_zero() {
            return Err(Error::validation(
                "heartbeat interval must be non-zero when heartbeats are enabled",
            ));
        }

        let multiplier = self.reconnect.backoff_multiplier;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(Error::validation(format!(
                "backoff multiplier must be a positive finite number, got {multiplier}"
            )));
        }

        Ok(url)
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Whether closed or failed connections are retried automatically
    #[builder(default = true)]
    pub enabled: bool,
    /// Maximum number of reconnection attempts before giving up
    #[builder(default = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    pub max_attempts: u32,
    /// Delay before the first reconnection attempt
    #[builder(default = DEFAULT_INITIAL_BACKOFF_DURATION)]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[builder(default = DEFAULT_MAX_BACKOFF_DURATION)]
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (1-indexed):
    /// `min(initial_backoff × multiplier^(attempt − 1), max_backoff)`.
    ///
    /// No jitter is applied.
    #[must_use]
    #[expect(
        clippy::float_arithmetic,
        reason = "Backoff scaling is defined in terms of a floating point multiplier"
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// A fresh backoff schedule for this configuration.
    #[must_use]
    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff {
            config: self.clone(),
            attempt: 0,
        }
    }
}

/// Deterministic reconnect schedule.
///
/// Each call to [`Backoff::next_backoff`] consumes one attempt from the budget and yields its
/// delay; once `max_attempts` have been handed out it yields `None`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Number of attempts handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the attempt budget is used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }
}

impl Backoff for ReconnectBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        self.attempt = self.attempt.saturating_add(1);
        Some(self.config.delay_for_attempt(self.attempt))
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Keep-alive configuration.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct HeartbeatConfig {
    #[builder(default = true)]
    pub enabled: bool,
    /// Interval between heartbeat frames
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub interval: Duration,
    /// Frame sent verbatim on every heartbeat
    #[builder(into, default = DEFAULT_HEARTBEAT_PAYLOAD.to_owned())]
    pub payload: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            payload: DEFAULT_HEARTBEAT_PAYLOAD.to_owned(),
        }
    }
}

/// Outbound buffering while the connection is down.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct QueueConfig {
    #[builder(default = true)]
    pub enabled: bool,
    /// Oldest messages are evicted once this many are waiting
    #[builder(default = DEFAULT_MAX_QUEUE_SIZE)]
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

/// Parse `address` and require a `ws` or `wss` scheme.
pub fn validate_url(address: &str) -> Result<Url> {
    let url = Url::parse(address)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(Error::validation(format!(
            "unsupported scheme `{scheme}` in `{address}`, expected ws or wss"
        ))),
    }
}

/// Jittered retry delay `min(base × 2^attempt, max) + U[0, 1s)`.
///
/// For callers that want to spread retries of their own. The connection engine does not use
/// this; its schedule is [`ReconnectConfig::delay_for_attempt`].
#[must_use]
pub fn retry_delay_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
    let capped = base.checked_mul(factor).unwrap_or(max).min(max);
    let jitter = rand::rng().random_range(0..JITTER_CEILING_MILLIS);

    capped.saturating_add(Duration::from_millis(jitter))
}
