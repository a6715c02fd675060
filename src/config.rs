//! Configuration for the order-book client.
//!
//! This module provides the [`Config`] struct for endpoints, book depth,
//! and the timing of subscription retries and reconnects.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::Error;
use crate::types::Precision;

/// Default public WebSocket v2 endpoint
pub const DEFAULT_WS_URL: &str = "wss://ws.kraken.com/v2";

/// Default REST base URL
pub const DEFAULT_REST_URL: &str = "https://api.kraken.com/0";

/// Book depths accepted by the `book` channel
pub const VALID_DEPTHS: [u32; 5] = [10, 25, 100, 500, 1000];

/// Number of levels per side covered by the exchange checksum
pub const CHECKSUM_DEPTH: usize = 10;

/// Exponential backoff settings
///
/// Used both for transport reconnects and for subscribe retries after an
/// acknowledgment timeout.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Randomise each delay within `[delay / 2, delay]`
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Backoff used for reconnecting the transport: never gives up
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(180),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set maximum attempts (0 = infinite)
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the initial delay
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether `attempts` failed attempts exhaust the budget
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }

    /// Calculate the (unjittered) delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let delay = initial_ms * self.multiplier.powi(attempt.min(32) as i32);
        let delay_ms = delay.min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Delay for an attempt with jitter applied when enabled
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let spread = rand::random::<f64>();
        half + half.mul_f64(spread)
    }
}

/// Configuration for the order-book client
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use kraken_orderbook::Config;
/// use kraken_orderbook::types::Precision;
///
/// let config = Config::new()
///     .with_depth(25)
///     .with_subscribe_timeout(Duration::from_secs(5))
///     .with_precision("BTC/USD", Precision::new(1, 8));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    ws_url: String,
    rest_url: String,

    /// HTTP request timeout
    timeout: Duration,

    /// Default book depth for subscriptions
    depth: u32,

    /// Levels per side fed into the checksum
    checksum_depth: usize,

    /// How long to wait for a subscribe acknowledgment
    subscribe_timeout: Duration,

    /// Retry policy after subscribe timeouts
    subscribe_retry: BackoffConfig,

    /// Pause between unsubscribe and resubscribe during a resync
    resync_delay: Duration,

    /// Transport reconnect policy
    reconnect: BackoffConfig,

    /// Interval between application-level pings
    ping_interval: Duration,

    /// Decimal precision per symbol, bypassing the REST lookup
    precisions: HashMap<String, Precision>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Create a configuration pointing at the public production endpoints
    pub fn new() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            rest_url: DEFAULT_REST_URL.to_string(),
            timeout: Duration::from_secs(10),
            depth: 10,
            checksum_depth: CHECKSUM_DEPTH,
            subscribe_timeout: Duration::from_secs(10),
            subscribe_retry: BackoffConfig::default(),
            resync_delay: Duration::from_secs(3),
            reconnect: BackoffConfig::reconnect(),
            ping_interval: Duration::from_secs(10),
            precisions: HashMap::new(),
        }
    }

    /// Set the WebSocket URL
    #[must_use]
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    /// Set the REST base URL
    #[must_use]
    pub fn with_rest_url(mut self, url: impl Into<String>) -> Self {
        self.rest_url = url.into();
        self
    }

    /// Set the HTTP request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the default book depth
    #[must_use]
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Set how many levels per side the checksum covers
    #[must_use]
    pub fn with_checksum_depth(mut self, checksum_depth: usize) -> Self {
        self.checksum_depth = checksum_depth;
        self
    }

    /// Set the subscribe acknowledgment timeout
    #[must_use]
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Set the subscribe retry policy
    #[must_use]
    pub fn with_subscribe_retry(mut self, retry: BackoffConfig) -> Self {
        self.subscribe_retry = retry;
        self
    }

    /// Set the pause between unsubscribe and resubscribe during a resync
    #[must_use]
    pub fn with_resync_delay(mut self, delay: Duration) -> Self {
        self.resync_delay = delay;
        self
    }

    /// Set the transport reconnect policy
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: BackoffConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the ping interval
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Register the decimal precision of a symbol
    ///
    /// Symbols with a registered precision never hit the REST API.
    #[must_use]
    pub fn with_precision(mut self, symbol: impl Into<String>, precision: Precision) -> Self {
        self.precisions.insert(symbol.into(), precision);
        self
    }

    /// Get the WebSocket URL
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Get the REST base URL
    pub fn rest_url(&self) -> &str {
        &self.rest_url
    }

    /// Get the HTTP timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get the default depth
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Get the checksum depth
    pub fn checksum_depth(&self) -> usize {
        self.checksum_depth
    }

    /// Get the subscribe acknowledgment timeout
    pub fn subscribe_timeout(&self) -> Duration {
        self.subscribe_timeout
    }

    /// Get the subscribe retry policy
    pub fn subscribe_retry(&self) -> &BackoffConfig {
        &self.subscribe_retry
    }

    /// Get the resync delay
    pub fn resync_delay(&self) -> Duration {
        self.resync_delay
    }

    /// Get the reconnect policy
    pub fn reconnect(&self) -> &BackoffConfig {
        &self.reconnect
    }

    /// Get the ping interval
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Get a registered precision
    pub fn precision(&self, symbol: &str) -> Option<Precision> {
        self.precisions.get(symbol).copied()
    }

    /// Check the configuration for values the exchange would reject
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), Error> {
        validate_depth(self.depth)?;
        if self.checksum_depth == 0 {
            return Err(Error::Config("checksum depth must be positive".into()));
        }
        if !self.ws_url.starts_with("ws://") && !self.ws_url.starts_with("wss://") {
            return Err(Error::Config(format!("invalid WebSocket URL: {}", self.ws_url)));
        }
        if self.subscribe_timeout.is_zero() {
            return Err(Error::Config("subscribe timeout must be positive".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(Error::Config("ping interval must be positive".into()));
        }
        Ok(())
    }
}

/// Check that a depth is one the `book` channel accepts
///
/// # Errors
///
/// Returns [`Error::Config`] for unsupported depths.
pub fn validate_depth(depth: u32) -> Result<(), Error> {
    if VALID_DEPTHS.contains(&depth) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "unsupported book depth {depth}, expected one of {VALID_DEPTHS:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config() {
        let config = Config::new();
        assert_eq!(config.ws_url(), DEFAULT_WS_URL);
        assert_eq!(config.depth(), 10);
        assert_eq!(config.checksum_depth(), 10);
        assert_eq!(config.subscribe_timeout(), Duration::from_secs(10));
        assert_eq!(config.resync_delay(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = Config::new()
            .with_depth(100)
            .with_ws_url("ws://127.0.0.1:9000")
            .with_resync_delay(Duration::ZERO)
            .with_precision("ETH/USD", Precision::new(2, 8));

        assert_eq!(config.depth(), 100);
        assert_eq!(config.ws_url(), "ws://127.0.0.1:9000");
        assert_eq!(config.resync_delay(), Duration::ZERO);
        assert_eq!(config.precision("ETH/USD"), Some(Precision::new(2, 8)));
        assert_eq!(config.precision("BTC/USD"), None);
    }

    #[test]
    fn test_invalid_depth_rejected() {
        assert_err!(Config::new().with_depth(50).validate());
        assert_ok!(validate_depth(1000));
        assert_err!(validate_depth(0));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = Config::new().with_ws_url("http://ws.kraken.com").validate();
        assert!(matches!(err, Err(Error::Config(_))));
        let err = Config::new().with_ping_interval(Duration::ZERO).validate();
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_delay_calculation() {
        let backoff = BackoffConfig::default()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(1000));

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
        // Should cap at max_delay
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = BackoffConfig::default()
            .initial_delay(Duration::from_millis(400))
            .jitter(true);
        for _ in 0..100 {
            let delay = backoff.jittered_delay(0);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_exhausted() {
        let backoff = BackoffConfig::default().max_attempts(3);
        assert!(!backoff.exhausted(2));
        assert!(backoff.exhausted(3));
        assert!(!BackoffConfig::reconnect().exhausted(u32::MAX));
    }
}
