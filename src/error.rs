//! Error types for the kraken-orderbook crate.
//!
//! Most of these never reach the caller: transport failures and checksum
//! mismatches are recovered inside the client by resubscribing. Only
//! per-symbol subscription failures are surfaced, through
//! [`OrderbookClient::on_error`](crate::client::OrderbookClient::on_error).

use thiserror::Error;

use crate::types::Generation;

/// The main error type for this crate
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration (bad depth, malformed URL, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// REST API returned an error response
    #[error("API error ({}): {}", .0.status, .0.message)]
    Api(ApiError),

    /// REST API rate limit hit
    #[error("Rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited {
        /// Suggested wait time in milliseconds
        retry_after_ms: Option<u64>,
    },

    /// WebSocket connection closed unexpectedly
    #[error("WebSocket connection closed")]
    ConnectionClosed,

    /// The transport could not deliver a request
    #[error("Transport error: {0}")]
    Transport(String),

    /// Locally computed book checksum differs from the exchange's
    #[error(
        "Checksum mismatch for {symbol} (generation {generation}): expected {expected}, computed {computed}"
    )]
    ChecksumMismatch {
        /// Symbol whose book diverged
        symbol: String,
        /// Subscription generation the book belonged to
        generation: Generation,
        /// Digest sent by the exchange
        expected: u32,
        /// Digest computed from the local book
        computed: u32,
    },

    /// No subscribe acknowledgment after all retries
    #[error("Subscription to {symbol} timed out after {attempts} attempts")]
    SubscriptionTimeout {
        /// Symbol that could not be subscribed
        symbol: String,
        /// Number of subscribe attempts made
        attempts: u32,
    },

    /// The exchange refused the subscription
    #[error("Subscription to {symbol} rejected: {reason}")]
    SubscriptionRejected {
        /// Symbol that was rejected
        symbol: String,
        /// Error text returned by the exchange
        reason: String,
    },

    /// A delta was applied to a book that is not valid (sequencing bug)
    #[error("Delta applied to invalid book for {symbol}")]
    InvalidDelta {
        /// Symbol of the book
        symbol: String,
    },

    /// The symbol is unknown to the exchange (no precision available)
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    /// The client was closed
    #[error("Client closed")]
    Closed,
}

/// Error returned by the Kraken REST API
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status code
    pub status: u16,
    /// Error message(s) from the response envelope
    pub message: String,
}

impl ApiError {
    /// Create a new API error
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

impl Error {
    /// Symbol this error ends the subscription of, if any
    pub fn fatal_symbol(&self) -> Option<&str> {
        match self {
            Error::SubscriptionTimeout { symbol, .. }
            | Error::SubscriptionRejected { symbol, .. } => Some(symbol),
            _ => None,
        }
    }
}
