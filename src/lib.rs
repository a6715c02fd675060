//! # kraken-orderbook
//!
//! Realtime, checksum-verified order books for [Kraken](https://www.kraken.com)
//! Spot, built on the public WebSocket v2 `book` channel.
//!
//! ## Features
//!
//! - **Self-healing books** - every update is verified against the
//!   exchange's CRC32 checksum; a mismatch resubscribes that symbol only
//! - **Reconnects** - the connection is re-established with jittered
//!   exponential backoff and every book is rebuilt from a fresh snapshot
//! - **Race-free reads** - callers get immutable [`BookSnapshot`]s
//! - **Sans-IO core** - [`orderbook::OrderbookManager`] is a plain state
//!   machine that can be driven and tested without a network
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kraken_orderbook::{Config, OrderbookClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kraken_orderbook::Error> {
//!     let client = OrderbookClient::connect(Config::new())?;
//!
//!     client.on_update(|book| {
//!         if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
//!             println!("{}: {} / {}", book.symbol, bid.0, ask.0);
//!         }
//!     });
//!     client.on_error(|symbol, err| eprintln!("{symbol} failed: {err}"));
//!
//!     client.subscribe(&["BTC/USD"], 10).await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Price Representation
//!
//! Prices and quantities are [`rust_decimal::Decimal`]s rescaled to the
//! pair's published number of decimals, so the checksum is computed over
//! exactly the digits the exchange used.
//!
//! ## Architecture
//!
//! - [`client`] - public client, WebSocket transport, REST precision lookup
//! - [`orderbook`] - book, checksum, subscription state and orchestrator
//! - [`types`] - wire and domain types
//! - [`config`] - endpoints, depth, timeouts and backoff
//! - [`error`] - error types for the crate

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod orderbook;
pub mod types;

// Re-export main types at crate root for convenience
pub use client::OrderbookClient;
pub use config::Config;
pub use error::Error;
pub use orderbook::{BookSnapshot, ResyncReason};

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;
