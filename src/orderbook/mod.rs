//! Checksum-verified order books.
//!
//! This module holds everything needed to keep a local copy of an exchange
//! book in sync:
//!
//! - [`book`] - price-level book bounded to a fixed depth
//! - [`checksum`] - the exchange's CRC32 over the top of the book
//! - [`subscription`] - per-symbol subscription lifecycle and timers
//! - [`manager`] - the sans-IO orchestrator combining the three
//!
//! # Example
//!
//! ```rust
//! use kraken_orderbook::orderbook::{checksum, Orderbook};
//! use kraken_orderbook::types::{Precision, Side};
//! use rust_decimal::Decimal;
//!
//! let mut book = Orderbook::new("BTC/USD", 10, Precision::new(1, 8), 1);
//! book.apply_snapshot(
//!     [(Decimal::new(452835, 1), Decimal::new(1, 1))],
//!     [(Decimal::new(452852, 1), Decimal::new(1, 3))],
//! );
//! book.apply_delta(Side::Bid, Decimal::new(452840, 1), Decimal::new(3, 1), None)
//!     .unwrap();
//!
//! assert_eq!(book.best_bid(), Some((Decimal::new(452840, 1), Decimal::new(3, 1))));
//! let _digest = checksum::compute(&book, 10);
//! ```

pub mod book;
pub mod checksum;
pub mod manager;
pub mod subscription;

pub use book::{BookSnapshot, Orderbook};
pub use manager::{BookEvent, OrderbookManager, Output, ResyncReason, SyncState};
pub use subscription::{SubscriptionManager, SubscriptionStatus};
