//! Core orderbook data structure.
//!
//! This implementation uses `BTreeMap` for sorted price levels, providing:
//!
//! - O(log n) insertion, deletion, and lookup
//! - O(1) access to best bid/ask (via `last_key_value` / `first_key_value`)
//! - Ordered iteration for the checksum and depth-of-book queries

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::Error;
use crate::types::{Generation, Level, Precision, Price, Quantity, Side};

#[derive(Debug, Clone, PartialEq, Eq)]
struct LevelEntry {
    qty: Quantity,
    timestamp: Option<String>,
}

/// Price-level orderbook for a single symbol.
///
/// # Design Decisions
///
/// 1. **Exact decimals**: prices and quantities are normalised to the
///    symbol's [`Precision`] on the way in, so equal prices always hit the
///    same key and the checksum sees the exchange's own digits.
///
/// 2. **Bounded depth**: after every mutation each side is truncated to
///    `depth` levels by dropping the least competitive ones.
///
/// 3. **Validity flag**: a book that is waiting for its snapshot (or was
///    discarded by a resync) is invalid and rejects deltas.
///
/// # Thread Safety
///
/// This struct is `Send + Sync` but not internally synchronized. The
/// client mutates it from a single task and hands out [`BookSnapshot`]
/// copies.
#[derive(Debug, Clone)]
pub struct Orderbook {
    /// Symbol, e.g. `BTC/USD`
    symbol: String,

    /// Maximum levels retained per side
    depth: usize,

    /// Fractional digits of prices and quantities
    precision: Precision,

    /// Bid levels, sorted ascending by price (best bid = highest = last)
    bids: BTreeMap<Price, LevelEntry>,

    /// Ask levels, sorted ascending by price (best ask = lowest = first)
    asks: BTreeMap<Price, LevelEntry>,

    /// False until a snapshot is applied
    valid: bool,

    /// Subscription generation this book belongs to
    generation: Generation,
}

impl Orderbook {
    /// Create an empty, invalid orderbook
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        depth: usize,
        precision: Precision,
        generation: Generation,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            depth,
            precision,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            valid: false,
            generation,
        }
    }

    /// Get the symbol
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Get the configured depth
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Get the precision used for normalisation and checksums
    #[must_use]
    pub const fn precision(&self) -> Precision {
        self.precision
    }

    /// Get the subscription generation
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Whether the book holds a synchronized state
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    /// Apply a snapshot
    ///
    /// This replaces the entire orderbook state and marks it valid.
    /// Zero-quantity levels are skipped.
    pub fn apply_snapshot<B, A>(&mut self, bids: B, asks: A)
    where
        B: IntoIterator<Item = (Price, Quantity)>,
        A: IntoIterator<Item = (Price, Quantity)>,
    {
        self.bids.clear();
        self.asks.clear();

        for (price, qty) in bids {
            self.insert_level(Side::Bid, price, qty, None);
        }
        for (price, qty) in asks {
            self.insert_level(Side::Ask, price, qty, None);
        }

        self.truncate(Side::Bid);
        self.truncate(Side::Ask);
        self.valid = true;
    }

    /// Apply a single level change
    ///
    /// A zero quantity removes the level (no-op if absent); anything else
    /// inserts or replaces it. The side is re-truncated to `depth`
    /// afterwards, so a price better than the current worst level pushes
    /// that level out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDelta`] if the book is not valid. Deltas
    /// that arrive before the snapshot must be queued by the caller.
    pub fn apply_delta(
        &mut self,
        side: Side,
        price: Price,
        qty: Quantity,
        timestamp: Option<&str>,
    ) -> Result<(), Error> {
        if !self.valid {
            return Err(Error::InvalidDelta {
                symbol: self.symbol.clone(),
            });
        }

        let price = self.precision.price(price);
        let qty = self.precision.qty(qty);
        if qty.is_zero() {
            self.side_mut(side).remove(&price);
        } else {
            self.side_mut(side).insert(
                price,
                LevelEntry {
                    qty,
                    timestamp: timestamp.map(str::to_string),
                },
            );
            self.truncate(side);
        }
        Ok(())
    }

    /// Discard all levels and mark the book invalid
    pub fn invalidate(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.valid = false;
    }

    fn insert_level(&mut self, side: Side, price: Price, qty: Quantity, timestamp: Option<String>) {
        let price = self.precision.price(price);
        let qty = self.precision.qty(qty);
        if qty.is_zero() {
            return;
        }
        self.side_mut(side).insert(price, LevelEntry { qty, timestamp });
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Price, LevelEntry> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    /// Drop the least competitive levels beyond `depth`
    fn truncate(&mut self, side: Side) {
        let depth = self.depth;
        let levels = self.side_mut(side);
        while levels.len() > depth {
            // Worst bid is the lowest price, worst ask the highest.
            match side {
                Side::Bid => levels.pop_first(),
                Side::Ask => levels.pop_last(),
            };
        }
    }

    /// Get the best bid (highest bid)
    ///
    /// Returns `(price, quantity)` or `None` if no bids.
    #[must_use]
    pub fn best_bid(&self) -> Option<(Price, Quantity)> {
        self.bids.last_key_value().map(|(&p, e)| (p, e.qty))
    }

    /// Get the best ask (lowest ask)
    ///
    /// Returns `(price, quantity)` or `None` if no asks.
    #[must_use]
    pub fn best_ask(&self) -> Option<(Price, Quantity)> {
        self.asks.first_key_value().map(|(&p, e)| (p, e.qty))
    }

    /// Get the mid price
    ///
    /// Returns the average of best bid and best ask, or `None` if either is missing.
    #[must_use]
    pub fn mid_price(&self) -> Option<Price> {
        mid_price(self.best_bid(), self.best_ask())
    }

    /// Get the spread
    #[must_use]
    pub fn spread(&self) -> Option<Price> {
        spread(self.best_bid(), self.best_ask())
    }

    /// Check if the book is crossed (best bid >= best ask)
    ///
    /// This shouldn't happen in a healthy market but is useful for validation.
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => bid >= ask,
            _ => false,
        }
    }

    /// Get all bid levels, sorted by price descending (best first)
    pub fn bids(&self) -> impl Iterator<Item = (Price, Quantity)> + '_ {
        self.bids.iter().rev().map(|(&p, e)| (p, e.qty))
    }

    /// Get all ask levels, sorted by price ascending (best first)
    pub fn asks(&self) -> impl Iterator<Item = (Price, Quantity)> + '_ {
        self.asks.iter().map(|(&p, e)| (p, e.qty))
    }

    /// Get up to `n` best levels per side as owned values
    ///
    /// Returns `(bids, asks)`, each ordered best first.
    #[must_use]
    pub fn top(&self, n: usize) -> (Vec<Level>, Vec<Level>) {
        let to_level = |(&price, entry): (&Price, &LevelEntry)| Level {
            price,
            qty: entry.qty,
            timestamp: entry.timestamp.clone(),
        };
        let bids = self.bids.iter().rev().take(n).map(to_level).collect();
        let asks = self.asks.iter().take(n).map(to_level).collect();
        (bids, asks)
    }

    /// Copy the top `n` levels into an immutable snapshot
    #[must_use]
    pub fn snapshot(&self, n: usize, checksum: u32) -> BookSnapshot {
        let (bids, asks) = self.top(n);
        BookSnapshot {
            symbol: self.symbol.clone(),
            bids,
            asks,
            generation: self.generation,
            checksum,
        }
    }

    /// Check if the orderbook is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Get the number of price levels as `(bids, asks)`
    #[must_use]
    pub fn num_levels(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}

/// Immutable copy of the top of a book
///
/// Handed to update callbacks and returned by
/// [`OrderbookClient::get_snapshot`](crate::client::OrderbookClient::get_snapshot).
/// Later mutations of the live book never affect an existing snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookSnapshot {
    /// Symbol
    pub symbol: String,
    /// Bid levels, best (highest) first
    pub bids: Vec<Level>,
    /// Ask levels, best (lowest) first
    pub asks: Vec<Level>,
    /// Subscription generation that produced this state
    pub generation: Generation,
    /// Verified checksum of this state
    pub checksum: u32,
}

impl BookSnapshot {
    /// Best bid as `(price, quantity)`
    pub fn best_bid(&self) -> Option<(Price, Quantity)> {
        self.bids.first().map(|l| (l.price, l.qty))
    }

    /// Best ask as `(price, quantity)`
    pub fn best_ask(&self) -> Option<(Price, Quantity)> {
        self.asks.first().map(|l| (l.price, l.qty))
    }

    /// Mid price
    pub fn mid_price(&self) -> Option<Price> {
        mid_price(self.best_bid(), self.best_ask())
    }

    /// Spread
    pub fn spread(&self) -> Option<Price> {
        spread(self.best_bid(), self.best_ask())
    }
}

fn mid_price(bid: Option<(Price, Quantity)>, ask: Option<(Price, Quantity)>) -> Option<Price> {
    match (bid, ask) {
        (Some((bid, _)), Some((ask, _))) => Some((bid + ask) / Price::TWO),
        _ => None,
    }
}

fn spread(bid: Option<(Price, Quantity)>, ask: Option<(Price, Quantity)>) -> Option<Price> {
    match (bid, ask) {
        (Some((bid, _)), Some((ask, _))) => Some(ask - bid),
        _ => None,
    }
}
