//! Orderbook manager tying books, checksums and subscriptions together.
//!
//! This module provides [`OrderbookManager`], the state machine behind
//! [`OrderbookClient`](crate::client::OrderbookClient). It consumes decoded
//! WebSocket messages and connection events and produces an [`Output`]:
//! requests to send and [`BookEvent`]s to deliver. It never touches the
//! network or a clock, which keeps every sequencing rule testable without
//! a runtime.
//!
//! # Sync states
//!
//! ```text
//! AwaitingSnapshot --snapshot ok--> Synced --checksum mismatch--> Desyncing
//!        ^                                                           |
//!        +--------------------- resubscribe sent --------------------+
//! ```
//!
//! Deltas that arrive while a book waits for its snapshot are queued and
//! replayed, in order, once the snapshot is in.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::error::Error;
use crate::types::messages::{BookData, BookKind, ChannelMessage, MethodResponse, WsMessage};
use crate::types::{Generation, Precision, Side, WsRequest};

use super::book::BookSnapshot;
use super::subscription::{SubscriptionManager, SubscriptionStatus};
use super::{checksum, Orderbook};

/// Synchronization state of a book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Waiting for the snapshot of the current subscription
    AwaitingSnapshot,
    /// Book matches the exchange
    Synced,
    /// Book discarded, resubscribe pending
    Desyncing,
}

/// Why a book was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// Local checksum differs from the exchange's
    ChecksumMismatch {
        /// Digest sent by the exchange
        expected: u32,
        /// Digest computed locally
        computed: u32,
    },
    /// A delta could not be applied
    InvalidDelta,
    /// The transport dropped
    Disconnected,
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResyncReason::ChecksumMismatch { expected, computed } => write!(
                f,
                "checksum mismatch (expected {expected}, computed {computed})"
            ),
            ResyncReason::InvalidDelta => write!(f, "invalid delta"),
            ResyncReason::Disconnected => write!(f, "connection lost"),
        }
    }
}

/// Event produced by the manager
#[derive(Debug)]
pub enum BookEvent {
    /// A book changed and passed checksum verification
    Update(Arc<BookSnapshot>),
    /// A book was discarded and will be rebuilt from a fresh snapshot
    Resyncing {
        /// Symbol
        symbol: String,
        /// What went wrong
        reason: ResyncReason,
    },
    /// A subscription failed for good; the book is gone
    Failed {
        /// Symbol
        symbol: String,
        /// Cause
        error: Error,
    },
}

/// Work produced by one call into the manager
#[derive(Debug, Default)]
pub struct Output {
    /// Requests to send, in order
    pub requests: Vec<WsRequest>,
    /// Events to deliver, in order
    pub events: Vec<BookEvent>,
}

impl Output {
    /// Whether there is nothing to do
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.events.is_empty()
    }
}

#[derive(Debug)]
struct BookEntry {
    book: Orderbook,
    pending: VecDeque<BookData>,
    /// Last verified checksum
    checksum: u32,
}

impl BookEntry {
    fn new(symbol: &str, depth: u32, precision: Precision, generation: Generation) -> Self {
        Self {
            book: Orderbook::new(symbol, depth as usize, precision, generation),
            pending: VecDeque::new(),
            checksum: 0,
        }
    }

    /// Drop all state and start over under a new generation
    fn reset(&mut self, generation: Generation) {
        self.book = Orderbook::new(
            self.book.symbol(),
            self.book.depth(),
            self.book.precision(),
            generation,
        );
        self.pending.clear();
        self.checksum = 0;
    }

    fn publish(&self) -> BookEvent {
        BookEvent::Update(Arc::new(self.book.snapshot(self.book.depth(), self.checksum)))
    }

    fn verify(&mut self, expected: u32, checksum_depth: usize) -> Result<(), Error> {
        let computed = checksum::compute(&self.book, checksum_depth);
        if computed != expected {
            return Err(Error::ChecksumMismatch {
                symbol: self.book.symbol().to_string(),
                generation: self.book.generation(),
                expected,
                computed,
            });
        }
        self.checksum = computed;
        Ok(())
    }

    fn apply_snapshot(
        &mut self,
        data: &BookData,
        checksum_depth: usize,
        events: &mut Vec<BookEvent>,
    ) -> Result<(), Error> {
        self.book.apply_snapshot(
            data.bids.iter().map(|l| (l.price, l.qty)),
            data.asks.iter().map(|l| (l.price, l.qty)),
        );
        self.verify(data.checksum, checksum_depth)?;
        events.push(self.publish());

        while let Some(update) = self.pending.pop_front() {
            self.apply_update(&update, checksum_depth, events)?;
        }
        Ok(())
    }

    fn apply_update(
        &mut self,
        data: &BookData,
        checksum_depth: usize,
        events: &mut Vec<BookEvent>,
    ) -> Result<(), Error> {
        let timestamp = data.timestamp.as_deref();
        for level in &data.asks {
            self.book
                .apply_delta(Side::Ask, level.price, level.qty, timestamp)?;
        }
        for level in &data.bids {
            self.book
                .apply_delta(Side::Bid, level.price, level.qty, timestamp)?;
        }
        self.verify(data.checksum, checksum_depth)?;
        events.push(self.publish());
        Ok(())
    }
}

/// Sans-IO order-book orchestrator.
///
/// Owns one [`Orderbook`] per subscribed symbol and the
/// [`SubscriptionManager`] that decides which incoming data belongs to the
/// current subscription. All methods take the current time where timers
/// are involved and return the resulting [`Output`].
///
/// # Example
///
/// ```rust
/// use kraken_orderbook::orderbook::OrderbookManager;
/// use kraken_orderbook::types::Precision;
/// use kraken_orderbook::Config;
/// use tokio::time::Instant;
///
/// let mut manager = OrderbookManager::new(&Config::new());
/// let now = Instant::now();
///
/// manager.handle_connected(now);
/// let out = manager.subscribe("BTC/USD", 10, Precision::new(1, 8), now);
/// assert_eq!(out.requests.len(), 1);
/// ```
#[derive(Debug)]
pub struct OrderbookManager {
    subscriptions: SubscriptionManager,
    books: FxHashMap<String, BookEntry>,
    checksum_depth: usize,
}

impl OrderbookManager {
    /// Create an empty manager
    pub fn new(config: &Config) -> Self {
        Self {
            subscriptions: SubscriptionManager::new(config),
            books: FxHashMap::default(),
            checksum_depth: config.checksum_depth(),
        }
    }

    /// Subscribe to the book of `symbol`
    ///
    /// Idempotent: a symbol that is already subscribed (or on its way)
    /// keeps its book.
    pub fn subscribe(
        &mut self,
        symbol: &str,
        depth: u32,
        precision: Precision,
        now: Instant,
    ) -> Output {
        let mut out = Output::default();
        let (request, generation) = self.subscriptions.subscribe(symbol, depth, now);
        if let Some(generation) = generation {
            self.books.insert(
                symbol.to_string(),
                BookEntry::new(symbol, depth, precision, generation),
            );
        }
        out.requests.extend(request);
        out
    }

    /// Unsubscribe from the book of `symbol` and drop it
    pub fn unsubscribe(&mut self, symbol: &str) -> Output {
        let mut out = Output::default();
        out.requests.extend(self.subscriptions.unsubscribe(symbol));
        self.books.remove(symbol);
        out
    }

    /// The transport is up: (re)subscribe everything wanted
    pub fn handle_connected(&mut self, now: Instant) -> Output {
        Output {
            requests: self.subscriptions.on_connect(now),
            events: Vec::new(),
        }
    }

    /// The transport dropped: discard every book
    pub fn handle_disconnected(&mut self) -> Output {
        let mut out = Output::default();
        let symbols = self.subscriptions.on_disconnect();
        self.books
            .retain(|symbol, _| symbols.iter().any(|s| s == symbol));

        for symbol in symbols {
            let Some(generation) = self.subscriptions.generation(&symbol) else {
                continue;
            };
            if let Some(entry) = self.books.get_mut(&symbol) {
                entry.reset(generation);
            }
            out.events.push(BookEvent::Resyncing {
                symbol,
                reason: ResyncReason::Disconnected,
            });
        }
        out
    }

    /// Fire subscription timers due at `now`
    pub fn poll_timers(&mut self, now: Instant) -> Output {
        let mut out = Output::default();
        let (requests, failures) = self.subscriptions.poll_timers(now);
        out.requests = requests;
        for failure in failures {
            self.fail(failure, &mut out);
        }
        out
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work
    pub fn next_deadline(&self) -> Option<Instant> {
        self.subscriptions.next_deadline()
    }

    /// Process one decoded WebSocket message
    pub fn handle_message(&mut self, message: &WsMessage, now: Instant) -> Output {
        let mut out = Output::default();
        match message {
            WsMessage::Method(response) => self.handle_response(response, &mut out),
            WsMessage::Channel(ChannelMessage::Book(book)) => {
                for data in &book.data {
                    self.handle_book_data(book.kind, data, now, &mut out);
                }
            }
            WsMessage::Channel(ChannelMessage::Status { data }) => {
                for status in data {
                    debug!(
                        system = ?status.system,
                        api_version = ?status.api_version,
                        "Exchange status"
                    );
                }
            }
            WsMessage::Channel(ChannelMessage::Heartbeat) => trace!("Heartbeat"),
            WsMessage::Channel(ChannelMessage::Other) => {}
        }
        out
    }

    fn handle_response(&mut self, response: &MethodResponse, out: &mut Output) {
        if !response.is_book() {
            return;
        }
        let Some(symbol) = response.symbol() else {
            if let Some(err) = &response.error {
                warn!(method = %response.method, error = %err, "Request failed");
            }
            return;
        };

        match response.method.as_str() {
            "subscribe" if response.is_success() => {
                let (_, cleanup) = self.subscriptions.on_subscribe_ack(response.req_id, symbol);
                out.requests.extend(cleanup);
            }
            "subscribe" => {
                let reason = response.error.as_deref().unwrap_or("unknown error");
                match self
                    .subscriptions
                    .on_subscribe_error(response.req_id, symbol, reason)
                {
                    Ok((_, cleanup)) => out.requests.extend(cleanup),
                    Err(err) => self.fail(err, out),
                }
            }
            "unsubscribe" => {
                if let Some(err) = &response.error {
                    debug!(symbol = %symbol, error = %err, "Unsubscribe failed");
                }
                self.subscriptions.on_unsubscribe_ack(symbol);
            }
            other => trace!(method = %other, "Ignoring response"),
        }
    }

    fn handle_book_data(&mut self, kind: BookKind, data: &BookData, now: Instant, out: &mut Output) {
        let symbol = data.symbol.as_str();
        let Some(generation) = self.subscriptions.data_generation(symbol) else {
            debug!(
                symbol = %symbol,
                status = ?self.subscriptions.status(symbol),
                "Dropping book data outside the current subscription"
            );
            return;
        };
        let checksum_depth = self.checksum_depth;
        let Some(entry) = self.books.get_mut(symbol) else {
            return;
        };
        if entry.book.generation() != generation {
            debug!(
                symbol = %symbol,
                book_generation = entry.book.generation(),
                generation,
                "Dropping book data for another generation"
            );
            return;
        }

        let result = match kind {
            BookKind::Snapshot => entry.apply_snapshot(data, checksum_depth, &mut out.events),
            BookKind::Update if !entry.book.is_valid() => {
                trace!(symbol = %symbol, queued = entry.pending.len() + 1, "Queueing update");
                entry.pending.push_back(data.clone());
                Ok(())
            }
            BookKind::Update => entry.apply_update(data, checksum_depth, &mut out.events),
        };

        if let Err(err) = result {
            let reason = match err {
                Error::ChecksumMismatch {
                    expected, computed, ..
                } => {
                    warn!(
                        symbol = %symbol,
                        generation,
                        expected,
                        computed,
                        "Checksum mismatch, resubscribing"
                    );
                    ResyncReason::ChecksumMismatch { expected, computed }
                }
                err => {
                    error!(symbol = %symbol, generation, error = %err, "Failed to apply book data");
                    ResyncReason::InvalidDelta
                }
            };
            self.resync(symbol, reason, now, out);
        }
    }

    /// Discard the book of `symbol` and resubscribe it
    fn resync(&mut self, symbol: &str, reason: ResyncReason, now: Instant, out: &mut Output) {
        let (request, generation) = self.subscriptions.begin_resync(symbol, now);
        let Some(generation) = generation else {
            return;
        };
        if let Some(entry) = self.books.get_mut(symbol) {
            entry.reset(generation);
        }
        out.requests.extend(request);
        out.events.push(BookEvent::Resyncing {
            symbol: symbol.to_string(),
            reason,
        });
    }

    fn fail(&mut self, err: Error, out: &mut Output) {
        let Some(symbol) = err.fatal_symbol().map(str::to_string) else {
            return;
        };
        error!(symbol = %symbol, error = %err, "Book subscription failed");
        self.books.remove(&symbol);
        out.events.push(BookEvent::Failed { symbol, error: err });
    }

    /// Verified state of a book, `None` unless synced
    pub fn snapshot(&self, symbol: &str) -> Option<BookSnapshot> {
        self.books
            .get(symbol)
            .filter(|entry| entry.book.is_valid())
            .map(|entry| entry.book.snapshot(entry.book.depth(), entry.checksum))
    }

    /// Live book of a symbol
    pub fn book(&self, symbol: &str) -> Option<&Orderbook> {
        self.books.get(symbol).map(|entry| &entry.book)
    }

    /// Sync state of a book
    pub fn state(&self, symbol: &str) -> Option<SyncState> {
        let entry = self.books.get(symbol)?;
        Some(if entry.book.is_valid() {
            SyncState::Synced
        } else if self.subscriptions.status(symbol) == SubscriptionStatus::Resyncing {
            SyncState::Desyncing
        } else {
            SyncState::AwaitingSnapshot
        })
    }

    /// Subscription status of a symbol
    pub fn status(&self, symbol: &str) -> SubscriptionStatus {
        self.subscriptions.status(symbol)
    }

    /// Number of updates queued for a book awaiting its snapshot
    pub fn pending_len(&self, symbol: &str) -> usize {
        self.books.get(symbol).map_or(0, |entry| entry.pending.len())
    }

    /// Symbols with a book
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.books.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Whether any book is tracked
    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
