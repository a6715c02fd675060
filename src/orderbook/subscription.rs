//! Subscription state per symbol.
//!
//! [`SubscriptionManager`] tracks which books the caller wants, which ones
//! the exchange has confirmed, and drives subscribe, unsubscribe and
//! resubscribe requests. It performs no I/O: every operation returns the
//! [`WsRequest`]s to send, and timers are reported through
//! [`SubscriptionManager::next_deadline`] and fired by
//! [`SubscriptionManager::poll_timers`].
//!
//! ```text
//! Unsubscribed -> Subscribing -> Subscribed -> Resyncing -> Subscribing -> ...
//!                                     \-> Unsubscribing -> Unsubscribed
//! ```

use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, Config};
use crate::error::Error;
use crate::types::messages::WsRequest;
use crate::types::Generation;

/// Subscription status of a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Not subscribed and not wanted
    Unsubscribed,
    /// Subscribe request sent (or about to be retried), no ack yet
    Subscribing,
    /// Exchange confirmed the subscription
    Subscribed,
    /// Book discarded, waiting to resubscribe
    Resyncing,
    /// Unsubscribe request sent, waiting for the ack
    Unsubscribing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Subscribe sent, waiting for the ack
    AckTimeout,
    /// Waiting to (re)send the subscribe
    Retry,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    at: Instant,
    kind: TimerKind,
}

#[derive(Debug, Clone)]
struct Subscription {
    status: SubscriptionStatus,
    desired: bool,
    active: bool,
    generation: Generation,
    depth: u32,
    /// Consecutive subscribe timeouts in the current generation
    attempts: u32,
    /// A subscribe for the current generation is on the wire
    in_flight: bool,
    /// An unsubscribe from a superseded generation has not been acked yet
    draining: bool,
    timer: Option<Timer>,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    symbol: String,
    generation: Generation,
    depth: u32,
}

/// Result of a subscribe acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ack confirms the current subscription
    Accepted(Generation),
    /// The ack belongs to a superseded attempt and was ignored
    Stale,
}

/// Subscription bookkeeping for all symbols of one client
#[derive(Debug)]
pub struct SubscriptionManager {
    subs: FxHashMap<String, Subscription>,
    requests: FxHashMap<u64, PendingRequest>,
    next_req_id: u64,
    next_generation: Generation,
    connected: bool,
    ack_timeout: Duration,
    retry: BackoffConfig,
    resync_delay: Duration,
}

impl SubscriptionManager {
    /// Create a manager using the timing settings from `config`
    pub fn new(config: &Config) -> Self {
        Self {
            subs: FxHashMap::default(),
            requests: FxHashMap::default(),
            next_req_id: 1,
            next_generation: 1,
            connected: false,
            ack_timeout: config.subscribe_timeout(),
            retry: config.subscribe_retry().clone(),
            resync_delay: config.resync_delay(),
        }
    }

    /// Whether the transport is currently connected
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Status of a symbol
    pub fn status(&self, symbol: &str) -> SubscriptionStatus {
        self.subs
            .get(symbol)
            .map_or(SubscriptionStatus::Unsubscribed, |s| s.status)
    }

    /// Current generation of a symbol
    pub fn generation(&self, symbol: &str) -> Option<Generation> {
        self.subs.get(symbol).map(|s| s.generation)
    }

    /// Depth a symbol is subscribed with
    pub fn depth(&self, symbol: &str) -> Option<u32> {
        self.subs.get(symbol).map(|s| s.depth)
    }

    /// Whether the exchange has confirmed this symbol
    pub fn is_active(&self, symbol: &str) -> bool {
        self.subs.get(symbol).is_some_and(|s| s.active)
    }

    /// All symbols currently tracked
    pub fn symbols(&self) -> Vec<String> {
        self.subs.keys().cloned().collect()
    }

    fn take_req_id(&mut self) -> u64 {
        let id = self.next_req_id;
        self.next_req_id += 1;
        id
    }

    // Generations are drawn from one counter so a symbol that is dropped
    // and re-added never reuses a number.
    fn take_generation(&mut self) -> Generation {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Request a subscription
    ///
    /// No-op if the symbol is already subscribed or on its way there. When
    /// a new attempt starts its generation is returned together with the
    /// request to send (`None` while disconnected; the subscribe goes out
    /// on the next connect).
    pub fn subscribe(
        &mut self,
        symbol: &str,
        depth: u32,
        now: Instant,
    ) -> (Option<WsRequest>, Option<Generation>) {
        let status = self.status(symbol);
        if matches!(
            status,
            SubscriptionStatus::Subscribed
                | SubscriptionStatus::Subscribing
                | SubscriptionStatus::Resyncing
        ) {
            if let Some(sub) = self.subs.get(symbol) {
                if sub.depth != depth {
                    warn!(
                        symbol = %symbol,
                        current = sub.depth,
                        requested = depth,
                        "Already subscribed with a different depth, keeping current"
                    );
                }
            }
            return (None, None);
        }

        let generation = self.take_generation();
        self.subs.insert(
            symbol.to_string(),
            Subscription {
                status: SubscriptionStatus::Subscribing,
                desired: true,
                active: false,
                generation,
                depth,
                attempts: 0,
                in_flight: false,
                // The previous subscription's data keeps flowing until the
                // exchange acks its unsubscribe.
                draining: status == SubscriptionStatus::Unsubscribing,
                timer: None,
            },
        );

        let request = if self.connected {
            self.send_subscribe(symbol, now)
        } else {
            debug!(symbol = %symbol, "Transport down, subscribe deferred until reconnect");
            None
        };
        (request, Some(generation))
    }

    fn send_subscribe(&mut self, symbol: &str, now: Instant) -> Option<WsRequest> {
        let req_id = self.take_req_id();
        let ack_timeout = self.ack_timeout;
        let sub = self.subs.get_mut(symbol)?;

        sub.status = SubscriptionStatus::Subscribing;
        sub.in_flight = true;
        sub.timer = Some(Timer {
            at: now + ack_timeout,
            kind: TimerKind::AckTimeout,
        });
        self.requests.insert(
            req_id,
            PendingRequest {
                symbol: symbol.to_string(),
                generation: sub.generation,
                depth: sub.depth,
            },
        );

        info!(
            symbol = %symbol,
            generation = sub.generation,
            attempt = sub.attempts + 1,
            req_id,
            "Subscribing to book"
        );
        Some(WsRequest::subscribe_book(symbol, sub.depth, req_id))
    }

    fn unsubscribe_request(&mut self, symbol: &str, depth: u32) -> WsRequest {
        let req_id = self.take_req_id();
        WsRequest::unsubscribe_book(symbol, depth, req_id)
    }

    /// Handle a successful subscribe response
    ///
    /// Acks for any attempt of the current generation are accepted, late
    /// ones included. Returns an unsubscribe request when the exchange
    /// confirmed a subscription nobody wants any more.
    pub fn on_subscribe_ack(
        &mut self,
        req_id: Option<u64>,
        symbol: &str,
    ) -> (AckOutcome, Option<WsRequest>) {
        let request = req_id
            .and_then(|id| self.requests.remove(&id))
            .filter(|req| req.symbol == symbol);

        let Some(sub) = self.subs.get_mut(symbol) else {
            return match request {
                Some(req) => {
                    debug!(symbol = %symbol, "Ack for dropped subscription, cancelling it");
                    (AckOutcome::Stale, Some(self.unsubscribe_request(symbol, req.depth)))
                }
                None => (AckOutcome::Stale, None),
            };
        };

        let current = match (&request, req_id) {
            (Some(req), _) => req.generation == sub.generation,
            (None, id) => id.is_none(),
        };
        if !current || sub.status != SubscriptionStatus::Subscribing {
            debug!(
                symbol = %symbol,
                req_generation = ?request.as_ref().map(|r| r.generation),
                generation = sub.generation,
                status = ?sub.status,
                "Ignoring stale subscribe ack"
            );
            return (AckOutcome::Stale, None);
        }

        sub.status = SubscriptionStatus::Subscribed;
        sub.active = true;
        sub.in_flight = false;
        sub.attempts = 0;
        sub.timer = None;
        info!(symbol = %symbol, generation = sub.generation, "Book subscription confirmed");
        (AckOutcome::Accepted(sub.generation), None)
    }

    /// Handle a failed subscribe response
    ///
    /// "Already subscribed" counts as an acknowledgment. Any other error is
    /// fatal for the symbol, which is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriptionRejected`] when the exchange refused the
    /// current subscription.
    pub fn on_subscribe_error(
        &mut self,
        req_id: Option<u64>,
        symbol: &str,
        reason: &str,
    ) -> Result<(AckOutcome, Option<WsRequest>), Error> {
        if reason.to_ascii_lowercase().contains("already subscribed") {
            return Ok(self.on_subscribe_ack(req_id, symbol));
        }

        let request = req_id
            .and_then(|id| self.requests.remove(&id))
            .filter(|req| req.symbol == symbol);
        let current = self.subs.get(symbol).is_some_and(|sub| {
            sub.desired
                && match (&request, req_id) {
                    (Some(req), _) => req.generation == sub.generation,
                    (None, id) => id.is_none(),
                }
        });
        if !current {
            debug!(symbol = %symbol, reason = %reason, "Ignoring stale subscribe error");
            return Ok((AckOutcome::Stale, None));
        }

        self.subs.remove(symbol);
        Err(Error::SubscriptionRejected {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Handle an unsubscribe response, successful or not
    ///
    /// Returns `true` if the symbol is now fully unsubscribed.
    pub fn on_unsubscribe_ack(&mut self, symbol: &str) -> bool {
        let Some(sub) = self.subs.get_mut(symbol) else {
            return false;
        };
        sub.draining = false;
        if sub.status == SubscriptionStatus::Unsubscribing {
            self.subs.remove(symbol);
            info!(symbol = %symbol, "Book unsubscribed");
            return true;
        }
        false
    }

    /// Generation that book data for `symbol` currently belongs to
    ///
    /// Data is trusted while the symbol is subscribed. Data for a subscribe
    /// that is still waiting for its ack confirms the subscription
    /// implicitly, unless an unsubscribe from a superseded generation is
    /// still draining. Anything else yields `None`.
    pub fn data_generation(&mut self, symbol: &str) -> Option<Generation> {
        let sub = self.subs.get_mut(symbol)?;
        match sub.status {
            SubscriptionStatus::Subscribed => Some(sub.generation),
            SubscriptionStatus::Subscribing if sub.in_flight && !sub.draining => {
                debug!(symbol = %symbol, "Book data before ack, treating as confirmed");
                sub.status = SubscriptionStatus::Subscribed;
                sub.active = true;
                sub.in_flight = false;
                sub.attempts = 0;
                sub.timer = None;
                Some(sub.generation)
            }
            _ => None,
        }
    }

    /// Start a full resubscribe cycle for one symbol
    ///
    /// Bumps the generation, unsubscribes if the exchange may be streaming
    /// the symbol and schedules a fresh subscribe after the resync delay.
    /// Returns `None` for the generation if the symbol is not subscribed or
    /// subscribing (a resync already in progress is left alone).
    pub fn begin_resync(
        &mut self,
        symbol: &str,
        now: Instant,
    ) -> (Option<WsRequest>, Option<Generation>) {
        if !matches!(
            self.status(symbol),
            SubscriptionStatus::Subscribed | SubscriptionStatus::Subscribing
        ) {
            return (None, None);
        }
        let generation = self.take_generation();
        let resync_delay = self.resync_delay;
        let connected = self.connected;
        let Some(sub) = self.subs.get_mut(symbol) else {
            return (None, None);
        };

        let live = sub.active || sub.in_flight;
        sub.generation = generation;
        sub.status = SubscriptionStatus::Resyncing;
        sub.active = false;
        sub.in_flight = false;
        sub.attempts = 0;
        sub.draining = live && connected;
        sub.timer = Some(Timer {
            at: now + resync_delay,
            kind: TimerKind::Retry,
        });
        let depth = sub.depth;

        info!(symbol = %symbol, generation, "Resyncing book");
        let request = (live && connected).then(|| self.unsubscribe_request(symbol, depth));
        (request, Some(generation))
    }

    /// Request an unsubscribe
    ///
    /// Cancels pending timers. Sends an unsubscribe if the exchange has
    /// confirmed the subscription. A symbol whose resync unsubscribe is
    /// still unacknowledged stays `Unsubscribing` until that ack arrives.
    /// Otherwise the symbol is dropped immediately.
    pub fn unsubscribe(&mut self, symbol: &str) -> Option<WsRequest> {
        if !self.subs.contains_key(symbol) {
            return None;
        }
        let generation = self.take_generation();
        let connected = self.connected;
        let sub = self.subs.get_mut(symbol)?;
        sub.desired = false;
        sub.timer = None;
        sub.in_flight = false;
        sub.generation = generation;

        if sub.active && connected {
            sub.active = false;
            sub.status = SubscriptionStatus::Unsubscribing;
            let depth = sub.depth;
            Some(self.unsubscribe_request(symbol, depth))
        } else if sub.draining && connected {
            // A resync's unsubscribe is still outstanding; old data keeps
            // flowing until it is acked.
            sub.status = SubscriptionStatus::Unsubscribing;
            None
        } else {
            self.subs.remove(symbol);
            info!(symbol = %symbol, "Book unsubscribed");
            None
        }
    }

    /// Handle a transport disconnect
    ///
    /// Every wanted symbol moves to `Resyncing` with a new generation and
    /// waits for the reconnect. Returns the affected symbols.
    pub fn on_disconnect(&mut self) -> Vec<String> {
        self.connected = false;
        self.requests.clear();
        self.subs.retain(|_, sub| sub.desired);

        let mut symbols: Vec<String> = self.subs.keys().cloned().collect();
        symbols.sort();
        for symbol in &symbols {
            let generation = self.take_generation();
            if let Some(sub) = self.subs.get_mut(symbol) {
                sub.generation = generation;
                sub.status = SubscriptionStatus::Resyncing;
                sub.active = false;
                sub.in_flight = false;
                sub.draining = false;
                sub.attempts = 0;
                sub.timer = None;
            }
        }
        symbols
    }

    /// Handle a transport (re)connect
    ///
    /// Issues a subscribe for every wanted symbol.
    pub fn on_connect(&mut self, now: Instant) -> Vec<WsRequest> {
        self.connected = true;
        let mut pending: Vec<String> = self
            .subs
            .iter()
            .filter(|(_, sub)| {
                sub.desired
                    && matches!(
                        sub.status,
                        SubscriptionStatus::Resyncing | SubscriptionStatus::Subscribing
                    )
            })
            .map(|(symbol, _)| symbol.clone())
            .collect();
        pending.sort();

        pending
            .iter()
            .filter_map(|symbol| self.send_subscribe(symbol, now))
            .collect()
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.subs
            .values()
            .filter_map(|s| s.timer.map(|t| t.at))
            .min()
    }

    /// Fire every timer due at `now`
    ///
    /// Returns the requests to send and the subscriptions that failed for
    /// good.
    pub fn poll_timers(&mut self, now: Instant) -> (Vec<WsRequest>, Vec<Error>) {
        let mut due: Vec<(String, TimerKind)> = self
            .subs
            .iter()
            .filter_map(|(symbol, sub)| match sub.timer {
                Some(timer) if timer.at <= now => Some((symbol.clone(), timer.kind)),
                _ => None,
            })
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));

        let mut requests = Vec::new();
        let mut failures = Vec::new();
        for (symbol, kind) in due {
            match kind {
                TimerKind::AckTimeout => {
                    let (request, failure) = self.on_ack_timeout(&symbol, now);
                    requests.extend(request);
                    failures.extend(failure);
                }
                TimerKind::Retry => {
                    if let Some(sub) = self.subs.get_mut(&symbol) {
                        sub.timer = None;
                    }
                    if self.connected {
                        requests.extend(self.send_subscribe(&symbol, now));
                    } else if let Some(sub) = self.subs.get_mut(&symbol) {
                        sub.status = SubscriptionStatus::Resyncing;
                    }
                }
            }
        }
        (requests, failures)
    }

    fn on_ack_timeout(&mut self, symbol: &str, now: Instant) -> (Option<WsRequest>, Option<Error>) {
        let connected = self.connected;
        let Some(sub) = self.subs.get_mut(symbol) else {
            return (None, None);
        };
        sub.attempts += 1;
        sub.timer = None;
        let attempts = sub.attempts;
        let depth = sub.depth;

        if self.retry.exhausted(attempts) {
            self.subs.remove(symbol);
            warn!(symbol = %symbol, attempts, "Giving up on book subscription");
            // The exchange may still honour one of the requests.
            let cleanup = connected.then(|| self.unsubscribe_request(symbol, depth));
            let err = Error::SubscriptionTimeout {
                symbol: symbol.to_string(),
                attempts,
            };
            return (cleanup, Some(err));
        }

        let delay = self.retry.delay_for_attempt(attempts - 1);
        if let Some(sub) = self.subs.get_mut(symbol) {
            sub.timer = Some(Timer {
                at: now + delay,
                kind: TimerKind::Retry,
            });
        }
        warn!(
            symbol = %symbol,
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            "Subscribe acknowledgment timed out"
        );
        (None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::messages::Method;

    fn config() -> Config {
        Config::new()
            .with_subscribe_timeout(Duration::from_secs(10))
            .with_resync_delay(Duration::from_secs(3))
            .with_subscribe_retry(
                BackoffConfig::default()
                    .max_attempts(3)
                    .initial_delay(Duration::from_secs(1)),
            )
    }

    fn connected(now: Instant) -> SubscriptionManager {
        let mut manager = SubscriptionManager::new(&config());
        assert!(manager.on_connect(now).is_empty());
        manager
    }

    fn subscribed(now: Instant) -> (SubscriptionManager, u64) {
        let mut manager = connected(now);
        let (req, _) = manager.subscribe("BTC/USD", 10, now);
        let req_id = req.unwrap().req_id;
        let (outcome, _) = manager.on_subscribe_ack(req_id, "BTC/USD");
        assert_eq!(outcome, AckOutcome::Accepted(1));
        (manager, req_id.unwrap())
    }

    #[test]
    fn test_subscribe_sends_request() {
        let now = Instant::now();
        let mut manager = connected(now);

        let (req, generation) = manager.subscribe("BTC/USD", 10, now);
        let req = req.unwrap();
        assert_eq!(req.method, Method::Subscribe);
        assert_eq!(req.symbol(), Some("BTC/USD"));
        assert_eq!(generation, Some(1));
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Subscribing);
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let now = Instant::now();
        let (mut manager, _) = subscribed(now);
        let (req, generation) = manager.subscribe("BTC/USD", 10, now);
        assert!(req.is_none());
        assert!(generation.is_none());
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Subscribed);
    }

    #[test]
    fn test_subscribe_deferred_while_disconnected() {
        let now = Instant::now();
        let mut manager = SubscriptionManager::new(&config());
        let (req, generation) = manager.subscribe("BTC/USD", 10, now);
        assert!(req.is_none());
        assert_eq!(generation, Some(1));

        let requests = manager.on_connect(now);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].symbol(), Some("BTC/USD"));
    }

    #[test]
    fn test_ack_confirms_subscription() {
        let now = Instant::now();
        let (manager, _) = subscribed(now);
        assert!(manager.is_active("BTC/USD"));
        assert_eq!(manager.next_deadline(), None);
    }

    #[test]
    fn test_timeout_retries_with_backoff_then_fails() {
        let now = Instant::now();
        let mut manager = connected(now);
        manager.subscribe("BTC/USD", 10, now);

        // First timeout: retry scheduled 1s later
        let t1 = now + Duration::from_secs(10);
        let (requests, failures) = manager.poll_timers(t1);
        assert!(requests.is_empty() && failures.is_empty());
        assert_eq!(manager.next_deadline(), Some(t1 + Duration::from_secs(1)));

        // Retry fires
        let t2 = t1 + Duration::from_secs(1);
        let (requests, _) = manager.poll_timers(t2);
        assert_eq!(requests.len(), 1);

        // Second timeout: backoff doubles
        let t3 = t2 + Duration::from_secs(10);
        manager.poll_timers(t3);
        assert_eq!(manager.next_deadline(), Some(t3 + Duration::from_secs(2)));

        let t4 = t3 + Duration::from_secs(2);
        assert_eq!(manager.poll_timers(t4).0.len(), 1);

        // Third timeout exhausts the budget
        let (_, failures) = manager.poll_timers(t4 + Duration::from_secs(10));
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            Error::SubscriptionTimeout { attempts: 3, .. }
        ));
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Unsubscribed);
    }

    #[test]
    fn test_timers_do_not_fire_early() {
        let now = Instant::now();
        let mut manager = connected(now);
        manager.subscribe("BTC/USD", 10, now);
        let (requests, failures) = manager.poll_timers(now + Duration::from_secs(9));
        assert!(requests.is_empty() && failures.is_empty());
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Subscribing);
    }

    #[test]
    fn test_late_ack_during_backoff_is_accepted() {
        let now = Instant::now();
        let mut manager = connected(now);
        let (req, _) = manager.subscribe("BTC/USD", 10, now);
        manager.poll_timers(now + Duration::from_secs(10));

        let (outcome, _) = manager.on_subscribe_ack(req.unwrap().req_id, "BTC/USD");
        assert_eq!(outcome, AckOutcome::Accepted(1));
        assert_eq!(manager.next_deadline(), None);
    }

    #[test]
    fn test_resync_cycle() {
        let now = Instant::now();
        let (mut manager, first_req) = subscribed(now);

        let (req, generation) = manager.begin_resync("BTC/USD", now);
        assert_eq!(req.unwrap().method, Method::Unsubscribe);
        assert_eq!(generation, Some(2));
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Resyncing);
        assert!(manager.data_generation("BTC/USD").is_none());

        // A second mismatch while resyncing does nothing
        assert_eq!(manager.begin_resync("BTC/USD", now), (None, None));

        let (requests, _) = manager.poll_timers(now + Duration::from_secs(3));
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::Subscribe);

        // Old-generation data still in flight before the unsubscribe ack
        assert!(manager.data_generation("BTC/USD").is_none());
        assert!(!manager.on_unsubscribe_ack("BTC/USD"));

        // An old ack is stale
        let (outcome, _) = manager.on_subscribe_ack(Some(first_req), "BTC/USD");
        assert_eq!(outcome, AckOutcome::Stale);

        let (outcome, _) = manager.on_subscribe_ack(requests[0].req_id, "BTC/USD");
        assert_eq!(outcome, AckOutcome::Accepted(2));
        assert_eq!(manager.data_generation("BTC/USD"), Some(2));
    }

    #[test]
    fn test_data_before_ack_confirms() {
        let now = Instant::now();
        let mut manager = connected(now);
        manager.subscribe("BTC/USD", 10, now);
        assert_eq!(manager.data_generation("BTC/USD"), Some(1));
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Subscribed);
        assert_eq!(manager.next_deadline(), None);
    }

    #[test]
    fn test_unsubscribe_active() {
        let now = Instant::now();
        let (mut manager, _) = subscribed(now);

        let req = manager.unsubscribe("BTC/USD").unwrap();
        assert_eq!(req.method, Method::Unsubscribe);
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Unsubscribing);
        assert!(manager.data_generation("BTC/USD").is_none());

        assert!(manager.on_unsubscribe_ack("BTC/USD"));
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Unsubscribed);
    }

    #[test]
    fn test_unsubscribe_mid_resync_cancels_timer() {
        let now = Instant::now();
        let (mut manager, _) = subscribed(now);
        manager.begin_resync("BTC/USD", now);

        assert!(manager.unsubscribe("BTC/USD").is_none());
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Unsubscribing);
        assert_eq!(manager.next_deadline(), None);
        let (requests, failures) = manager.poll_timers(now + Duration::from_secs(60));
        assert!(requests.is_empty() && failures.is_empty());

        assert!(manager.on_unsubscribe_ack("BTC/USD"));
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Unsubscribed);
    }

    #[test]
    fn test_resubscribe_during_resync_drain_ignores_old_data() {
        let now = Instant::now();
        let (mut manager, _) = subscribed(now);
        let (unsub, _) = manager.begin_resync("BTC/USD", now);
        assert_eq!(unsub.unwrap().method, Method::Unsubscribe);

        manager.unsubscribe("BTC/USD");
        let (req, generation) = manager.subscribe("BTC/USD", 10, now);
        assert!(req.is_some());
        assert!(generation.is_some());

        // Updates of the resynced subscription are still arriving
        assert!(manager.data_generation("BTC/USD").is_none());
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Subscribing);

        assert!(!manager.on_unsubscribe_ack("BTC/USD"));
        assert_eq!(manager.data_generation("BTC/USD"), generation);
    }

    #[test]
    fn test_ack_after_unsubscribe_is_cancelled() {
        let now = Instant::now();
        let mut manager = connected(now);
        let (req, _) = manager.subscribe("BTC/USD", 10, now);
        manager.unsubscribe("BTC/USD");

        let (outcome, cleanup) = manager.on_subscribe_ack(req.unwrap().req_id, "BTC/USD");
        assert_eq!(outcome, AckOutcome::Stale);
        assert_eq!(cleanup.unwrap().method, Method::Unsubscribe);
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let now = Instant::now();
        let (mut manager, _) = subscribed(now);
        manager.subscribe("ETH/USD", 10, now);

        let affected = manager.on_disconnect();
        assert_eq!(affected, vec!["BTC/USD".to_string(), "ETH/USD".to_string()]);
        assert_eq!(manager.status("BTC/USD"), SubscriptionStatus::Resyncing);
        assert_eq!(manager.generation("BTC/USD"), Some(3));
        assert_eq!(manager.generation("ETH/USD"), Some(4));
        assert!(!manager.is_active("BTC/USD"));
        assert_eq!(manager.next_deadline(), None);

        let requests = manager.on_connect(now);
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.method == Method::Subscribe));
    }

    #[test]
    fn test_already_subscribed_counts_as_ack() {
        let now = Instant::now();
        let mut manager = connected(now);
        let (req, _) = manager.subscribe("BTC/USD", 10, now);
        let (outcome, cleanup) = manager
            .on_subscribe_error(req.unwrap().req_id, "BTC/USD", "Already subscribed")
            .unwrap();
        assert_eq!(outcome, AckOutcome::Accepted(1));
        assert!(cleanup.is_none());
    }

    #[test]
    fn test_rejection_is_fatal() {
        let now = Instant::now();
        let mut manager = connected(now);
        let (req, _) = manager.subscribe("BTC/XYZ", 10, now);
        let err = manager
            .on_subscribe_error(req.unwrap().req_id, "BTC/XYZ", "Currency pair not supported")
            .unwrap_err();
        assert!(matches!(err, Error::SubscriptionRejected { .. }));
        assert_eq!(manager.status("BTC/XYZ"), SubscriptionStatus::Unsubscribed);
    }

    #[test]
    fn test_resubscribe_after_unsubscribe_bumps_generation() {
        let now = Instant::now();
        let (mut manager, _) = subscribed(now);
        manager.unsubscribe("BTC/USD");
        let (req, generation) = manager.subscribe("BTC/USD", 10, now);
        assert!(req.is_some());
        assert_eq!(generation, Some(3));
        // Data from the old subscription keeps flowing until its unsubscribe ack
        assert!(manager.data_generation("BTC/USD").is_none());
        manager.on_unsubscribe_ack("BTC/USD");
        assert_eq!(manager.data_generation("BTC/USD"), Some(3));
    }
}
