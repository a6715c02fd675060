//! Self-healing order-book client.
//!
//! [`OrderbookClient`] runs an [`OrderbookManager`] on a background task
//! fed by a [`Transport`]. Callers subscribe to symbols, register
//! callbacks, and read immutable [`BookSnapshot`]s at any time.
//!
//! # Example
//!
//! ```rust,no_run
//! use kraken_orderbook::{Config, OrderbookClient};
//!
//! # async fn example() -> kraken_orderbook::Result<()> {
//! let client = OrderbookClient::connect(Config::new())?;
//!
//! client.on_update(|book| {
//!     println!("{} best bid {:?}", book.symbol, book.best_bid());
//! });
//! client.on_error(|symbol, err| eprintln!("{symbol}: {err}"));
//!
//! client.subscribe(&["BTC/USD", "ETH/USD"], 10).await?;
//! tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//! if let Some(book) = client.get_snapshot("BTC/USD") {
//!     println!("spread {:?}", book.spread());
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::client::rest::RestClient;
use crate::client::websocket::{spawn_connector, Transport, TransportEvent};
use crate::config::{validate_depth, Config};
use crate::error::Error;
use crate::orderbook::{BookEvent, BookSnapshot, OrderbookManager, Output, ResyncReason};
use crate::types::Precision;

type UpdateHandler = Arc<dyn Fn(&BookSnapshot) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&str, &Error) + Send + Sync>;
type ResyncHandler = Arc<dyn Fn(&str, &ResyncReason) + Send + Sync>;

/// State shared between the client handle and its driver task
#[derive(Default)]
struct Shared {
    snapshots: RwLock<FxHashMap<String, Arc<BookSnapshot>>>,
    update_handlers: RwLock<Vec<UpdateHandler>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    resync_handlers: RwLock<Vec<ResyncHandler>>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // Handler lists are cloned out of the lock so a callback may register
    // further handlers.
    fn notify_update(&self, snapshot: &BookSnapshot) {
        let handlers = self.update_handlers.read().clone();
        for handler in handlers {
            if self.is_closed() {
                return;
            }
            handler(snapshot);
        }
    }

    fn notify_error(&self, symbol: &str, err: &Error) {
        let handlers = self.error_handlers.read().clone();
        for handler in handlers {
            if self.is_closed() {
                return;
            }
            handler(symbol, err);
        }
    }

    fn notify_resync(&self, symbol: &str, reason: &ResyncReason) {
        let handlers = self.resync_handlers.read().clone();
        for handler in handlers {
            if self.is_closed() {
                return;
            }
            handler(symbol, reason);
        }
    }
}

#[derive(Debug)]
enum Command {
    Subscribe {
        symbols: Vec<(String, Precision)>,
        depth: u32,
    },
    Unsubscribe {
        symbols: Vec<String>,
    },
    Close,
}

/// Realtime order-book client.
///
/// Maintains a checksum-verified book per subscribed symbol and recovers
/// from feed problems on its own:
///
/// - checksum mismatch: the affected symbol alone is resubscribed
/// - disconnect: every symbol is rebuilt after the reconnect
/// - missing subscribe acknowledgment: retried with backoff, then reported
///   through [`on_error`](Self::on_error)
///
/// # Thread Safety
///
/// The client is `Send + Sync`; share it behind an `Arc`. Callbacks run on
/// the client's background task, one at a time, and must not block.
pub struct OrderbookClient {
    config: Config,
    rest: RestClient,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
    precisions: Mutex<FxHashMap<String, Precision>>,
}

impl fmt::Debug for OrderbookClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderbookClient")
            .field("ws_url", &self.config.ws_url())
            .field("depth", &self.config.depth())
            .field("books", &self.shared.snapshots.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl OrderbookClient {
    /// Create a client connected to `config.ws_url()`
    ///
    /// The connection is established in the background; subscriptions made
    /// before it is up are sent as soon as it is. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration.
    pub fn connect(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let transport = spawn_connector(&config);
        Self::with_transport(config, transport)
    }

    /// Create a client on top of an existing transport
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration.
    pub fn with_transport(config: Config, transport: Transport) -> Result<Self, Error> {
        config.validate()?;
        let rest = RestClient::new(&config)?;
        let shared = Arc::new(Shared::default());
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            manager: OrderbookManager::new(&config),
            shared: Arc::clone(&shared),
            commands: command_rx,
            transport,
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            config,
            rest,
            shared,
            commands: command_tx,
            task: Mutex::new(Some(task)),
            precisions: Mutex::new(FxHashMap::default()),
        })
    }

    /// Subscribe to the books of `symbols`
    ///
    /// Idempotent and additive: symbols already subscribed are left alone.
    /// The decimal precision of each symbol comes from the configuration or,
    /// failing that, from the REST API.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unsupported depth,
    /// [`Error::UnknownSymbol`] (or the HTTP error) if a precision cannot be
    /// resolved, and [`Error::Closed`] after [`close`](Self::close). No
    /// symbol is subscribed if any of them fails.
    pub async fn subscribe(&self, symbols: &[&str], depth: u32) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        validate_depth(depth)?;

        let mut resolved = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let precision = self.resolve_precision(symbol).await?;
            resolved.push((symbol.to_string(), precision));
        }

        self.send(Command::Subscribe {
            symbols: resolved,
            depth,
        })
    }

    async fn resolve_precision(&self, symbol: &str) -> Result<Precision, Error> {
        if let Some(precision) = self.config.precision(symbol) {
            return Ok(precision);
        }
        if let Some(precision) = self.precisions.lock().get(symbol).copied() {
            return Ok(precision);
        }
        let precision = self.rest.asset_pair_precision(symbol).await?;
        self.precisions.lock().insert(symbol.to_string(), precision);
        Ok(precision)
    }

    /// Unsubscribe from the books of `symbols` and drop their snapshots
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub fn unsubscribe(&self, symbols: &[&str]) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        {
            let mut snapshots = self.shared.snapshots.write();
            for symbol in symbols {
                snapshots.remove(*symbol);
            }
        }
        self.send(Command::Unsubscribe {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::Closed)
    }

    /// Register a callback invoked after every verified book change
    pub fn on_update<F>(&self, handler: F)
    where
        F: Fn(&BookSnapshot) + Send + Sync + 'static,
    {
        self.shared.update_handlers.write().push(Arc::new(handler));
    }

    /// Register a callback for errors that end a symbol's subscription
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.shared.error_handlers.write().push(Arc::new(handler));
    }

    /// Register a callback invoked when a book is discarded for rebuilding
    pub fn on_resync<F>(&self, handler: F)
    where
        F: Fn(&str, &ResyncReason) + Send + Sync + 'static,
    {
        self.shared.resync_handlers.write().push(Arc::new(handler));
    }

    /// Latest verified state of a book
    ///
    /// `None` if the symbol is not subscribed or its book is being rebuilt.
    pub fn get_snapshot(&self, symbol: &str) -> Option<Arc<BookSnapshot>> {
        self.shared.snapshots.read().get(symbol).cloned()
    }

    /// Symbols with a verified book
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.shared.snapshots.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Default depth from the configuration
    pub fn depth(&self) -> u32 {
        self.config.depth()
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop the client
    ///
    /// Once this returns no callback runs any more and the connection is
    /// closed. Calling it again is a no-op.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Close);

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "Order-book task failed");
            }
            info!("Order-book client closed");
        }
    }
}

impl Drop for OrderbookClient {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Close);
    }
}

/// Background task owning the manager
struct Driver {
    manager: OrderbookManager,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    transport: Transport,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let deadline = self.manager.next_deadline();

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = self.transport.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        self.transport_closed();
                        break;
                    }
                },
                () = sleep_until_deadline(deadline) => {
                    let out = self.manager.poll_timers(Instant::now());
                    self.dispatch(out);
                }
            }
        }
        debug!("Order-book task stopped");
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Subscribe { symbols, depth } => {
                for (symbol, precision) in symbols {
                    let out = self.manager.subscribe(&symbol, depth, precision, now);
                    self.dispatch(out);
                }
            }
            Command::Unsubscribe { symbols } => {
                for symbol in symbols {
                    let out = self.manager.unsubscribe(&symbol);
                    self.shared.snapshots.write().remove(&symbol);
                    self.dispatch(out);
                }
            }
            Command::Close => {}
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        let now = Instant::now();
        let out = match event {
            TransportEvent::Connected => {
                info!("Transport connected");
                self.manager.handle_connected(now)
            }
            TransportEvent::Message(message) => self.manager.handle_message(&message, now),
            TransportEvent::Disconnected { reason } => {
                warn!(reason = %reason, "Transport disconnected, books will be rebuilt");
                self.manager.handle_disconnected()
            }
        };
        self.dispatch(out);
    }

    fn transport_closed(&mut self) {
        let symbols = self.manager.symbols();
        error!(books = symbols.len(), "Transport closed for good");
        self.shared.snapshots.write().clear();
        for symbol in symbols {
            if self.shared.is_closed() {
                return;
            }
            self.shared.notify_error(&symbol, &Error::ConnectionClosed);
        }
    }

    fn dispatch(&mut self, out: Output) {
        for request in out.requests {
            if self.transport.requests.send(request).is_err() {
                debug!("Transport gone, dropping request");
            }
        }

        for event in out.events {
            if self.shared.is_closed() {
                return;
            }
            match event {
                BookEvent::Update(snapshot) => {
                    self.shared
                        .snapshots
                        .write()
                        .insert(snapshot.symbol.clone(), Arc::clone(&snapshot));
                    self.shared.notify_update(&snapshot);
                }
                BookEvent::Resyncing { symbol, reason } => {
                    self.shared.snapshots.write().remove(&symbol);
                    self.shared.notify_resync(&symbol, &reason);
                }
                BookEvent::Failed { symbol, error } => {
                    self.shared.snapshots.write().remove(&symbol);
                    self.shared.notify_error(&symbol, &error);
                }
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
