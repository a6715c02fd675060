//! WebSocket transport for the Kraken v2 public feed.
//!
//! This module provides:
//!
//! - [`WebSocketClient`] - a single connection: send requests, receive
//!   decoded [`WsMessage`]s
//! - [`spawn_connector`] - a background task that keeps a connection up,
//!   reconnecting with jittered exponential backoff, and exposes it as a
//!   channel pair ([`Transport`])
//!
//! The order-book client only ever talks to a [`Transport`], so tests can
//! replace the network with in-memory channels.
//!
//! # Example
//!
//! ```rust,no_run
//! use kraken_orderbook::client::websocket::WebSocketClient;
//! use kraken_orderbook::types::WsRequest;
//!
//! # async fn example() -> kraken_orderbook::Result<()> {
//! let mut ws = WebSocketClient::connect("wss://ws.kraken.com/v2").await?;
//! ws.send(&WsRequest::subscribe_book("BTC/USD", 10, 1)).await?;
//!
//! while let Some(msg) = ws.next().await {
//!     println!("{:?}", msg?);
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{BackoffConfig, Config};
use crate::error::Error;
use crate::types::messages::{WsMessage, WsRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the event channel between connector and client
const EVENT_BUFFER: usize = 1024;

/// A single WebSocket connection
///
/// # Thread Safety
///
/// This client is NOT thread-safe. For concurrent access from multiple tasks,
/// use [`spawn_connector`].
#[derive(Debug)]
pub struct WebSocketClient {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl WebSocketClient {
    /// Connect to a WebSocket endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Send a request as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn send(&mut self, request: &WsRequest) -> Result<(), Error> {
        let json = serde_json::to_string(request)?;
        self.write.send(Message::Text(json)).await?;
        Ok(())
    }

    /// Receive the next message
    ///
    /// Control frames are consumed here; tungstenite answers pings on its
    /// own. A text frame that does not decode yields [`Error::Json`] and
    /// leaves the connection usable.
    ///
    /// # Returns
    ///
    /// The next message, or `None` if the stream ended.
    pub async fn next(&mut self) -> Option<Result<WsMessage, Error>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).map_err(Error::from));
                }
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "Server closed the connection");
                    return Some(Err(Error::ConnectionClosed));
                }
                Ok(_) => {
                    // Ignore other message types (Binary, Ping, Pong, Frame)
                    continue;
                }
                Err(e) => {
                    return Some(Err(e.into()));
                }
            }
        }
    }

    /// Close the WebSocket connection
    pub async fn close(&mut self) -> Result<(), Error> {
        self.write.close().await?;
        Ok(())
    }
}

/// Event delivered by a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection is up; requests sent from now on reach the server
    Connected,
    /// A decoded message
    Message(WsMessage),
    /// The connection dropped; a reconnect may follow
    Disconnected {
        /// Human readable cause
        reason: String,
    },
}

/// Channel pair connecting the order-book client to a connection
///
/// Dropping the `events` receiver or the `requests` sender stops the
/// connector behind it. If the connector gives up, `events` yields `None`.
#[derive(Debug)]
pub struct Transport {
    /// Incoming events
    pub events: mpsc::Receiver<TransportEvent>,
    /// Outgoing requests
    pub requests: mpsc::UnboundedSender<WsRequest>,
}

impl Transport {
    /// Create a transport from raw channels
    pub fn new(
        events: mpsc::Receiver<TransportEvent>,
        requests: mpsc::UnboundedSender<WsRequest>,
    ) -> Self {
        Self { events, requests }
    }
}

/// Spawn a background task that maintains a WebSocket connection to
/// `config.ws_url()`
///
/// The task reconnects according to `config.reconnect()`, sends a `ping`
/// every `config.ping_interval()` and discards requests queued while no
/// connection was up (the client re-issues what it needs after
/// [`TransportEvent::Connected`]).
///
/// Must be called from within a Tokio runtime.
pub fn spawn_connector(config: &Config) -> Transport {
    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (request_tx, request_rx) = mpsc::unbounded_channel();

    let connector = Connector {
        url: config.ws_url().to_string(),
        reconnect: config.reconnect().clone(),
        ping_interval: config.ping_interval(),
        events: event_tx,
        requests: request_rx,
    };
    tokio::spawn(connector.run());

    Transport::new(event_rx, request_tx)
}

enum SessionEnd {
    /// The client went away
    Shutdown,
    /// The connection failed
    Lost(Error),
}

/// Wrap a failed write as a transport error
fn send_failed(err: Error) -> Error {
    Error::Transport(format!("send failed: {err}"))
}

struct Connector {
    url: String,
    reconnect: BackoffConfig,
    ping_interval: Duration,
    events: mpsc::Sender<TransportEvent>,
    requests: mpsc::UnboundedReceiver<WsRequest>,
}

impl Connector {
    async fn run(mut self) {
        let mut failures = 0u32;

        loop {
            match WebSocketClient::connect(&self.url).await {
                Ok(mut client) => {
                    info!(url = %self.url, "WebSocket connected");
                    failures = 0;

                    // Requests queued while disconnected were meant for the
                    // previous connection.
                    let mut dropped = 0usize;
                    while self.requests.try_recv().is_ok() {
                        dropped += 1;
                    }
                    if dropped > 0 {
                        debug!(dropped, "Discarded requests queued while disconnected");
                    }

                    if self.events.send(TransportEvent::Connected).await.is_err() {
                        let _ = client.close().await;
                        return;
                    }

                    let reason = match self.session(&mut client).await {
                        SessionEnd::Shutdown => {
                            let _ = client.close().await;
                            debug!("Connector shut down");
                            return;
                        }
                        SessionEnd::Lost(err) => err,
                    };

                    warn!(error = %reason, "WebSocket disconnected");
                    let reason = reason.to_string();
                    if self
                        .events
                        .send(TransportEvent::Disconnected { reason })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    warn!(url = %self.url, error = %err, attempt = failures + 1, "WebSocket connect failed");
                }
            }

            failures += 1;
            if self.reconnect.exhausted(failures) {
                error!(attempts = failures, "Giving up reconnecting");
                return;
            }

            let delay = self.reconnect.jittered_delay(failures - 1);
            info!(delay_ms = delay.as_millis() as u64, attempt = failures, "Reconnecting");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.events.closed() => return,
            }
        }
    }

    async fn session(&mut self, client: &mut WebSocketClient) -> SessionEnd {
        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        return SessionEnd::Shutdown;
                    };
                    if let Err(err) = client.send(&request).await {
                        return SessionEnd::Lost(send_failed(err));
                    }
                }
                message = client.next() => match message {
                    Some(Ok(message)) => {
                        if self.events.send(TransportEvent::Message(message)).await.is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Some(Err(Error::Json(err))) => {
                        warn!(error = %err, "Skipping undecodable message");
                    }
                    Some(Err(err)) => return SessionEnd::Lost(err),
                    None => {
                        return SessionEnd::Lost(Error::Transport("stream ended".to_string()))
                    }
                },
                _ = ping.tick() => {
                    if let Err(err) = client.send(&WsRequest::ping()).await {
                        return SessionEnd::Lost(send_failed(err));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_from_channels() {
        let (event_tx, event_rx) = mpsc::channel(4);
        let (request_tx, mut request_rx) = mpsc::unbounded_channel();
        let mut transport = Transport::new(event_rx, request_tx);

        event_tx.send(TransportEvent::Connected).await.unwrap();
        assert!(matches!(
            transport.events.recv().await,
            Some(TransportEvent::Connected)
        ));

        transport.requests.send(WsRequest::ping()).unwrap();
        assert_eq!(request_rx.recv().await, Some(WsRequest::ping()));
    }

    #[test]
    fn test_send_failure_is_transport_error() {
        let err = send_failed(Error::ConnectionClosed);
        assert!(matches!(
            &err,
            Error::Transport(msg) if msg == "send failed: WebSocket connection closed"
        ));
        assert_eq!(err.fatal_symbol(), None);
    }

    #[tokio::test]
    async fn test_connector_reports_lost_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);
        });

        let config = Config::new()
            .with_ws_url(format!("ws://{addr}"))
            .with_reconnect(BackoffConfig::default().max_attempts(1));
        let mut transport = spawn_connector(&config);

        assert!(matches!(
            transport.events.recv().await,
            Some(TransportEvent::Connected)
        ));
        match transport.events.recv().await {
            Some(TransportEvent::Disconnected { reason }) => assert!(!reason.is_empty()),
            other => panic!("expected a disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connector_gives_up_after_max_attempts() {
        // Nothing listens on port 9 of the loopback interface
        let config = Config::new().with_ws_url("ws://127.0.0.1:9").with_reconnect(
            BackoffConfig::default()
                .max_attempts(2)
                .initial_delay(Duration::from_millis(10)),
        );
        let mut transport = spawn_connector(&config);
        assert!(transport.events.recv().await.is_none());
    }
}
