//! Clients for communicating with Kraken.
//!
//! This module contains:
//!
//! - [`orderbook`] - the self-healing order-book client
//! - [`websocket`] - WebSocket connection and reconnecting transport
//! - [`rest`] - HTTP client for the public precision lookup

pub mod orderbook;
pub mod rest;
pub mod websocket;

pub use orderbook::OrderbookClient;
pub use rest::RestClient;
pub use websocket::{spawn_connector, Transport, TransportEvent, WebSocketClient};
