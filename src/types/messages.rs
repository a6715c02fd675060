//! WebSocket v2 message types.
//!
//! This module contains the requests sent to Kraken and the messages
//! received on the public WebSocket API. Only the `book` channel is
//! modelled in full; other channels deserialize into
//! [`ChannelMessage::Other`].

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Price, Quantity};

/// Name of the order-book channel
pub const BOOK_CHANNEL: &str = "book";

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Subscribe to a channel
    Subscribe,
    /// Unsubscribe from a channel
    Unsubscribe,
    /// Application-level ping
    Ping,
}

/// Request sent to the server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsRequest {
    /// Request method
    pub method: Method,
    /// Channel parameters (absent for ping)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<BookParams>,
    /// Client request ID, echoed back in the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<u64>,
}

/// Parameters of a `book` subscribe/unsubscribe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookParams {
    /// Always `"book"`
    pub channel: String,
    /// Symbols, e.g. `["BTC/USD"]`
    pub symbol: Vec<String>,
    /// Book depth
    pub depth: u32,
    /// Request an initial snapshot (subscribe only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<bool>,
}

impl WsRequest {
    /// Subscribe to the book of `symbol` with a snapshot
    pub fn subscribe_book(symbol: impl Into<String>, depth: u32, req_id: u64) -> Self {
        Self {
            method: Method::Subscribe,
            params: Some(BookParams {
                channel: BOOK_CHANNEL.to_string(),
                symbol: vec![symbol.into()],
                depth,
                snapshot: Some(true),
            }),
            req_id: Some(req_id),
        }
    }

    /// Unsubscribe from the book of `symbol`
    pub fn unsubscribe_book(symbol: impl Into<String>, depth: u32, req_id: u64) -> Self {
        Self {
            method: Method::Unsubscribe,
            params: Some(BookParams {
                channel: BOOK_CHANNEL.to_string(),
                symbol: vec![symbol.into()],
                depth,
                snapshot: None,
            }),
            req_id: Some(req_id),
        }
    }

    /// Keep-alive ping
    pub fn ping() -> Self {
        Self {
            method: Method::Ping,
            params: None,
            req_id: None,
        }
    }

    /// First symbol of the request, if any
    pub fn symbol(&self) -> Option<&str> {
        self.params
            .as_ref()
            .and_then(|p| p.symbol.first())
            .map(String::as_str)
    }
}

/// Message received from the server
///
/// Kraken v2 uses two shapes: responses to requests carry a `method`
/// field, feed messages carry a `channel` field.
#[derive(Debug, Clone)]
pub enum WsMessage {
    /// Response to a subscribe/unsubscribe/ping request
    Method(MethodResponse),
    /// Feed message
    Channel(ChannelMessage),
}

impl WsMessage {
    /// Classify a decoded JSON object
    ///
    /// # Errors
    ///
    /// Fails if the object has neither a `method` nor a `channel` field, or
    /// if its payload does not match the channel.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if value.get("method").is_some() {
            return serde_json::from_value(value).map(WsMessage::Method);
        }
        if value.get("channel").is_some() {
            return ChannelMessage::from_value(value).map(WsMessage::Channel);
        }
        Err(de::Error::custom("message has neither `method` nor `channel`"))
    }
}

// Dispatch is done by hand on a `Value`: serde's tagged and untagged enums
// buffer their content, which turns arbitrary-precision numbers into maps.
impl<'de> Deserialize<'de> for WsMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        WsMessage::from_value(value).map_err(de::Error::custom)
    }
}

/// Response to a request
#[derive(Debug, Clone, Deserialize)]
pub struct MethodResponse {
    /// `subscribe`, `unsubscribe`, `pong`, ...
    pub method: String,
    /// Whether the request succeeded
    #[serde(default)]
    pub success: Option<bool>,
    /// Details of a successful subscription change
    #[serde(default)]
    pub result: Option<MethodResult>,
    /// Error text of a failed request
    #[serde(default)]
    pub error: Option<String>,
    /// Echoed request ID
    #[serde(default)]
    pub req_id: Option<u64>,
    /// Symbol of a failed request
    #[serde(default)]
    pub symbol: Option<String>,
}

impl MethodResponse {
    /// Symbol this response refers to
    pub fn symbol(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.symbol.as_deref())
            .or(self.symbol.as_deref())
    }

    /// Whether this response concerns the `book` channel
    ///
    /// Error responses omit the channel, so they are treated as possibly
    /// relevant.
    pub fn is_book(&self) -> bool {
        match self.result.as_ref().and_then(|r| r.channel.as_deref()) {
            Some(channel) => channel == BOOK_CHANNEL,
            None => true,
        }
    }

    /// Whether the request succeeded
    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(false)
    }
}

/// Result payload of a subscribe/unsubscribe response
#[derive(Debug, Clone, Deserialize)]
pub struct MethodResult {
    /// Channel name
    #[serde(default)]
    pub channel: Option<String>,
    /// Symbol
    #[serde(default)]
    pub symbol: Option<String>,
    /// Book depth
    #[serde(default)]
    pub depth: Option<u32>,
    /// Whether a snapshot was requested
    #[serde(default)]
    pub snapshot: Option<bool>,
}

/// Feed message, tagged by channel
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    /// Order-book snapshot or update
    Book(BookMessage),
    /// Sent once per second when no other traffic flows
    Heartbeat,
    /// Connection/system status
    Status {
        /// Status entries
        data: Vec<StatusData>,
    },
    /// Any channel this crate does not consume
    Other,
}

impl ChannelMessage {
    fn from_value(mut value: Value) -> Result<Self, serde_json::Error> {
        let channel = value
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match channel.as_str() {
            BOOK_CHANNEL => serde_json::from_value(value).map(ChannelMessage::Book),
            "heartbeat" => Ok(ChannelMessage::Heartbeat),
            "status" => {
                let data = match value.get_mut("data") {
                    Some(data) => serde_json::from_value(data.take())?,
                    None => Vec::new(),
                };
                Ok(ChannelMessage::Status { data })
            }
            _ => Ok(ChannelMessage::Other),
        }
    }
}

/// Kind of book message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookKind {
    /// Full book state
    Snapshot,
    /// Incremental change
    Update,
}

/// Book channel message
#[derive(Debug, Clone, Deserialize)]
pub struct BookMessage {
    /// Snapshot or update
    #[serde(rename = "type")]
    pub kind: BookKind,
    /// One entry per symbol
    pub data: Vec<BookData>,
}

/// Book payload for a single symbol
#[derive(Debug, Clone, Deserialize)]
pub struct BookData {
    /// Symbol, e.g. `BTC/USD`
    pub symbol: String,
    /// Bid levels
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    /// Ask levels
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
    /// CRC32 of the top of the book after applying this message
    pub checksum: u32,
    /// Exchange timestamp (updates only)
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Price level as sent by the exchange
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceLevel {
    /// Price
    pub price: Price,
    /// New aggregate quantity (zero removes the level)
    pub qty: Quantity,
}

/// Status entry
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    /// Exchange system state, e.g. `online`
    #[serde(default)]
    pub system: Option<String>,
    /// API version
    #[serde(default)]
    pub api_version: Option<String>,
    /// Connection identifier
    #[serde(default)]
    pub connection_id: Option<u64>,
    /// Server version
    #[serde(default)]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_subscribe_request_serialization() {
        let req = WsRequest::subscribe_book("BTC/USD", 10, 7);
        let json = serde_json::to_value(&req).unwrap();

        assert_eq!(json["method"], "subscribe");
        assert_eq!(json["params"]["channel"], "book");
        assert_eq!(json["params"]["symbol"][0], "BTC/USD");
        assert_eq!(json["params"]["depth"], 10);
        assert_eq!(json["params"]["snapshot"], true);
        assert_eq!(json["req_id"], 7);
    }

    #[test]
    fn test_unsubscribe_omits_snapshot() {
        let req = WsRequest::unsubscribe_book("BTC/USD", 10, 8);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"unsubscribe\""));
        assert!(!json.contains("snapshot"));
        assert_eq!(req.symbol(), Some("BTC/USD"));
    }

    #[test]
    fn test_ping_serialization() {
        let json = serde_json::to_string(&WsRequest::ping()).unwrap();
        assert_eq!(json, r#"{"method":"ping"}"#);
    }

    #[test]
    fn test_book_update_deserialization() {
        let json = r#"{
            "channel": "book",
            "type": "update",
            "data": [{
                "symbol": "BTC/USD",
                "bids": [{"price": 45283.5, "qty": 0.0}],
                "asks": [{"price": 45285.2, "qty": 0.00100000}],
                "checksum": 2439117997,
                "timestamp": "2026-10-16T09:30:00.100000Z"
            }]
        }"#;

        let msg: WsMessage = serde_json::from_str(json).unwrap();
        match msg {
            WsMessage::Channel(ChannelMessage::Book(book)) => {
                assert_eq!(book.kind, BookKind::Update);
                let data = &book.data[0];
                assert_eq!(data.symbol, "BTC/USD");
                assert_eq!(data.bids[0].price, dec!(45283.5));
                assert!(data.bids[0].qty.is_zero());
                assert_eq!(data.asks[0].qty, dec!(0.001));
                assert_eq!(data.checksum, 2439117997);
                assert!(data.timestamp.is_some());
            }
            other => panic!("Expected book update, got {:?}", other),
        }
    }

    #[test]
    fn test_levels_keep_every_digit() {
        let json = r#"{"channel":"book","type":"update","data":[{"symbol":"BTC/USD","bids":[{"price":0.0000123,"qty":1234567890.12345678}],"asks":[{"price":45285.2,"qty":0.00000001}],"checksum":4294967295}]}"#;

        let msg: WsMessage = serde_json::from_str(json).unwrap();
        let WsMessage::Channel(ChannelMessage::Book(book)) = msg else {
            panic!("Expected book message");
        };
        let data = &book.data[0];
        assert_eq!(data.bids[0].qty.to_string(), "1234567890.12345678");
        assert_eq!(data.bids[0].price, dec!(0.0000123));
        assert_eq!(data.asks[0].qty, dec!(0.00000001));
        assert_eq!(data.checksum, u32::MAX);
    }

    #[test]
    fn test_message_without_method_or_channel_rejected() {
        assert!(serde_json::from_str::<WsMessage>(r#"{"foo":1}"#).is_err());
        assert!(serde_json::from_str::<WsMessage>(r#"{"channel":"book","type":"snapshot"}"#).is_err());
    }

    #[test]
    fn test_subscribe_ack_deserialization() {
        let json = r#"{
            "method": "subscribe",
            "result": {"channel": "book", "depth": 10, "snapshot": true, "symbol": "BTC/USD"},
            "success": true,
            "time_in": "2026-10-16T09:29:59.000000Z",
            "time_out": "2026-10-16T09:29:59.000100Z",
            "req_id": 3
        }"#;

        let msg: WsMessage = serde_json::from_str(json).unwrap();
        match msg {
            WsMessage::Method(resp) => {
                assert_eq!(resp.method, "subscribe");
                assert!(resp.is_success());
                assert!(resp.is_book());
                assert_eq!(resp.symbol(), Some("BTC/USD"));
                assert_eq!(resp.req_id, Some(3));
            }
            other => panic!("Expected method response, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_error_deserialization() {
        let json = r#"{
            "error": "Currency pair not supported BTC/XYZ",
            "method": "subscribe",
            "req_id": 4,
            "success": false,
            "symbol": "BTC/XYZ"
        }"#;

        let msg: WsMessage = serde_json::from_str(json).unwrap();
        let WsMessage::Method(resp) = msg else {
            panic!("Expected method response");
        };
        assert!(!resp.is_success());
        assert_eq!(resp.symbol(), Some("BTC/XYZ"));
        assert!(resp.error.unwrap().contains("not supported"));
    }

    #[test]
    fn test_heartbeat_status_and_unknown_channels() {
        let heartbeat: WsMessage = serde_json::from_str(r#"{"channel":"heartbeat"}"#).unwrap();
        assert!(matches!(
            heartbeat,
            WsMessage::Channel(ChannelMessage::Heartbeat)
        ));

        let status: WsMessage = serde_json::from_str(
            r#"{"channel":"status","type":"update","data":[{"api_version":"v2","connection_id":1,"system":"online","version":"2.0.8"}]}"#,
        )
        .unwrap();
        match status {
            WsMessage::Channel(ChannelMessage::Status { data }) => {
                assert_eq!(data[0].system.as_deref(), Some("online"));
            }
            other => panic!("Expected status, got {:?}", other),
        }

        let ticker: WsMessage =
            serde_json::from_str(r#"{"channel":"ticker","type":"update","data":[]}"#).unwrap();
        assert!(matches!(ticker, WsMessage::Channel(ChannelMessage::Other)));
    }

    #[test]
    fn test_pong_deserialization() {
        let msg: WsMessage = serde_json::from_str(r#"{"method":"pong","time_in":"x","time_out":"y"}"#)
            .unwrap();
        assert!(matches!(msg, WsMessage::Method(ref r) if r.method == "pong"));
    }
}
