//! REST market metadata types.

use serde::Deserialize;

use super::Precision;

/// Kraken REST response envelope
///
/// Every public endpoint answers `{"error": [...], "result": {...}}`; a
/// non-empty `error` array means the call failed even with HTTP 200.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    /// Error strings such as `EQuery:Unknown asset pair`
    #[serde(default)]
    pub error: Vec<String>,
    /// Payload, absent on failure
    #[serde(default = "Option::default")]
    pub result: Option<T>,
}

/// Entry of the `AssetPairs` endpoint
///
/// Only the fields needed to maintain a book are modelled.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AssetPair {
    /// Alternate pair name, e.g. `XBTUSD`
    #[serde(default)]
    pub altname: Option<String>,
    /// WebSocket v1 pair name, e.g. `XBT/USD`
    #[serde(default)]
    pub wsname: Option<String>,
    /// Fractional digits of prices
    pub pair_decimals: u32,
    /// Fractional digits of volumes
    pub lot_decimals: u32,
    /// Trading status, e.g. `online`
    #[serde(default)]
    pub status: Option<String>,
}

impl AssetPair {
    /// Precision used to render this pair's book checksum
    pub fn precision(&self) -> Precision {
        Precision::new(self.pair_decimals, self.lot_decimals)
    }

    /// Whether `name` refers to this pair
    pub fn matches(&self, name: &str) -> bool {
        self.wsname.as_deref() == Some(name) || self.altname.as_deref() == Some(name)
    }
}
