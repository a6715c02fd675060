//! Domain and wire types.
//!
//! - [`messages`] - WebSocket v2 requests and responses
//! - [`market`] - REST market metadata
//! - this module - prices, levels, sides and per-symbol precision

pub mod market;
pub mod messages;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use messages::{WsMessage, WsRequest};

/// Price of a level
///
/// Exact decimals instead of floating point: the checksum is computed
/// over the textual rendering, so every digit matters.
pub type Price = Decimal;

/// Aggregate quantity resting at a level
pub type Quantity = Decimal;

/// Monotonic counter that tells a subscription attempt from the ones it
/// superseded
pub type Generation = u64;

/// Side of the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy side, best = highest price
    Bid,
    /// Sell side, best = lowest price
    Ask,
}

/// One price level as handed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Level {
    /// Level price
    pub price: Price,
    /// Aggregate quantity
    pub qty: Quantity,
    /// Exchange timestamp of the last update touching this level
    ///
    /// `None` for levels that came from a snapshot.
    pub timestamp: Option<String>,
}

impl Level {
    /// Create a level without timestamp
    pub fn new(price: Price, qty: Quantity) -> Self {
        Self {
            price,
            qty,
            timestamp: None,
        }
    }
}

/// Number of fractional digits the exchange uses for a symbol
///
/// Kraken publishes these as `pair_decimals` and `lot_decimals` on the
/// `AssetPairs` endpoint. The checksum renders every price and quantity
/// with exactly this many digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Precision {
    /// Fractional digits of prices
    pub price_decimals: u32,
    /// Fractional digits of quantities
    pub qty_decimals: u32,
}

impl Precision {
    /// Create a precision
    pub const fn new(price_decimals: u32, qty_decimals: u32) -> Self {
        Self {
            price_decimals,
            qty_decimals,
        }
    }

    /// Round and rescale a price to exactly `price_decimals` digits
    pub fn price(&self, price: Price) -> Price {
        fixed_scale(price, self.price_decimals)
    }

    /// Round and rescale a quantity to exactly `qty_decimals` digits
    pub fn qty(&self, qty: Quantity) -> Quantity {
        fixed_scale(qty, self.qty_decimals)
    }
}

fn fixed_scale(value: Decimal, decimals: u32) -> Decimal {
    let mut value = value.round_dp(decimals);
    value.rescale(decimals);
    value
}
