//! HTTP REST client for Kraken's public API.
//!
//! The order-book client needs exactly one piece of REST data: the number
//! of decimals a pair uses for prices and volumes, without which the book
//! checksum cannot be reproduced. [`RestClient`] fetches it from the public
//! `AssetPairs` endpoint; no credentials are involved.
//!
//! # Example
//!
//! ```rust,no_run
//! use kraken_orderbook::client::RestClient;
//! use kraken_orderbook::Config;
//!
//! # async fn example() -> kraken_orderbook::Result<()> {
//! let rest = RestClient::new(&Config::new())?;
//! let precision = rest.asset_pair_precision("BTC/USD").await?;
//! println!("{} price decimals", precision.price_decimals);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::Config;
use crate::error::{ApiError, Error};
use crate::types::market::{AssetPair, Envelope};
use crate::types::Precision;

/// HTTP client for the Kraken public REST API
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
}

impl RestClient {
    /// Create a new REST client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.rest_url().trim_end_matches('/').to_string(),
        })
    }

    /// Make a GET request to the API
    ///
    /// # Arguments
    ///
    /// * `path` - API path (without base URL), e.g. `/public/AssetPairs`
    /// * `query` - Query string parameters
    ///
    /// # Returns
    ///
    /// The `result` member of the response envelope
    pub async fn get<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await?;

        self.handle_response(response).await
    }

    /// Handle the HTTP response, checking for errors
    async fn handle_response<T>(&self, response: reqwest::Response) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let status = response.status();

        // Check for rate limiting
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000);

            return Err(Error::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        let body = response.text().await?;
        parse_envelope(status.as_u16(), &body)
    }

    /// Fetch `AssetPairs` entries for `pair`
    pub async fn asset_pairs(&self, pair: &str) -> Result<HashMap<String, AssetPair>, Error> {
        self.get("/public/AssetPairs", &[("pair", pair)]).await
    }

    /// Look up the price and volume decimals of a symbol
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSymbol`] if the exchange does not list the
    /// symbol, or the underlying HTTP/API error.
    pub async fn asset_pair_precision(&self, symbol: &str) -> Result<Precision, Error> {
        let pairs = match self.asset_pairs(symbol).await {
            Ok(pairs) => pairs,
            Err(Error::Api(err)) if err.message.contains("Unknown asset pair") => {
                return Err(Error::UnknownSymbol(symbol.to_string()));
            }
            Err(err) => return Err(err),
        };

        let precision = select_pair(&pairs, symbol)
            .map(AssetPair::precision)
            .ok_or_else(|| Error::UnknownSymbol(symbol.to_string()))?;
        debug!(
            symbol = %symbol,
            price_decimals = precision.price_decimals,
            qty_decimals = precision.qty_decimals,
            "Resolved pair precision"
        );
        Ok(precision)
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Decode a response body and unwrap the envelope
fn parse_envelope<T>(status: u16, body: &str) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    let envelope: Envelope<T> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(_) if !(200..300).contains(&status) => {
            return Err(Error::Api(ApiError::new(status, body)));
        }
        Err(err) => return Err(err.into()),
    };

    if !envelope.error.is_empty() {
        let message = envelope.error.join(", ");
        if message.contains("EAPI:Rate limit") {
            return Err(Error::RateLimited {
                retry_after_ms: None,
            });
        }
        return Err(Error::Api(ApiError::new(status, message)));
    }

    envelope
        .result
        .ok_or_else(|| Error::Api(ApiError::new(status, "response has no result")))
}

/// Pick the entry describing `symbol`
///
/// The exchange keys the result by the requested name when it recognises
/// it, and by its internal pair code otherwise.
fn select_pair<'a>(pairs: &'a HashMap<String, AssetPair>, symbol: &str) -> Option<&'a AssetPair> {
    pairs
        .get(symbol)
        .or_else(|| pairs.values().find(|pair| pair.matches(symbol)))
        .or_else(|| {
            if pairs.len() == 1 {
                pairs.values().next()
            } else {
                None
            }
        })
}
