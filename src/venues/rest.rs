/// Public REST order book clients
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{Level, OrderBook, VenueClient};
use crate::error::{CollectorError, Result};
use crate::types::DataClass;

// Browser-like UA keeps some CDNs from rejecting bare clients
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0 Safari/537.36";

const COINBASE_URL: &str = "https://api.exchange.coinbase.com";
const KRAKEN_URL: &str = "https://api.kraken.com";
const BYBIT_URL: &str = "https://api.bybit.com";
const OKX_URL: &str = "https://www.okx.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestVenueKind {
    Coinbase,
    Kraken,
    Bybit,
    Okx,
}

impl RestVenueKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "coinbase" => Some(RestVenueKind::Coinbase),
            "kraken" => Some(RestVenueKind::Kraken),
            "bybit" => Some(RestVenueKind::Bybit),
            "okx" => Some(RestVenueKind::Okx),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RestVenueKind::Coinbase => "coinbase",
            RestVenueKind::Kraken => "kraken",
            RestVenueKind::Bybit => "bybit",
            RestVenueKind::Okx => "okx",
        }
    }

    fn supports(&self, data_class: DataClass) -> bool {
        match self {
            RestVenueKind::Coinbase | RestVenueKind::Kraken => data_class == DataClass::Spot,
            RestVenueKind::Bybit | RestVenueKind::Okx => true,
        }
    }

    /// Largest depth the endpoint accepts in one request
    fn max_depth(&self, data_class: DataClass) -> usize {
        match (self, data_class) {
            (RestVenueKind::Coinbase, _) => usize::MAX,
            (RestVenueKind::Kraken, _) => 500,
            (RestVenueKind::Bybit, DataClass::Spot) => 200,
            (RestVenueKind::Bybit, DataClass::Futures) => 500,
            (RestVenueKind::Okx, _) => 400,
        }
    }

    fn timeout(&self) -> Duration {
        match self {
            RestVenueKind::Coinbase => Duration::from_secs(20),
            RestVenueKind::Kraken | RestVenueKind::Okx => Duration::from_secs(25),
            RestVenueKind::Bybit => Duration::from_secs(30),
        }
    }
}

/// Venue-native market symbol for a base asset
pub fn venue_symbol(kind: RestVenueKind, data_class: DataClass, base: &str, quote: &str) -> String {
    let base = base.to_uppercase();
    let quote = quote.to_uppercase();
    match (kind, data_class) {
        (RestVenueKind::Coinbase, _) => format!("{}-{}", base, quote),
        (RestVenueKind::Kraken, _) => {
            let base = if base == "BTC" { "XBT".to_string() } else { base };
            format!("{}{}", base, quote)
        }
        (RestVenueKind::Bybit, _) => format!("{}{}", base, quote),
        (RestVenueKind::Okx, DataClass::Spot) => format!("{}-{}", base, quote),
        (RestVenueKind::Okx, DataClass::Futures) => format!("{}-{}-SWAP", base, quote),
    }
}

#[derive(Debug, Deserialize)]
struct CoinbaseBook {
    #[serde(default)]
    bids: Vec<Vec<Value>>,
    #[serde(default)]
    asks: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct KrakenResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: Option<std::collections::HashMap<String, KrakenBook>>,
}

#[derive(Debug, Deserialize)]
struct KrakenBook {
    #[serde(default)]
    bids: Vec<Vec<Value>>,
    #[serde(default)]
    asks: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Option<BybitBook>,
}

#[derive(Debug, Deserialize)]
struct BybitBook {
    #[serde(default)]
    b: Vec<Vec<Value>>,
    #[serde(default)]
    a: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct OkxResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<OkxBook>,
}

#[derive(Debug, Deserialize)]
struct OkxBook {
    #[serde(default)]
    bids: Vec<Vec<Value>>,
    #[serde(default)]
    asks: Vec<Vec<Value>>,
}

/// REST client for one venue and quote currency
pub struct RestVenue {
    kind: RestVenueKind,
    quote: String,
    data_class: DataClass,
    client: Client,
}

impl RestVenue {
    pub fn new(kind: RestVenueKind, quote: &str, data_class: DataClass) -> Result<Self> {
        if !kind.supports(data_class) {
            return Err(CollectorError::UnsupportedVenue(format!(
                "{} has no {} market",
                kind.as_str(),
                data_class.as_str()
            )));
        }
        let client = Client::builder()
            .timeout(kind.timeout())
            .user_agent(USER_AGENT)
            .build()?;

        Ok(RestVenue {
            kind,
            quote: quote.to_string(),
            data_class,
            client,
        })
    }

    fn permanent(&self, message: impl Into<String>) -> CollectorError {
        CollectorError::PermanentExchange {
            venue: self.kind.as_str().to_string(),
            message: message.into(),
        }
    }

    /// GET and map transport failures and HTTP statuses onto the error taxonomy
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let response = self
            .client
            .get(url)
            .query(query)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_transport_error(e))?;
        debug!("{} {} -> {}", self.kind.as_str(), url, status);

        if let Some(err) = self.classify_status(status, &body) {
            return Err(err);
        }
        serde_json::from_str(&body).map_err(|e| self.permanent(format!("unexpected response: {}", e)))
    }

    fn map_transport_error(&self, e: reqwest::Error) -> CollectorError {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            CollectorError::TransientNetwork(format!("{}: {}", self.kind.as_str(), e))
        } else {
            CollectorError::HttpError(e)
        }
    }

    fn classify_status(&self, status: StatusCode, body: &str) -> Option<CollectorError> {
        let snippet: String = body.chars().take(200).collect();
        if status == StatusCode::TOO_MANY_REQUESTS {
            Some(CollectorError::RateLimited(format!("{}: {}", self.kind.as_str(), snippet)))
        } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            Some(CollectorError::TransientNetwork(format!(
                "{} returned {}: {}",
                self.kind.as_str(),
                status,
                snippet
            )))
        } else if status.is_client_error() {
            Some(self.permanent(format!("HTTP {}: {}", status, snippet)))
        } else {
            None
        }
    }

    async fn fetch_coinbase(&self, symbol: &str) -> Result<OrderBook> {
        let url = format!("{}/products/{}/book", COINBASE_URL, symbol);
        let book: CoinbaseBook = self.get_json(&url, &[("level", "2".to_string())]).await?;
        Ok(OrderBook {
            bids: parse_levels(&book.bids)?,
            asks: parse_levels(&book.asks)?,
        })
    }

    async fn fetch_kraken(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        let url = format!("{}/0/public/Depth", KRAKEN_URL);
        let response: KrakenResponse = self
            .get_json(&url, &[("pair", symbol.to_string()), ("count", depth.to_string())])
            .await?;

        if let Some(error) = response.error.first() {
            return Err(classify_kraken_error(error));
        }
        // Kraken keys the result by its own pair name (XXBTZUSD for XBTUSD)
        let book = response
            .result
            .and_then(|r| r.into_values().next())
            .ok_or_else(|| CollectorError::InstrumentUnavailable(format!("kraken:{}", symbol)))?;
        Ok(OrderBook {
            bids: parse_levels(&book.bids)?,
            asks: parse_levels(&book.asks)?,
        })
    }

    async fn fetch_bybit(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        let category = match self.data_class {
            DataClass::Spot => "spot",
            DataClass::Futures => "linear",
        };
        let url = format!("{}/v5/market/orderbook", BYBIT_URL);
        let response: BybitResponse = self
            .get_json(
                &url,
                &[
                    ("category", category.to_string()),
                    ("symbol", symbol.to_string()),
                    ("limit", depth.to_string()),
                ],
            )
            .await?;

        match response.ret_code {
            0 => {}
            10006 | 10018 => return Err(CollectorError::RateLimited(format!("bybit: {}", response.ret_msg))),
            10000 | 10016 => {
                return Err(CollectorError::TransientNetwork(format!("bybit: {}", response.ret_msg)))
            }
            10001 => return Err(CollectorError::InstrumentUnavailable(format!("bybit:{} ({})", symbol, response.ret_msg))),
            code => return Err(self.permanent(format!("retCode {}: {}", code, response.ret_msg))),
        }
        let book = response
            .result
            .ok_or_else(|| CollectorError::InstrumentUnavailable(format!("bybit:{}", symbol)))?;
        Ok(OrderBook {
            bids: parse_levels(&book.b)?,
            asks: parse_levels(&book.a)?,
        })
    }

    async fn fetch_okx(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        let url = format!("{}/api/v5/market/books", OKX_URL);
        let response: OkxResponse = self
            .get_json(&url, &[("instId", symbol.to_string()), ("sz", depth.to_string())])
            .await?;

        match response.code.as_str() {
            "0" => {}
            "50011" | "50061" => return Err(CollectorError::RateLimited(format!("okx: {}", response.msg))),
            "50001" | "50004" | "50013" => {
                return Err(CollectorError::TransientNetwork(format!("okx: {}", response.msg)))
            }
            "51001" => return Err(CollectorError::InstrumentUnavailable(format!("okx:{}", symbol))),
            code => return Err(self.permanent(format!("code {}: {}", code, response.msg))),
        }
        let book = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| CollectorError::InstrumentUnavailable(format!("okx:{}", symbol)))?;
        Ok(OrderBook {
            bids: parse_levels(&book.bids)?,
            asks: parse_levels(&book.asks)?,
        })
    }
}

#[async_trait]
impl VenueClient for RestVenue {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn data_class(&self) -> DataClass {
        self.data_class
    }

    async fn fetch_order_book(&self, instrument: &str, depth: usize) -> Result<OrderBook> {
        let symbol = venue_symbol(self.kind, self.data_class, instrument, &self.quote);
        let request_depth = depth.clamp(1, self.kind.max_depth(self.data_class));

        let book = match self.kind {
            RestVenueKind::Coinbase => self.fetch_coinbase(&symbol).await?,
            RestVenueKind::Kraken => self.fetch_kraken(&symbol, request_depth).await?,
            RestVenueKind::Bybit => self.fetch_bybit(&symbol, request_depth).await?,
            RestVenueKind::Okx => self.fetch_okx(&symbol, request_depth).await?,
        };
        Ok(book.normalized().truncated(depth))
    }
}

fn classify_kraken_error(error: &str) -> CollectorError {
    if error.contains("Rate limit") || error.contains("Too many requests") {
        CollectorError::RateLimited(format!("kraken: {}", error))
    } else if error.starts_with("EService") || error.contains("Busy") {
        CollectorError::TransientNetwork(format!("kraken: {}", error))
    } else if error.contains("Unknown asset pair") {
        CollectorError::InstrumentUnavailable(format!("kraken: {}", error))
    } else {
        CollectorError::PermanentExchange {
            venue: "kraken".to_string(),
            message: error.to_string(),
        }
    }
}

/// Levels arrive as `[price, size, ...]` with numbers or numeric strings
fn parse_levels(raw: &[Vec<Value>]) -> Result<Vec<Level>> {
    raw.iter()
        .map(|level| {
            let price = level.first().and_then(as_f64);
            let size = level.get(1).and_then(as_f64);
            match (price, size) {
                (Some(p), Some(s)) => Ok((p, s)),
                _ => Err(CollectorError::InvalidRecord(format!("unparseable book level: {:?}", level))),
            }
        })
        .collect()
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
