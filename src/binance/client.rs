// =============================================================================
// Exchange REST client: aggregated trades + symbol metadata, HMAC-SHA256
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Signed requests
// carry the API key in the X-MBX-APIKEY header and a recvWindow of 5 000 ms
// to tolerate minor clock drift against the exchange.
//
// Credentials are optional. Without them (or after a rate-limit / auth
// downgrade) the client runs in public mode: unsigned requests against the
// public aggregated-trades endpoint.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::config::ExchangeSettings;
use crate::errors::EngineError;
use crate::types::{Trade, TradeId};

use super::{SymbolFilters, TradesApi};

type HmacSha256 = Hmac<Sha256>;

/// recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

pub struct ExchangeClient {
    symbol: String,
    api_key: Option<String>,
    secret: Option<String>,
    base_url: String,
    client: reqwest::Client,
    /// Set once by the auth/rate-limit downgrade path; never cleared.
    demoted: AtomicBool,
}

impl ExchangeClient {
    pub fn new(settings: &ExchangeSettings) -> Self {
        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &settings.api_key {
            if let Ok(val) = reqwest::header::HeaderValue::from_str(key) {
                default_headers.insert("X-MBX-APIKEY", val);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(settings.timeout_secs))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %settings.base_url, symbol = %settings.symbol, "exchange client initialised");

        Self {
            symbol: settings.symbol.clone(),
            api_key: settings.api_key.clone(),
            secret: settings.secret.clone(),
            base_url: settings.base_url.clone(),
            client,
            demoted: AtomicBool::new(false),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    pub fn sign(secret: &str, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Append timestamp, recvWindow and signature to `params`.
    fn signed_query(&self, params: &str) -> Option<String> {
        let secret = self.secret.as_deref()?;
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = Self::sign(secret, &base);
        Some(format!("{base}&signature={sig}"))
    }

    /// Verbose signature diagnostics for the authentication test mode. Logs
    /// the query and a signature prefix, never the secret or full signature.
    pub fn log_signature_probe(&self, params: &str) {
        match self.signed_query(params) {
            Some(qs) => {
                let sig_prefix: String = qs
                    .rsplit("signature=")
                    .next()
                    .unwrap_or("")
                    .chars()
                    .take(8)
                    .collect();
                info!(params, sig_prefix = %sig_prefix, "signed request probe");
            }
            None => warn!("signature probe requested without credentials"),
        }
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, EngineError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(EngineError::from_transport)?;

        let status = resp.status();
        let text = resp.text().await.map_err(EngineError::from_transport)?;

        if !status.is_success() {
            return Err(EngineError::from_status(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| EngineError::Parse(format!("response body not JSON: {e}")))
    }

    // -------------------------------------------------------------------------
    // Symbol metadata
    // -------------------------------------------------------------------------

    /// One-shot exchangeInfo lookup of the symbol's trading filters.
    pub async fn exchange_filters(&self) -> Result<SymbolFilters, EngineError> {
        let url = format!(
            "{}/fapi/v1/exchangeInfo?symbol={}",
            self.base_url, self.symbol
        );
        let body = self.get_json(&url).await?;

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(&self.symbol)))
            .ok_or_else(|| {
                EngineError::Parse(format!("symbol {} missing from exchangeInfo", self.symbol))
            })?;

        let filters = info["filters"]
            .as_array()
            .ok_or_else(|| EngineError::Parse("exchangeInfo filters missing".into()))?;

        let mut tick_size = None;
        let mut step_size = None;
        let mut min_qty = None;
        for f in filters {
            match f["filterType"].as_str() {
                Some("PRICE_FILTER") => {
                    tick_size = f["tickSize"].as_str().and_then(|s| s.parse::<Decimal>().ok());
                }
                Some("LOT_SIZE") => {
                    step_size = f["stepSize"].as_str().and_then(|s| s.parse::<Decimal>().ok());
                    min_qty = f["minQty"].as_str().and_then(|s| s.parse::<Decimal>().ok());
                }
                _ => {}
            }
        }

        let tick_size = tick_size
            .ok_or_else(|| EngineError::Parse("PRICE_FILTER.tickSize missing".into()))?;

        debug!(symbol = %self.symbol, tick = %tick_size, "symbol filters resolved");
        Ok(SymbolFilters {
            symbol: self.symbol.clone(),
            tick_size,
            step_size,
            min_qty,
        })
    }
}

// -----------------------------------------------------------------------------
// Aggregated trades
// -----------------------------------------------------------------------------

/// Parse one aggTrades row: `{"a": id, "p": "price", "q": "qty", "T": ts, "m": bool}`.
fn parse_agg_trade_row(row: &serde_json::Value) -> Result<Trade, EngineError> {
    let id = row["a"]
        .as_i64()
        .map(TradeId::Int)
        .or_else(|| row["a"].as_str().map(TradeId::parse))
        .ok_or_else(|| EngineError::Parse("missing field a".into()))?;

    let price: Decimal = row["p"]
        .as_str()
        .ok_or_else(|| EngineError::Parse("missing field p".into()))?
        .parse()
        .map_err(|e| EngineError::Parse(format!("bad price: {e}")))?;

    let qty: Decimal = row["q"]
        .as_str()
        .ok_or_else(|| EngineError::Parse("missing field q".into()))?
        .parse()
        .map_err(|e| EngineError::Parse(format!("bad qty: {e}")))?;

    let ts_ms = row["T"]
        .as_i64()
        .ok_or_else(|| EngineError::Parse("missing field T".into()))?;

    let is_buyer_maker = row["m"]
        .as_bool()
        .ok_or_else(|| EngineError::Parse("missing field m".into()))?;

    Ok(Trade {
        ts_ms,
        id,
        price,
        qty,
        is_buyer_maker,
    })
}

#[async_trait]
impl TradesApi for ExchangeClient {
    async fn agg_trades(
        &self,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Trade>, EngineError> {
        let params = format!(
            "symbol={}&startTime={}&endTime={}&limit={}",
            self.symbol, start_ms, end_ms, limit
        );

        let qs = if self.is_authenticated() {
            self.signed_query(&params).unwrap_or(params)
        } else {
            params
        };

        let url = format!("{}/fapi/v1/aggTrades?{}", self.base_url, qs);
        let body = self.get_json(&url).await?;

        let rows = body
            .as_array()
            .ok_or_else(|| EngineError::Parse("aggTrades response is not an array".into()))?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_agg_trade_row(row) {
                Ok(t) => trades.push(t),
                // A single malformed row never fails the batch.
                Err(e) => debug!(error = %e, "skipping malformed aggTrade row"),
            }
        }
        Ok(trades)
    }

    fn is_authenticated(&self) -> bool {
        self.api_key.is_some() && self.secret.is_some() && !self.demoted.load(Ordering::Relaxed)
    }

    fn demote_to_public(&self) -> bool {
        let was_authenticated = self.is_authenticated();
        if was_authenticated {
            self.demoted.store(true, Ordering::Relaxed);
            warn!("exchange client downgraded to public mode");
        }
        was_authenticated
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("symbol", &self.symbol)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("demoted", &self.demoted.load(Ordering::Relaxed))
            .finish()
    }
}
