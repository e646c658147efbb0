// =============================================================================
// Aggregated-trade WebSocket stream
// =============================================================================
//
// Connects to the exchange's futures stream endpoint and yields one event per
// frame. Subscription uses the in-band SUBSCRIBE method so the supervisor can
// re-subscribe after every reconnect without rebuilding the URL.
// =============================================================================

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::types::{Trade, TradeId};

use super::{Channel, LiveEvent, LiveSource, SourceHealth};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const DEFAULT_WS_BASE: &str = "wss://fstream.binance.com/ws";

pub struct AggTradeStream {
    symbol: String,
    ws_base: String,
    stream: Option<WsStream>,
    subscribe_id: u64,
    error_count: u64,
    reconnects: u64,
    last_event: Option<Instant>,
}

impl AggTradeStream {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ws_base: DEFAULT_WS_BASE.to_string(),
            stream: None,
            subscribe_id: 0,
            error_count: 0,
            reconnects: 0,
            last_event: None,
        }
    }

}

/// Stream parameter name for a channel on a symbol.
fn param_for(symbol: &str, channel: Channel) -> String {
    let lower = symbol.to_lowercase();
    match channel {
        Channel::AggTrades => format!("{lower}@aggTrade"),
        Channel::Depth => format!("{lower}@depth20@100ms"),
    }
}

#[async_trait]
impl LiveSource for AggTradeStream {
    async fn connect(&mut self) -> Result<()> {
        info!(url = %self.ws_base, symbol = %self.symbol, "connecting to trade WebSocket");
        let (ws_stream, _response) = connect_async(&self.ws_base)
            .await
            .context("failed to connect to trade WebSocket")?;
        if self.stream.is_some() {
            self.reconnects += 1;
        }
        self.stream = Some(ws_stream);
        info!(symbol = %self.symbol, "trade WebSocket connected");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    async fn subscribe(&mut self, channels: &[Channel]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .context("subscribe called before connect")?;

        let params: Vec<String> = channels.iter().map(|c| param_for(&self.symbol, *c)).collect();
        self.subscribe_id += 1;
        let payload = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": self.subscribe_id,
        });

        stream
            .send(Message::Text(payload.to_string()))
            .await
            .context("failed to send SUBSCRIBE frame")?;

        info!(symbol = %self.symbol, params = ?params, "subscribed");
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<LiveEvent>> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(None),
        };

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.last_event = Some(Instant::now());
                    match parse_stream_event(&text) {
                        Ok(Some(event)) => return Ok(Some(event)),
                        Ok(None) => continue,
                        Err(e) => {
                            self.error_count += 1;
                            warn!(error = %e, "failed to parse stream message");
                            continue;
                        }
                    }
                }
                // tungstenite answers pings automatically; both frames still
                // count as liveness.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    self.last_event = Some(Instant::now());
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.stream = None;
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.error_count += 1;
                    self.stream = None;
                    return Err(e.into());
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn health(&self) -> SourceHealth {
        SourceHealth {
            connected: self.stream.is_some(),
            reconnects: self.reconnects,
            error_count: self.error_count,
            seconds_since_last_event: self.last_event.map(|t| t.elapsed().as_secs()),
            queue_size: 0,
        }
    }
}

// -----------------------------------------------------------------------------
// Frame parsing
// -----------------------------------------------------------------------------

/// Parse one text frame into an event. Returns `Ok(None)` for frames the
/// engine does not consume (subscription acks, unknown event types).
///
/// aggTrade shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "a": 12345, "p": "37000.00",
///   "q": "0.123", "T": 1700000000000, "m": true }
/// ```
fn parse_stream_event(text: &str) -> Result<Option<LiveEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("stream message is not JSON")?;

    // Combined-stream envelope support.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    // Subscription ack: {"result": null, "id": n}
    if data.get("result").is_some() {
        debug!("subscription acknowledged");
        return Ok(Some(LiveEvent::Status("subscribed".to_string())));
    }

    match data["e"].as_str() {
        Some("aggTrade") => {
            let id = data["a"]
                .as_i64()
                .map(TradeId::Int)
                .or_else(|| data["a"].as_str().map(TradeId::parse))
                .context("missing field a")?;
            let price: Decimal = data["p"]
                .as_str()
                .context("missing field p")?
                .parse()
                .context("failed to parse price")?;
            let qty: Decimal = data["q"]
                .as_str()
                .context("missing field q")?
                .parse()
                .context("failed to parse quantity")?;
            let ts_ms = data["T"].as_i64().context("missing field T")?;
            let is_buyer_maker = data["m"].as_bool().context("missing field m")?;

            Ok(Some(LiveEvent::Trade(Trade {
                ts_ms,
                id,
                price,
                qty,
                is_buyer_maker,
            })))
        }
        Some("depthUpdate") => {
            let best = |key: &str| -> Option<Decimal> {
                data[key]
                    .as_array()?
                    .first()?
                    .as_array()?
                    .first()?
                    .as_str()?
                    .parse()
                    .ok()
            };
            match (best("b"), best("a")) {
                (Some(best_bid), Some(best_ask)) => Ok(Some(LiveEvent::Depth {
                    best_bid,
                    best_ask,
                    ts_ms: data["E"].as_i64().unwrap_or(0),
                })),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}
