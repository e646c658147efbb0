// =============================================================================
// Shared types used across the context engine
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Exchange trade identifier.
///
/// Integer on Binance-style venues, string elsewhere. Kept as a tagged union
/// with a total order so deduplication never loses information; ids are never
/// coerced to a numeric hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TradeId {
    Int(i64),
    Str(String),
}

impl TradeId {
    /// Parse from the textual form used in cache files: integral text maps
    /// back to `Int`, anything else stays `Str`.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) => Self::Int(n),
            Err(_) => Self::Str(raw.to_string()),
        }
    }
}

impl std::fmt::Display for TradeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A single executed trade, normalized across the REST and stream paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Event time, UTC milliseconds.
    pub ts_ms: i64,
    pub id: TradeId,
    pub price: Decimal,
    pub qty: Decimal,
    /// True when the buyer was the resting (maker) side, i.e. the aggressor
    /// sold.
    pub is_buyer_maker: bool,
}

impl Trade {
    pub fn side(&self) -> Side {
        if self.is_buyer_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// Basic sanity used by every ingress path: positive price and quantity.
    pub fn is_valid(&self) -> bool {
        self.price > Decimal::ZERO && self.qty > Decimal::ZERO
    }
}

// ---------------------------------------------------------------------------
// Data-source selection
// ---------------------------------------------------------------------------

/// Which live connector feeds the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    /// Poll the aggregated-trades REST endpoint.
    LiveRest,
    /// Native aggregated-trades WebSocket stream.
    LiveStream,
    /// Alias for the stream connector kept for config compatibility.
    LiveConnector,
    /// Stream connector that starts without a historical backfill.
    SkipBackfillConnector,
}

impl DataSourceKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "live_rest" => Some(Self::LiveRest),
            "live_stream" => Some(Self::LiveStream),
            "live_connector" => Some(Self::LiveConnector),
            "skip_backfill_connector" => Some(Self::SkipBackfillConnector),
            _ => None,
        }
    }

    /// Sources of this kind never run the historical backfill.
    pub fn skips_backfill(&self) -> bool {
        matches!(self, Self::SkipBackfillConnector)
    }
}

impl std::fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LiveRest => write!(f, "live_rest"),
            Self::LiveStream => write!(f, "live_stream"),
            Self::LiveConnector => write!(f, "live_connector"),
            Self::SkipBackfillConnector => write!(f, "skip_backfill_connector"),
        }
    }
}

// ---------------------------------------------------------------------------
// Backfill status
// ---------------------------------------------------------------------------

/// Lifecycle state of the background backfill task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillState {
    NotStarted,
    Pending,
    Running,
    Complete,
    Skipped,
    Disabled,
    Error,
    Cancelled,
}

impl BackfillState {
    /// States in which intraday metrics are considered complete.
    pub fn is_success_equivalent(&self) -> bool {
        matches!(self, Self::Complete | Self::Skipped | Self::Disabled)
    }

    /// Terminal states: the task will not make further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Skipped | Self::Disabled | Self::Error | Self::Cancelled
        )
    }
}

impl std::fmt::Display for BackfillState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Skipped => "skipped",
            Self::Disabled => "disabled",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Serialisable snapshot of backfill progress for the status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillStatus {
    pub state: BackfillState,
    pub chunks_total: usize,
    pub chunks_done: usize,
    pub chunks_failed: usize,
    pub trades_loaded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BackfillStatus {
    /// Completed fraction in [0, 1]; 0 when the chunk count is unknown.
    pub fn progress_fraction(&self) -> f64 {
        if self.chunks_total == 0 {
            0.0
        } else {
            self.chunks_done as f64 / self.chunks_total as f64
        }
    }
}

/// Whether intraday metrics currently reconcile with a full-day replay.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsPrecision {
    Precise,
    /// Backfill has not reached a success-equivalent state; the payload
    /// carries the completed percentage.
    Imprecise { backfill_pct: u8 },
}

impl std::fmt::Display for MetricsPrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Precise => write!(f, "PRECISE"),
            Self::Imprecise { backfill_pct } => {
                write!(f, "IMPRECISE (backfill {backfill_pct}%)")
            }
        }
    }
}
