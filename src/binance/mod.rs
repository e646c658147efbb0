// =============================================================================
// Exchange access: REST client, symbol filters, shared circuit breaker
// =============================================================================

pub mod circuit;
pub mod client;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::errors::EngineError;
use crate::types::Trade;

pub use circuit::CircuitBreaker;
pub use client::ExchangeClient;

/// Symbol trading filters resolved once at startup and immutable thereafter.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolFilters {
    pub symbol: String,
    pub tick_size: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_size: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_qty: Option<Decimal>,
}

/// The slice of the exchange REST surface the historical fetcher depends on.
///
/// Split out as a trait so chunk workers can be exercised against an
/// in-process mock, the same seam that lets `LiveSource` swap exchanges.
#[async_trait]
pub trait TradesApi: Send + Sync {
    /// Fetch aggregated trades in `[start_ms, end_ms)`, at most `limit` rows,
    /// ordered by timestamp.
    async fn agg_trades(
        &self,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Trade>, EngineError>;

    /// True while requests carry credentials.
    fn is_authenticated(&self) -> bool;

    /// Drop to unauthenticated mode. Returns false if already public.
    fn demote_to_public(&self) -> bool;
}
