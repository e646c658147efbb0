// =============================================================================
// Context engine orchestrator
// =============================================================================
//
// Owns every long-lived task and the single accumulator. Startup is
// non-blocking: the historical backfill runs in the background while the live
// source already feeds the engine. Live trades that arrive before the
// backfill finishes are buffered and drained afterwards, discarding any id at
// or below the backfill high-water mark, so the same instant is never counted
// twice and ingestion stays in timestamp order.
//
// Thread safety:
//   - The accumulator sits behind one RwLock; every ingress path takes the
//     write lock, every snapshot takes a short read lock.
//   - Atomic flags for trading-enabled; parking_lot mutexes for the live
//     buffer and id watermarks.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backfill::{BackfillProgress, HistoricalFetcher, TradeCache};
use crate::binance::{CircuitBreaker, ExchangeClient, SymbolFilters, TradesApi};
use crate::config::EngineConfig;
use crate::context::{Accumulator, PreviousDayLevels, VwapMode};
use crate::history::HistoryStore;
use crate::live::{
    run_supervised, AggTradeStream, Channel, LiveHealth, LiveSource, RestPollSource,
    SourceHealth, SupervisorSettings,
};
use crate::quantize::validate_tick;
use crate::types::{
    BackfillState, BackfillStatus, DataSourceKind, MetricsPrecision, Trade, TradeId,
};

/// Live trades held while the backfill runs; beyond this the oldest are shed.
const LIVE_BUFFER_CAP: usize = 100_000;

/// Grace given to background tasks at shutdown before they are aborted.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ContextEngine {
    config: EngineConfig,
    client: Arc<ExchangeClient>,
    breaker: Arc<CircuitBreaker>,
    cache: Option<Arc<TradeCache>>,
    history: HistoryStore,
    filters: RwLock<Option<SymbolFilters>>,

    acc: RwLock<Accumulator>,
    progress: Arc<BackfillProgress>,
    live_health: Arc<LiveHealth>,
    trading_enabled: AtomicBool,

    /// `Some` while live trades are being held back for the backfill.
    live_buffer: Mutex<Option<VecDeque<Trade>>>,
    /// Highest trade id ingested from the backfill path.
    backfill_high_water: Mutex<Option<TradeId>>,
    /// Highest trade id ingested from the live path (reconnect dedup).
    last_live_id: Mutex<Option<TradeId>>,

    start_time: Instant,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ContextEngine {
    // -------------------------------------------------------------------------
    // Construction & startup
    // -------------------------------------------------------------------------

    /// Assemble the engine without touching the network. The caller provides
    /// the already-resolved tick and optional symbol filters.
    fn build(config: EngineConfig, tick: Decimal, filters: Option<SymbolFilters>) -> Arc<Self> {
        let client = Arc::new(ExchangeClient::new(&config.exchange));
        Self::build_with_client(config, client, tick, filters)
    }

    fn build_with_client(
        config: EngineConfig,
        client: Arc<ExchangeClient>,
        tick: Decimal,
        filters: Option<SymbolFilters>,
    ) -> Arc<Self> {
        let breaker = Arc::new(CircuitBreaker::new(
            config.backfill.rate_limit_threshold,
            config.backfill.cooldown(),
            config.backfill.concurrency_for(client.is_authenticated()),
        ));
        let cache = config
            .cache_enabled
            .then(|| Arc::new(TradeCache::new(config.cache_dir.clone())));
        let history = HistoryStore::new(config.history_dir.clone());

        let today = Utc::now().date_naive();
        let acc = Accumulator::new(tick, config.disable_live_data, today);

        // Live trades are buffered only when a real backfill will run.
        let backfill_will_run =
            config.backfill_enabled && !config.data_source.skips_backfill();

        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            client,
            breaker,
            cache,
            history,
            filters: RwLock::new(filters),
            acc: RwLock::new(acc),
            progress: Arc::new(BackfillProgress::new()),
            live_health: Arc::new(LiveHealth::new()),
            trading_enabled: AtomicBool::new(false),
            live_buffer: Mutex::new(backfill_will_run.then(VecDeque::new)),
            backfill_high_water: Mutex::new(None),
            last_live_id: Mutex::new(None),
            start_time: Instant::now(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Full startup: resolve the tick, restore previous-day levels, launch
    /// the background tasks, and return immediately.
    pub async fn start(config: EngineConfig) -> Result<Arc<Self>> {
        // One client per exchange, shared by every request for the process
        // lifetime.
        let client = Arc::new(ExchangeClient::new(&config.exchange));

        // One-shot metadata fetch; failure falls back to the configured tick.
        let (tick, filters) = match client.exchange_filters().await {
            Ok(f) => match validate_tick(f.tick_size) {
                Ok(tick) => (tick, Some(f)),
                Err(e) => {
                    warn!(error = %e, fallback = %config.fallback_tick, "exchange tick invalid, using fallback");
                    (config.fallback_tick, Some(f))
                }
            },
            Err(e) => {
                warn!(error = %e, fallback = %config.fallback_tick, "exchangeInfo fetch failed, using fallback tick");
                (config.fallback_tick, None)
            }
        };
        info!(tick = %tick, "profile tick resolved");

        let engine = Self::build_with_client(config, client, tick, filters);
        engine.load_previous_day();

        if let Some(cache) = &engine.cache {
            let removed =
                cache.cleanup_older_than(engine.config.cache_retention_days, Utc::now().date_naive());
            if removed > 0 {
                info!(removed, "stale cache files cleaned up");
            }
        }

        engine.spawn_backfill_task();
        engine.spawn_live_tasks();
        engine.spawn_day_roll_task();

        info!(symbol = %engine.config.symbol, "context engine started");
        Ok(engine)
    }

    fn load_previous_day(&self) {
        let yesterday = Utc::now().date_naive().pred_opt().expect("valid date");
        match self.history.load_levels(&self.config.symbol, yesterday) {
            Ok(Some(levels)) => {
                info!(poc = %levels.poc, pdh = %levels.pdh, pdl = %levels.pdl, "previous-day levels restored");
                self.acc.write().set_previous(levels);
            }
            Ok(None) => {
                info!(%yesterday, "no previous-day profile on disk");
            }
            Err(e) => {
                warn!(error = %e, "previous-day profile unreadable, continuing without it");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------------

    fn spawn_backfill_task(self: &Arc<Self>) {
        if !self.config.backfill_enabled {
            info!("backfill disabled by configuration");
            self.progress.set_state(BackfillState::Disabled);
            self.finish_ingest_boundary();
            return;
        }
        if self.config.data_source.skips_backfill() {
            info!(source = %self.config.data_source, "data source skips backfill");
            self.progress.set_state(BackfillState::Skipped);
            self.finish_ingest_boundary();
            return;
        }

        self.progress.set_state(BackfillState::Pending);
        let engine = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = engine.clone().run_backfill() => {}
                _ = shutdown.changed() => {
                    engine.progress.set_state(BackfillState::Cancelled);
                    info!("backfill cancelled by shutdown");
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn run_backfill(self: Arc<Self>) {
        let fetcher = HistoricalFetcher::new(
            self.client.clone() as Arc<dyn TradesApi>,
            self.breaker.clone(),
            self.cache.clone(),
            self.config.backfill.clone(),
            self.progress.clone(),
        );

        if self.config.backfill.test_mode {
            self.run_backfill_test(&fetcher).await;
            return;
        }

        let today = Utc::now().date_naive();
        let day_start_ms = today
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc()
            .timestamp_millis();
        let now_ms = Utc::now().timestamp_millis();

        info!(start_ms = day_start_ms, end_ms = now_ms, "backfill task starting");
        self.progress.set_state(BackfillState::Running);

        match fetcher.backfill_with_cache(today, day_start_ms, now_ms).await {
            Ok(trades) => self.complete_backfill(&trades),
            Err(e) => {
                error!(error = %e, "backfill failed, live ingestion continues");
                self.progress.fail(e.to_string());
                // Buffered live trades are all the history we will get.
                self.finish_ingest_boundary();
            }
        }
    }

    /// Authentication test mode: one serial fetch over a fixed 1-hour window
    /// with verbose signing diagnostics, never a full-day backfill.
    async fn run_backfill_test(&self, fetcher: &HistoricalFetcher) {
        let end_ms = Utc::now().timestamp_millis();
        let start_ms = end_ms - 3_600_000;

        info!(start_ms, end_ms, authenticated = self.client.is_authenticated(), "backfill TEST MODE: single 1-hour window");
        self.client.log_signature_probe(&format!(
            "symbol={}&startTime={start_ms}&endTime={end_ms}&limit={}",
            self.config.symbol, self.config.backfill.page_limit
        ));

        self.progress.set_state(BackfillState::Running);
        match fetcher.fetch_range(start_ms, end_ms).await {
            Ok(trades) => {
                info!(trades = trades.len(), "test window fetched; authentication path verified");
                self.complete_backfill(&trades);
            }
            Err(e) => {
                error!(error = %e, "test window fetch failed");
                self.progress.fail(e.to_string());
                self.finish_ingest_boundary();
            }
        }
    }

    /// Ingest the backfill result in timestamp order, then open the live
    /// floodgate: record the high-water id, drain the buffer, enable trading.
    fn complete_backfill(&self, trades: &[Trade]) {
        let mut high_water: Option<TradeId> = None;
        {
            let mut acc = self.acc.write();
            for trade in trades {
                match acc.ingest(trade, true) {
                    Ok(_) => {
                        if high_water.as_ref().map_or(true, |hw| trade.id > *hw) {
                            high_water = Some(trade.id.clone());
                        }
                    }
                    Err(e) => {
                        self.fatal(e.to_string());
                        return;
                    }
                }
            }
        }
        *self.backfill_high_water.lock() = high_water;

        self.finish_ingest_boundary();
        self.progress.set_state(BackfillState::Complete);
        self.trading_enabled.store(true, Ordering::SeqCst);

        let acc = self.acc.read();
        let day = acc.day();
        info!(
            trades = trades.len(),
            from_backfill = day.trades_from_backfill,
            from_live = day.trades_from_live,
            rejected = day.live_trades_rejected,
            vwap = %acc.vwap(VwapMode::Base).unwrap_or_default(),
            poc = %day.profile.poc().unwrap_or_default(),
            day_range = %day.day_range(),
            "backfill complete, trading enabled"
        );
    }

    /// Stop buffering and replay anything held back. Trades at or below the
    /// backfill high-water mark were already counted and are discarded.
    fn finish_ingest_boundary(&self) {
        let buffered = self.live_buffer.lock().take();
        let Some(buffered) = buffered else {
            // Buffering never started (backfill disabled or skipped).
            if self.progress.state().is_success_equivalent() {
                self.trading_enabled.store(true, Ordering::SeqCst);
            }
            self.live_health.set_queue_size(0);
            return;
        };

        let drained = buffered.len();
        for trade in buffered {
            self.ingest_now(trade);
        }
        self.live_health.set_queue_size(0);
        if drained > 0 {
            info!(drained, "buffered live trades replayed after backfill");
        }
    }

    fn spawn_live_tasks(self: &Arc<Self>) {
        let source: Box<dyn LiveSource> = match self.config.data_source {
            DataSourceKind::LiveRest => {
                Box::new(RestPollSource::new(self.client.clone() as Arc<dyn TradesApi>))
            }
            DataSourceKind::LiveStream
            | DataSourceKind::LiveConnector
            | DataSourceKind::SkipBackfillConnector => {
                Box::new(AggTradeStream::new(self.config.symbol.clone()))
            }
        };

        let (tx, mut rx) = mpsc::channel::<Trade>(8192);

        let supervisor = tokio::spawn(run_supervised(
            source,
            vec![Channel::AggTrades],
            self.live_health.clone(),
            tx,
            self.shutdown_tx.subscribe(),
            SupervisorSettings::default(),
        ));

        let engine = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let ingest = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    maybe = rx.recv() => match maybe {
                        Some(trade) => engine.handle_live_trade(trade),
                        None => return,
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(supervisor);
        tasks.push(ingest);
    }

    fn spawn_day_roll_task(self: &Arc<Self>) {
        let engine = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = interval.tick() => engine.roll_day_if_needed(),
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn roll_day_if_needed(&self) {
        let today = Utc::now().date_naive();
        let needs_roll = self.acc.read().day().date < today;
        if !needs_roll {
            return;
        }

        let rolled = self.acc.write().roll_day(today);
        if let Some(rolled) = &rolled {
            if let Err(e) = self.history.save_day(&self.config.symbol, rolled) {
                error!(error = %e, "failed to persist rolled day");
            }
        }

        if let Some(cache) = &self.cache {
            cache.cleanup_older_than(self.config.cache_retention_days, today);
        }
    }

    // -------------------------------------------------------------------------
    // Live ingress
    // -------------------------------------------------------------------------

    /// Entry point for every live trade: buffer while the backfill runs,
    /// otherwise ingest immediately.
    fn handle_live_trade(&self, trade: Trade) {
        let mut guard = self.live_buffer.lock();
        if let Some(buffer) = guard.as_mut() {
            if buffer.len() >= LIVE_BUFFER_CAP {
                // Shedding the oldest keeps the most recent market state; the
                // dropped span is inside the backfill window anyway.
                buffer.pop_front();
            }
            buffer.push_back(trade);
            self.live_health.set_queue_size(buffer.len());
            return;
        }
        drop(guard);

        self.ingest_now(trade);
    }

    /// Ingest a live trade with id-based duplicate suppression across the
    /// backfill boundary and stream reconnects.
    fn ingest_now(&self, trade: Trade) {
        if let Some(hw) = &*self.backfill_high_water.lock() {
            if trade.id <= *hw {
                return;
            }
        }
        {
            let mut last = self.last_live_id.lock();
            if let Some(last_id) = &*last {
                if trade.id <= *last_id {
                    return;
                }
            }
            *last = Some(trade.id.clone());
        }

        if let Err(e) = self.acc.write().ingest(&trade, false) {
            self.fatal(e.to_string());
        }
    }

    /// An accumulator invariant breach is unrecoverable: log and bring the
    /// whole engine down.
    fn fatal(&self, message: String) {
        error!(message, "fatal accumulator error, shutting down engine");
        let _ = self.shutdown_tx.send(true);
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Watch endpoint main uses to observe engine-initiated termination.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Cancel background tasks and await them within a bounded timeout;
    /// stragglers are aborted.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await.is_err() {
                warn!("background task did not stop in time, aborting");
                handle.abort();
            }
        }
        info!("engine shutdown complete");
    }

    // -------------------------------------------------------------------------
    // Read API projection
    // -------------------------------------------------------------------------

    pub fn trading_enabled(&self) -> bool {
        self.trading_enabled.load(Ordering::SeqCst)
    }

    pub fn backfill_status(&self) -> BackfillStatus {
        self.progress.snapshot()
    }

    pub fn metrics_precision(&self) -> MetricsPrecision {
        let snapshot = self.progress.snapshot();
        if snapshot.state.is_success_equivalent() {
            MetricsPrecision::Precise
        } else {
            MetricsPrecision::Imprecise {
                backfill_pct: (snapshot.progress_fraction() * 100.0) as u8,
            }
        }
    }

    pub fn live_health(&self) -> SourceHealth {
        self.live_health.snapshot()
    }

    /// Main levels-and-stats snapshot, built under one read lock so the
    /// numbers are mutually consistent.
    pub fn context_snapshot(&self, mode: VwapMode) -> ContextSnapshot {
        let acc = self.acc.read();
        let day = acc.day();
        ContextSnapshot {
            symbol: self.config.symbol.clone(),
            session_date: day.date.to_string(),
            server_time: Utc::now().timestamp_millis(),
            vwap: acc.vwap(mode),
            vwap_mode: match mode {
                VwapMode::Base => "base",
                VwapMode::Quote => "quote",
            },
            poc: day.profile.poc(),
            previous_day: acc.previous().cloned(),
            opening_range: OpeningRangeSnapshot {
                high: day.opening_range.high,
                low: day.opening_range.low,
                start_ts: day.opening_range.start_ms,
                end_ts: day.opening_range.end_ms,
            },
            day_high: day.day_high,
            day_low: day.day_low,
            range_today: day.day_range(),
            cumulative_delta: day.cumulative_delta(),
            last_price: acc.last_price(),
            trade_count: day.trade_count,
            precision: self.metrics_precision().to_string(),
        }
    }

    pub fn debug_vwap(&self) -> DebugVwap {
        let acc = self.acc.read();
        let day = acc.day();
        DebugVwap {
            sum_price_qty: day.vwap.sum_price_qty,
            sum_qty: day.vwap.sum_qty,
            trade_count: day.trade_count,
            first_trade: day.first_trade.clone().map(TradeCheckpoint::from),
            last_trade: day.last_trade.clone().map(TradeCheckpoint::from),
        }
    }

    pub fn debug_poc(&self) -> DebugPoc {
        let acc = self.acc.read();
        let day = acc.day();
        DebugPoc {
            tick_size: acc.tick(),
            poc: day.profile.poc(),
            top_bins: day
                .profile
                .top_bins(10)
                .into_iter()
                .map(|(price, volume)| BinRow { price, volume })
                .collect(),
        }
    }

    pub fn debug_trades(&self) -> DebugTrades {
        let acc = self.acc.read();
        let day = acc.day();
        DebugTrades {
            trade_count: day.trade_count,
            trades_from_backfill: day.trades_from_backfill,
            trades_from_live: day.trades_from_live,
            live_trades_rejected: day.live_trades_rejected,
            buffered_live: self
                .live_buffer
                .lock()
                .as_ref()
                .map(VecDeque::len)
                .unwrap_or(0),
            backfill_enabled: self.config.backfill_enabled,
            disable_live_data: self.config.disable_live_data,
            data_source: self.config.data_source.to_string(),
        }
    }

    pub fn debug_exchange_info(&self) -> serde_json::Value {
        serde_json::json!({
            "symbol": self.config.symbol,
            "tick_size": self.acc.read().tick(),
            "filters": *self.filters.read(),
            "authenticated": self.client.is_authenticated(),
            "circuit_breaker": self.breaker.snapshot(),
        })
    }

    pub fn health(&self) -> HealthResponse {
        let backfill = self.progress.snapshot();
        let degraded = !backfill.state.is_success_equivalent();
        HealthResponse {
            status: if degraded { "degraded" } else { "ok" },
            backfill_status: backfill.state,
            backfill_complete: backfill.state.is_success_equivalent(),
        }
    }

    pub fn ready(&self) -> ReadyResponse {
        let acc = self.acc.read();
        ReadyResponse {
            symbol: self.config.symbol.clone(),
            session_date: acc.day().date.to_string(),
            trading_enabled: self.trading_enabled(),
            backfill: self.progress.snapshot(),
            metrics_precision: self.metrics_precision().to_string(),
            live: self.live_health.snapshot(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct OpeningRangeSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,
    pub start_ts: i64,
    pub end_ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub symbol: String,
    pub session_date: String,
    pub server_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vwap: Option<Decimal>,
    pub vwap_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poc: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_day: Option<PreviousDayLevels>,
    pub opening_range: OpeningRangeSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_high: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_low: Option<Decimal>,
    pub range_today: Decimal,
    pub cumulative_delta: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<Decimal>,
    pub trade_count: u64,
    pub precision: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeCheckpoint {
    pub ts_ms: i64,
    pub trade_id: String,
}

impl From<(i64, TradeId)> for TradeCheckpoint {
    fn from((ts_ms, id): (i64, TradeId)) -> Self {
        Self {
            ts_ms,
            trade_id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugVwap {
    pub sum_price_qty: Decimal,
    pub sum_qty: Decimal,
    pub trade_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_trade: Option<TradeCheckpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade: Option<TradeCheckpoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BinRow {
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugPoc {
    pub tick_size: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poc: Option<Decimal>,
    pub top_bins: Vec<BinRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugTrades {
    pub trade_count: u64,
    pub trades_from_backfill: u64,
    pub trades_from_live: u64,
    pub live_trades_rejected: u64,
    pub buffered_live: usize,
    pub backfill_enabled: bool,
    pub disable_live_data: bool,
    pub data_source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backfill_status: BackfillState,
    pub backfill_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadyResponse {
    pub symbol: String,
    pub session_date: String,
    pub trading_enabled: bool,
    pub backfill: BackfillStatus,
    pub metrics_precision: String,
    pub live: SourceHealth,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_engine(disable_live: bool, backfill_enabled: bool) -> Arc<ContextEngine> {
        let mut config = EngineConfig::default();
        config.disable_live_data = disable_live;
        config.backfill_enabled = backfill_enabled;
        config.cache_enabled = false;
        ContextEngine::build(config, dec!(0.1), None)
    }

    fn trade_at(offset_ms: i64, id: i64, price: Decimal) -> Trade {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        Trade {
            ts_ms: midnight + offset_ms,
            id: TradeId::Int(id),
            price,
            qty: dec!(1),
            is_buyer_maker: false,
        }
    }

    #[test]
    fn live_trades_buffer_until_backfill_completes() {
        let engine = test_engine(false, true);

        // Live trades arrive while backfill is pending.
        engine.handle_live_trade(trade_at(10_000, 5, dec!(100.0)));
        engine.handle_live_trade(trade_at(11_000, 6, dec!(100.1)));
        assert_eq!(engine.acc.read().day().trade_count, 0);
        assert_eq!(engine.debug_trades().buffered_live, 2);

        // Backfill covers ids 1..=5; id 5 overlaps the buffered set.
        let backfill: Vec<Trade> = (1..=5)
            .map(|i| trade_at(i * 1000, i, dec!(100.0)))
            .collect();
        engine.complete_backfill(&backfill);

        let dbg = engine.debug_trades();
        assert_eq!(dbg.trades_from_backfill, 5);
        // Only id 6 survives the high-water dedup.
        assert_eq!(dbg.trades_from_live, 1);
        assert_eq!(dbg.buffered_live, 0);
        assert!(engine.trading_enabled());
        assert_eq!(engine.backfill_status().state, BackfillState::Complete);
    }

    #[test]
    fn reconnect_replays_are_dropped() {
        let engine = test_engine(false, false);
        engine.spawn_backfill_task_sync_for_tests();

        engine.handle_live_trade(trade_at(1000, 10, dec!(100.0)));
        engine.handle_live_trade(trade_at(2000, 11, dec!(100.1)));
        // A reconnect replays id 11 and an older id.
        engine.handle_live_trade(trade_at(2000, 11, dec!(100.1)));
        engine.handle_live_trade(trade_at(1000, 10, dec!(100.0)));
        engine.handle_live_trade(trade_at(3000, 12, dec!(100.2)));

        assert_eq!(engine.acc.read().day().trade_count, 3);
    }

    #[test]
    fn disabled_backfill_enables_trading_immediately() {
        let engine = test_engine(false, false);
        engine.spawn_backfill_task_sync_for_tests();

        assert_eq!(engine.backfill_status().state, BackfillState::Disabled);
        assert!(engine.trading_enabled());
        assert_eq!(
            engine.metrics_precision().to_string(),
            MetricsPrecision::Precise.to_string()
        );

        // Live trades flow straight into the accumulator.
        engine.handle_live_trade(trade_at(1000, 1, dec!(100.0)));
        assert_eq!(engine.acc.read().day().trades_from_live, 1);
    }

    #[test]
    fn failed_backfill_leaves_metrics_imprecise_but_live_flowing() {
        let engine = test_engine(false, true);
        engine.handle_live_trade(trade_at(1000, 1, dec!(100.0)));

        engine.progress.begin(4);
        engine.progress.record_chunk_done(10);
        engine.progress.fail("exchange unreachable".into());
        engine.finish_ingest_boundary();

        // Buffered trade was replayed despite the failure.
        assert_eq!(engine.acc.read().day().trades_from_live, 1);
        assert!(matches!(
            engine.metrics_precision(),
            MetricsPrecision::Imprecise { backfill_pct: 25 }
        ));
        assert_eq!(engine.health().status, "degraded");

        engine.handle_live_trade(trade_at(2000, 2, dec!(100.1)));
        assert_eq!(engine.acc.read().day().trades_from_live, 2);
    }

    #[test]
    fn context_snapshot_is_internally_consistent() {
        let engine = test_engine(false, true);
        let backfill: Vec<Trade> = vec![
            trade_at(8 * 3_600_000, 1, dec!(100.0)),
            trade_at(8 * 3_600_000 + 60_000, 2, dec!(100.1)),
            trade_at(8 * 3_600_000 + 120_000, 3, dec!(100.2)),
            trade_at(8 * 3_600_000 + 180_000, 4, dec!(100.1)),
            trade_at(8 * 3_600_000 + 240_000, 5, dec!(100.0)),
        ];
        engine.complete_backfill(&backfill);

        let snap = engine.context_snapshot(VwapMode::Base);
        assert_eq!(snap.vwap, Some(dec!(100.08)));
        assert_eq!(snap.opening_range.high, Some(dec!(100.2)));
        assert_eq!(snap.opening_range.low, Some(dec!(100.0)));
        assert_eq!(snap.range_today, dec!(0.2));
        assert_eq!(snap.trade_count, 5);
        assert_eq!(snap.precision, "PRECISE");

        let dbg = engine.debug_vwap();
        assert_eq!(dbg.sum_qty, dec!(5));
        assert_eq!(dbg.sum_price_qty, dec!(500.4));
        assert_eq!(dbg.first_trade.unwrap().trade_id, "1");
        assert_eq!(dbg.last_trade.unwrap().trade_id, "5");
    }

    #[test]
    fn debug_poc_orders_top_bins() {
        let engine = test_engine(false, true);
        let backfill: Vec<Trade> = vec![
            trade_at(1000, 1, dec!(100.0)),
            trade_at(2000, 2, dec!(100.1)),
            trade_at(3000, 3, dec!(100.1)),
            trade_at(4000, 4, dec!(100.2)),
        ];
        engine.complete_backfill(&backfill);

        let dbg = engine.debug_poc();
        assert_eq!(dbg.tick_size, dec!(0.1));
        assert_eq!(dbg.poc, Some(dec!(100.1)));
        assert_eq!(dbg.top_bins[0].price, dec!(100.1));
        assert_eq!(dbg.top_bins[0].volume, dec!(2));
        assert_eq!(dbg.top_bins.len(), 3);
    }

    #[test]
    fn health_reflects_backfill_state() {
        let engine = test_engine(false, true);
        assert_eq!(engine.health().status, "degraded");
        engine.complete_backfill(&[]);
        let health = engine.health();
        assert_eq!(health.status, "ok");
        assert!(health.backfill_complete);
    }

    impl ContextEngine {
        /// Test helper: run the synchronous part of the backfill decision
        /// without spawning tasks (no tokio runtime in unit tests).
        fn spawn_backfill_task_sync_for_tests(&self) {
            if !self.config.backfill_enabled {
                self.progress.set_state(BackfillState::Disabled);
                self.finish_ingest_boundary();
            }
        }
    }
}
