// =============================================================================
// Historical fetcher: chunked, paginated, rate-limit-aware trade downloads
// =============================================================================
//
// The requested [start, end) window is split into fixed-size chunks that a
// bounded worker pool downloads in parallel. Every request passes through the
// shared circuit breaker; rate-limit errors shrink the pool and eventually
// pause all traffic for the cooldown. Failed chunks are skipped, not fatal: a
// partial backfill is preferable to none.
//
// Pagination within a chunk advances the cursor to `last_batch_ts + 1`; the
// same trade is never requested twice.
// =============================================================================

use std::sync::Arc;

use chrono::NaiveDate;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::binance::{CircuitBreaker, TradesApi};
use crate::config::BackfillSettings;
use crate::errors::EngineError;
use crate::types::{Trade, TradeId};

use super::{BackfillProgress, TradeCache};

/// Below this total span the chunk pool is skipped and the window is fetched
/// serially.
const SINGLE_FETCH_SPAN_MS: i64 = 30 * 60 * 1000;

/// A cached day whose tail is within this distance of the requested end is
/// considered complete.
const CACHE_FRESH_EPSILON_MS: i64 = 1_000;

/// Half-open download window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Split `[start, end)` into `chunk_minutes`-sized windows.
fn build_chunks(start_ms: i64, end_ms: i64, chunk_minutes: i64) -> Vec<ChunkWindow> {
    let step = chunk_minutes.max(1) * 60_000;
    let mut chunks = Vec::new();
    let mut cursor = start_ms;
    while cursor < end_ms {
        let chunk_end = (cursor + step).min(end_ms);
        chunks.push(ChunkWindow {
            start_ms: cursor,
            end_ms: chunk_end,
        });
        cursor = chunk_end;
    }
    chunks
}

/// Dedup by trade id (first occurrence wins) and sort by `(ts, id)`.
fn dedup_sort(trades: Vec<Trade>) -> Vec<Trade> {
    let mut by_id: std::collections::BTreeMap<TradeId, Trade> = std::collections::BTreeMap::new();
    for t in trades {
        by_id.entry(t.id.clone()).or_insert(t);
    }
    let mut out: Vec<Trade> = by_id.into_values().collect();
    out.sort_by(|a, b| a.ts_ms.cmp(&b.ts_ms).then_with(|| a.id.cmp(&b.id)));
    out
}

/// ±20 % jitter around `base`.
fn with_jitter(base: std::time::Duration) -> std::time::Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(factor)
}

pub struct HistoricalFetcher {
    api: Arc<dyn TradesApi>,
    breaker: Arc<CircuitBreaker>,
    cache: Option<Arc<TradeCache>>,
    settings: BackfillSettings,
    progress: Arc<BackfillProgress>,
}

impl HistoricalFetcher {
    pub fn new(
        api: Arc<dyn TradesApi>,
        breaker: Arc<CircuitBreaker>,
        cache: Option<Arc<TradeCache>>,
        settings: BackfillSettings,
        progress: Arc<BackfillProgress>,
    ) -> Self {
        Self {
            api,
            breaker,
            cache,
            settings,
            progress,
        }
    }

    // -------------------------------------------------------------------------
    // Cache-aware entry point
    // -------------------------------------------------------------------------

    /// Download `[start_ms, end_ms)` for `date`, resuming from the cache file
    /// when one exists. The merged result is written back and returned sorted
    /// by `(ts, id)` with unique ids.
    pub async fn backfill_with_cache(
        &self,
        date: NaiveDate,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Trade>, EngineError> {
        let Some(cache) = &self.cache else {
            return self.fetch_range(start_ms, end_ms).await;
        };

        let cached = match cache.load(date) {
            Ok(v) => v,
            Err(e @ EngineError::CacheCorrupt { .. }) => {
                error!(error = %e, "cache corrupt, falling back to full backfill");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        if cached.is_empty() {
            let fetched = self.fetch_range(start_ms, end_ms).await?;
            cache.append_and_dedup(date, &fetched)?;
            return Ok(fetched);
        }

        let last_cached_ts = cached.iter().map(|t| t.ts_ms).max().unwrap_or(start_ms);
        if last_cached_ts >= end_ms - CACHE_FRESH_EPSILON_MS {
            info!(
                rows = cached.len(),
                last_cached_ts, "cache already covers the requested window"
            );
            return Ok(dedup_sort(cached));
        }

        info!(
            rows = cached.len(),
            resume_from = last_cached_ts + 1,
            "resuming backfill from cache"
        );
        let fetched = self.fetch_range(last_cached_ts + 1, end_ms).await?;
        cache.append_and_dedup(date, &fetched)?;

        let mut merged = cached;
        merged.extend(fetched);
        Ok(dedup_sort(merged))
    }

    // -------------------------------------------------------------------------
    // Range download
    // -------------------------------------------------------------------------

    /// Download `[start_ms, end_ms)` without touching the cache. Short spans
    /// go through a single serial fetch; longer spans use the chunk pool.
    pub async fn fetch_range(&self, start_ms: i64, end_ms: i64) -> Result<Vec<Trade>, EngineError> {
        if end_ms <= start_ms {
            return Ok(Vec::new());
        }

        if end_ms - start_ms < SINGLE_FETCH_SPAN_MS || self.settings.test_mode {
            self.progress.begin(1);
            let window = ChunkWindow {
                start_ms,
                end_ms,
            };
            let result = fetch_chunk(
                self.api.clone(),
                self.breaker.clone(),
                self.settings.clone(),
                window,
            )
            .await;
            return match result {
                Ok(trades) => {
                    self.progress.record_chunk_done(trades.len());
                    Ok(dedup_sort(trades))
                }
                Err(e) => {
                    self.progress.record_chunk_failed();
                    Err(e)
                }
            };
        }

        let chunks = build_chunks(start_ms, end_ms, self.settings.chunk_minutes);
        self.progress.begin(chunks.len());
        info!(
            chunks = chunks.len(),
            start_ms,
            end_ms,
            concurrency = self.breaker.concurrency(),
            "parallel backfill starting"
        );

        let mut collected: Vec<Trade> = Vec::new();
        let mut pending = chunks.into_iter();
        let mut next = pending.next();
        let mut in_flight: JoinSet<Result<Vec<Trade>, EngineError>> = JoinSet::new();

        loop {
            // Keep the pool filled up to the breaker's current width; rate
            // errors shrink it mid-run.
            while next.is_some() && in_flight.len() < self.breaker.concurrency() {
                let window = next.take().unwrap();
                next = pending.next();
                let api = self.api.clone();
                let breaker = self.breaker.clone();
                let settings = self.settings.clone();
                in_flight.spawn(async move { fetch_chunk(api, breaker, settings, window).await });
            }

            match in_flight.join_next().await {
                Some(Ok(Ok(trades))) => {
                    self.progress.record_chunk_done(trades.len());
                    collected.extend(trades);
                }
                Some(Ok(Err(e))) => {
                    warn!(error = %e, "chunk failed, skipping");
                    self.progress.record_chunk_failed();
                }
                Some(Err(join_err)) => {
                    warn!(error = %join_err, "chunk worker panicked, skipping");
                    self.progress.record_chunk_failed();
                }
                None => {
                    if next.is_none() {
                        break;
                    }
                }
            }
        }

        let merged = dedup_sort(collected);
        info!(trades = merged.len(), "parallel backfill finished");
        Ok(merged)
    }
}

// -----------------------------------------------------------------------------
// Single-chunk pagination
// -----------------------------------------------------------------------------

async fn fetch_chunk(
    api: Arc<dyn TradesApi>,
    breaker: Arc<CircuitBreaker>,
    settings: BackfillSettings,
    window: ChunkWindow,
) -> Result<Vec<Trade>, EngineError> {
    let mut cursor = window.start_ms;
    let mut out: Vec<Trade> = Vec::new();
    let mut iterations = 0u32;

    loop {
        iterations += 1;
        if iterations > settings.max_iterations_per_chunk {
            error!(
                start_ms = window.start_ms,
                end_ms = window.end_ms,
                iterations,
                "pagination cap reached, stopping chunk early"
            );
            break;
        }

        let batch = request_with_retry(&api, &breaker, &settings, cursor, window.end_ms).await?;
        if batch.is_empty() {
            break;
        }

        let batch_len = batch.len();
        let last_ts = batch.iter().map(|t| t.ts_ms).max().unwrap_or(cursor);
        out.extend(batch);

        // Cursor rule: one past the last seen timestamp. Anything else either
        // refetches trades or crawls one millisecond at a time.
        cursor = last_ts + 1;

        if batch_len < settings.page_limit || cursor >= window.end_ms {
            break;
        }
    }

    debug!(
        start_ms = window.start_ms,
        end_ms = window.end_ms,
        trades = out.len(),
        pages = iterations,
        "chunk complete"
    );
    Ok(out)
}

async fn request_with_retry(
    api: &Arc<dyn TradesApi>,
    breaker: &Arc<CircuitBreaker>,
    settings: &BackfillSettings,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<Trade>, EngineError> {
    let mut attempt = 0u32;

    loop {
        breaker.wait_ready().await;

        let delay = breaker.request_delay(settings.base_delay(api.is_authenticated()));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match api.agg_trades(start_ms, end_ms, settings.page_limit).await {
            Ok(batch) => {
                breaker.record_success();
                return Ok(batch);
            }
            Err(e) if e.is_rate_limited() => {
                let tripped = breaker.record_rate_error();
                if tripped && api.is_authenticated() {
                    api.demote_to_public();
                    warn!("rate-limit trip while authenticated, continuing in public mode");
                }
                attempt += 1;
                if attempt > settings.max_retries {
                    return Err(e);
                }
                // The breaker's cooldown gate paces the retry; no extra sleep.
            }
            Err(e) if e.is_auth_failure() => {
                if api.demote_to_public() {
                    warn!(error = %e, "auth failure, re-queueing request in public mode");
                    continue;
                }
                return Err(e);
            }
            Err(e @ EngineError::Transient(_)) => {
                attempt += 1;
                if attempt > settings.max_retries {
                    return Err(e);
                }
                let backoff =
                    with_jitter(settings.retry_base() * 2u32.saturating_pow(attempt - 1));
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "transient error, backing off");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn settings() -> BackfillSettings {
        crate::config::EngineConfig::default().backfill
    }

    fn breaker(settings: &BackfillSettings, concurrency: usize) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            settings.rate_limit_threshold,
            settings.cooldown(),
            concurrency,
        ))
    }

    fn progress() -> Arc<BackfillProgress> {
        Arc::new(BackfillProgress::new())
    }

    fn trade(ts: i64, id: i64) -> Trade {
        Trade {
            ts_ms: ts,
            id: TradeId::Int(id),
            price: dec!(100),
            qty: dec!(1),
            is_buyer_maker: false,
        }
    }

    /// In-memory exchange with a fixed trade tape, request recording, and an
    /// optional run of initial rate-limit failures.
    struct MockApi {
        tape: Vec<Trade>,
        calls: Mutex<Vec<(i64, i64)>>,
        rate_limit_first: AtomicU32,
        auth_fail_while_authenticated: bool,
        authenticated: AtomicBool,
    }

    impl MockApi {
        fn new(tape: Vec<Trade>) -> Self {
            Self {
                tape,
                calls: Mutex::new(Vec::new()),
                rate_limit_first: AtomicU32::new(0),
                auth_fail_while_authenticated: false,
                authenticated: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> Vec<(i64, i64)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl TradesApi for MockApi {
        async fn agg_trades(
            &self,
            start_ms: i64,
            end_ms: i64,
            limit: usize,
        ) -> Result<Vec<Trade>, EngineError> {
            self.calls.lock().push((start_ms, end_ms));

            if self.rate_limit_first.load(Ordering::SeqCst) > 0 {
                self.rate_limit_first.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::RateLimited { status: 429 });
            }

            if self.auth_fail_while_authenticated && self.is_authenticated() {
                return Err(EngineError::AuthFailure { status: 401 });
            }

            Ok(self
                .tape
                .iter()
                .filter(|t| t.ts_ms >= start_ms && t.ts_ms < end_ms)
                .take(limit)
                .cloned()
                .collect())
        }

        fn is_authenticated(&self) -> bool {
            self.authenticated.load(Ordering::SeqCst)
        }

        fn demote_to_public(&self) -> bool {
            self.authenticated.swap(false, Ordering::SeqCst)
        }
    }

    #[test]
    fn chunking_covers_the_window_exactly() {
        let chunks = build_chunks(0, 3_600_000, 10);
        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks[0], ChunkWindow { start_ms: 0, end_ms: 600_000 });
        assert_eq!(chunks[5].end_ms, 3_600_000);

        // Remainder window stays half-open and short.
        let chunks = build_chunks(0, 1_500_000, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], ChunkWindow { start_ms: 1_200_000, end_ms: 1_500_000 });
    }

    #[test]
    fn dedup_sort_orders_and_uniques() {
        let trades = vec![trade(30, 3), trade(10, 1), trade(20, 2), trade(10, 1)];
        let out = dedup_sort(trades);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].id, TradeId::Int(1));
        assert_eq!(out[2].id, TradeId::Int(3));
    }

    #[tokio::test(start_paused = true)]
    async fn pagination_cursor_advances_past_last_timestamp() {
        // 2,500 trades, one per millisecond: three pages at limit 1000.
        let tape: Vec<Trade> = (0..2500).map(|i| trade(i, i)).collect();
        let api = Arc::new(MockApi::new(tape));
        let s = settings();
        let fetcher = HistoricalFetcher::new(
            api.clone(),
            breaker(&s, 1),
            None,
            s.clone(),
            progress(),
        );

        // Span below the parallel threshold: serial single-chunk path.
        let out = fetcher.fetch_range(0, 2500).await.unwrap();
        assert_eq!(out.len(), 2500);

        let calls = api.calls();
        assert_eq!(calls.len(), 3);
        // Page 1 covered [0, 2500) and ended at ts 999.
        assert_eq!(calls[0].0, 0);
        // Cursor law: next startTime is one past the page's last timestamp.
        assert_eq!(calls[1].0, 1000);
        assert_eq!(calls[2].0, 2000);

        // No duplicates despite overlapping request windows.
        let ids: std::collections::BTreeSet<&TradeId> = out.iter().map(|t| &t.id).collect();
        assert_eq!(ids.len(), 2500);
    }

    #[tokio::test(start_paused = true)]
    async fn short_final_page_terminates_chunk() {
        let tape: Vec<Trade> = (0..1200).map(|i| trade(i, i)).collect();
        let api = Arc::new(MockApi::new(tape));
        let s = settings();
        let fetcher =
            HistoricalFetcher::new(api.clone(), breaker(&s, 1), None, s, progress());

        let out = fetcher.fetch_range(0, 10_000).await.unwrap();
        assert_eq!(out.len(), 1200);
        // Two pages: 1000 rows, then 200 (< limit, so the chunk ends).
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_storm_opens_breaker_then_recovers() {
        let tape: Vec<Trade> = (0..500).map(|i| trade(i, i)).collect();
        let api = Arc::new(MockApi::new(tape));
        api.rate_limit_first.store(3, Ordering::SeqCst);

        let s = settings();
        let b = breaker(&s, 4);
        let fetcher =
            HistoricalFetcher::new(api.clone(), b.clone(), None, s, progress());

        // The first three requests 429; the breaker opens at the threshold,
        // waits out the (auto-advanced) cooldown, and the HALF_OPEN probe
        // succeeds. The final set must still be complete and deduplicated.
        let out = fetcher.fetch_range(0, 500).await.unwrap();
        assert_eq!(out.len(), 500);

        let snap = b.snapshot();
        assert_eq!(snap.state, crate::binance::circuit::BreakerState::Closed);
        assert_eq!(snap.consecutive_rate_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_degrades_to_public_once() {
        let tape: Vec<Trade> = (0..10).map(|i| trade(i, i)).collect();
        let mut mock = MockApi::new(tape);
        mock.auth_fail_while_authenticated = true;
        mock.authenticated.store(true, Ordering::SeqCst);
        let api = Arc::new(mock);

        let s = settings();
        let fetcher =
            HistoricalFetcher::new(api.clone(), breaker(&s, 1), None, s, progress());

        let out = fetcher.fetch_range(0, 10).await.unwrap();
        assert_eq!(out.len(), 10);
        assert!(!api.is_authenticated());
        // One failed authenticated call, one public re-queue.
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_range_is_deduplicated_and_complete() {
        // Two hours of sparse trades crosses the parallel threshold.
        let tape: Vec<Trade> = (0..720).map(|i| trade(i * 10_000, i)).collect();
        let api = Arc::new(MockApi::new(tape));
        let s = settings();
        let prog = progress();
        let fetcher =
            HistoricalFetcher::new(api.clone(), breaker(&s, 4), None, s, prog.clone());

        let out = fetcher.fetch_range(0, 7_200_000).await.unwrap();
        assert_eq!(out.len(), 720);
        assert!(out.windows(2).all(|w| (w[0].ts_ms, &w[0].id) < (w[1].ts_ms, &w[1].id)));

        let snap = prog.snapshot();
        assert_eq!(snap.chunks_total, 12);
        assert_eq!(snap.chunks_done, 12);
        assert_eq!(snap.chunks_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_rate_limits_skip_the_chunk() {
        let tape: Vec<Trade> = (0..100).map(|i| trade(i, i)).collect();
        let api = Arc::new(MockApi::new(tape));
        // More failures than max_retries allows.
        api.rate_limit_first.store(50, Ordering::SeqCst);

        let s = settings();
        let prog = progress();
        let fetcher =
            HistoricalFetcher::new(api.clone(), breaker(&s, 1), None, s, prog.clone());

        // Serial path: the lone chunk exhausts retries and fails.
        let result = fetcher.fetch_range(0, 100).await;
        assert!(result.is_err());
        assert_eq!(prog.snapshot().chunks_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_with_cache_resumes_from_gap() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(TradeCache::new(dir.path()));
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        // Cache holds ids 0..100 up to ts 99_900.
        let cached: Vec<Trade> = (0..100).map(|i| trade(i * 1000 + 900, i)).collect();
        cache.append_and_dedup(date, &cached).unwrap();

        // The tape also has later trades the fetch must pick up.
        let tape: Vec<Trade> = (0..160).map(|i| trade(i * 1000 + 900, i)).collect();
        let api = Arc::new(MockApi::new(tape));
        let s = settings();
        let fetcher = HistoricalFetcher::new(
            api.clone(),
            breaker(&s, 1),
            Some(cache.clone()),
            s,
            progress(),
        );

        let out = fetcher.backfill_with_cache(date, 0, 160_000).await.unwrap();
        assert_eq!(out.len(), 160);

        // The fetch must start exactly one past the cached tail.
        let calls = api.calls();
        assert_eq!(calls[0].0, 99_900 + 1);

        // Merged cache file has no duplicate ids.
        let reloaded = cache.load(date).unwrap();
        assert_eq!(reloaded.len(), 160);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_short_circuits_the_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(TradeCache::new(dir.path()));
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let cached: Vec<Trade> = (0..10).map(|i| trade(99_000 + i, i)).collect();
        cache.append_and_dedup(date, &cached).unwrap();

        let api = Arc::new(MockApi::new(Vec::new()));
        let s = settings();
        let fetcher = HistoricalFetcher::new(
            api.clone(),
            breaker(&s, 1),
            Some(cache),
            s,
            progress(),
        );

        // Requested end is within the freshness epsilon of the cached tail.
        let out = fetcher.backfill_with_cache(date, 0, 100_000).await.unwrap();
        assert_eq!(out.len(), 10);
        assert!(api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cache_triggers_full_fetch_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(TradeCache::new(dir.path()));
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let tape: Vec<Trade> = (0..20).map(|i| trade(i, i)).collect();
        let api = Arc::new(MockApi::new(tape));
        let s = settings();
        let fetcher = HistoricalFetcher::new(
            api,
            breaker(&s, 1),
            Some(cache.clone()),
            s,
            progress(),
        );

        let out = fetcher.backfill_with_cache(date, 0, 20).await.unwrap();
        assert_eq!(out.len(), 20);
        assert_eq!(cache.load(date).unwrap().len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_cap_stops_runaway_pagination() {
        struct EndlessApi;

        #[async_trait]
        impl TradesApi for EndlessApi {
            async fn agg_trades(
                &self,
                start_ms: i64,
                _end_ms: i64,
                limit: usize,
            ) -> Result<Vec<Trade>, EngineError> {
                // Always a full page starting at the cursor.
                Ok((0..limit as i64)
                    .map(|i| trade(start_ms + i, start_ms + i))
                    .collect())
            }

            fn is_authenticated(&self) -> bool {
                false
            }

            fn demote_to_public(&self) -> bool {
                false
            }
        }

        let mut s = settings();
        s.max_iterations_per_chunk = 3;
        let fetcher = HistoricalFetcher::new(
            Arc::new(EndlessApi),
            breaker(&s, 1),
            None,
            s.clone(),
            progress(),
        );

        // The window is enormous, but the cap bounds the work.
        let out = fetcher.fetch_range(0, 1_000_000).await.unwrap();
        assert_eq!(out.len(), 3 * s.page_limit);
    }
}
