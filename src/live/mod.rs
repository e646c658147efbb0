// =============================================================================
// Live trade sources: trait seam, shared health state, reconnect supervisor
// =============================================================================
//
// The engine only ever talks to `LiveSource`; the WebSocket stream and the
// REST poller are interchangeable implementations, so swapping the exchange
// (or wrapping an external connector) touches nothing above this module.
//
// The supervisor owns everything generic: exponential-backoff reconnection,
// stale detection, the 5 s inspection / 60 s health log cadence, and the
// shutdown path. Every trade it forwards is by definition not from backfill.
// =============================================================================

pub mod binance_ws;
pub mod rest_poll;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::types::Trade;

pub use binance_ws::AggTradeStream;
pub use rest_poll::RestPollSource;

/// Streams a live source can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    AggTrades,
    Depth,
}

/// One event off the wire.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    Trade(Trade),
    Depth {
        best_bid: Decimal,
        best_ask: Decimal,
        ts_ms: i64,
    },
    /// Connection-level notice (subscription ack, ping payloads, ...).
    Status(String),
}

/// Long-lived connection abstraction over an exchange's streaming surface.
#[async_trait]
pub trait LiveSource: Send {
    async fn connect(&mut self) -> anyhow::Result<()>;
    async fn disconnect(&mut self);
    async fn subscribe(&mut self, channels: &[Channel]) -> anyhow::Result<()>;
    /// Next event; `Ok(None)` means the stream ended cleanly.
    async fn next_event(&mut self) -> anyhow::Result<Option<LiveEvent>>;
    fn is_connected(&self) -> bool;
    fn health(&self) -> SourceHealth;
}

/// Serialisable health view of a live source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub connected: bool,
    pub reconnects: u64,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_since_last_event: Option<u64>,
    pub queue_size: usize,
}

// ---------------------------------------------------------------------------
// Shared health state
// ---------------------------------------------------------------------------

/// Lock-free health counters shared between the supervisor (writer) and the
/// readiness endpoints (readers).
pub struct LiveHealth {
    connected: AtomicBool,
    reconnects: AtomicU64,
    error_count: AtomicU64,
    queue_size: AtomicUsize,
    last_event: Mutex<Option<Instant>>,
}

impl LiveHealth {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            queue_size: AtomicUsize::new(0),
            last_event: Mutex::new(None),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_event(&self) {
        *self.last_event.lock() = Some(Instant::now());
    }

    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.store(size, Ordering::Relaxed);
    }

    pub fn seconds_since_last_event(&self) -> Option<u64> {
        self.last_event.lock().map(|t| t.elapsed().as_secs())
    }

    pub fn snapshot(&self) -> SourceHealth {
        SourceHealth {
            connected: self.connected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            seconds_since_last_event: self.seconds_since_last_event(),
            queue_size: self.queue_size.load(Ordering::Relaxed),
        }
    }
}

impl Default for LiveHealth {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Reconnect / stale-detection policy for the supervisor loop.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Attempts per reconnect cycle before escalating.
    pub max_reconnect_attempts: u32,
    /// Silence after which a connected source is declared dead.
    pub stale_after: Duration,
    /// Post-connect grace before stale detection arms.
    pub grace: Duration,
    /// Pause between escalation cycles once attempts are exhausted.
    pub escalation_pause: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            stale_after: Duration::from_secs(60),
            grace: Duration::from_secs(30),
            escalation_pause: Duration::from_secs(30),
        }
    }
}

/// Reconnect backoff: 0.5 s, 1 s, 2 s, 4 s, 8 s with ±20 % jitter.
fn reconnect_backoff(attempt: u32) -> Duration {
    let base = Duration::from_millis(500) * 2u32.saturating_pow(attempt.min(4));
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(factor)
}

/// Inspection tick; also bounds how long shutdown waits on a silent source.
const INSPECT_EVERY: Duration = Duration::from_secs(5);
/// Cadence of the periodic health log line.
const HEALTH_LOG_EVERY: Duration = Duration::from_secs(60);

/// Drive a live source forever: connect, read, reconnect on any failure or
/// staleness, and forward trades into `sink` until shutdown flips.
pub async fn run_supervised(
    mut source: Box<dyn LiveSource>,
    channels: Vec<Channel>,
    health: Arc<LiveHealth>,
    sink: mpsc::Sender<Trade>,
    mut shutdown: watch::Receiver<bool>,
    settings: SupervisorSettings,
) {
    let mut attempt: u32 = 0;
    let mut ever_connected = false;
    let mut last_health_log = Instant::now();

    loop {
        if *shutdown.borrow() {
            source.disconnect().await;
            return;
        }

        // ── Connect phase ───────────────────────────────────────────────
        let connect_result = async {
            source.connect().await?;
            source.subscribe(&channels).await
        }
        .await;

        if let Err(e) = connect_result {
            health.record_error();
            attempt += 1;
            if attempt >= settings.max_reconnect_attempts {
                error!(
                    attempt,
                    error = %e,
                    pause_s = settings.escalation_pause.as_secs(),
                    "reconnect attempts exhausted, escalating"
                );
                attempt = 0;
                tokio::select! {
                    _ = tokio::time::sleep(settings.escalation_pause) => {}
                    _ = shutdown.changed() => {}
                }
            } else {
                let backoff = reconnect_backoff(attempt - 1);
                warn!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {}
                }
            }
            continue;
        }

        health.set_connected(true);
        if ever_connected {
            health.record_reconnect();
        }
        ever_connected = true;
        attempt = 0;
        let connected_at = Instant::now();
        info!("live source connected");

        // ── Read phase ──────────────────────────────────────────────────
        'read: loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    source.disconnect().await;
                    health.set_connected(false);
                    return;
                }
                event = tokio::time::timeout(INSPECT_EVERY, source.next_event()) => {
                    match event {
                        // Inspection tick: no event within 5 s.
                        Err(_) => {
                            let silent_for = health
                                .seconds_since_last_event()
                                .map(Duration::from_secs)
                                .unwrap_or_else(|| connected_at.elapsed());
                            if connected_at.elapsed() > settings.grace
                                && silent_for > settings.stale_after
                            {
                                warn!(
                                    silent_s = silent_for.as_secs(),
                                    "live source stale, forcing reconnect"
                                );
                                source.disconnect().await;
                                break 'read;
                            }
                        }
                        Ok(Ok(Some(LiveEvent::Trade(trade)))) => {
                            health.mark_event();
                            if sink.send(trade).await.is_err() {
                                // Ingest side is gone; nothing left to do.
                                source.disconnect().await;
                                health.set_connected(false);
                                return;
                            }
                        }
                        Ok(Ok(Some(_))) => {
                            health.mark_event();
                        }
                        Ok(Ok(None)) => {
                            warn!("live stream ended");
                            break 'read;
                        }
                        Ok(Err(e)) => {
                            health.record_error();
                            error!(error = %e, "live source read error");
                            source.disconnect().await;
                            break 'read;
                        }
                    }

                    if last_health_log.elapsed() >= HEALTH_LOG_EVERY {
                        last_health_log = Instant::now();
                        let snap = health.snapshot();
                        info!(
                            alive = snap.connected,
                            queue_size = snap.queue_size,
                            error_count = snap.error_count,
                            seconds_since_last_event = snap.seconds_since_last_event,
                            "live source health"
                        );
                    }
                }
            }
        }

        health.set_connected(false);

        // Brief pause before re-dialing so a permanently dead endpoint does
        // not turn into a tight connect loop.
        let pause = reconnect_backoff(0);
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;

    use crate::types::TradeId;

    fn trade(id: i64) -> Trade {
        Trade {
            ts_ms: id,
            id: TradeId::Int(id),
            price: dec!(100),
            qty: dec!(1),
            is_buyer_maker: false,
        }
    }

    /// Scripted source: a queue of events per connection, optional connect
    /// failures.
    struct ScriptedSource {
        connect_failures: u32,
        connections: VecDeque<Vec<LiveEvent>>,
        current: VecDeque<LiveEvent>,
        connected: bool,
        connects: u32,
    }

    impl ScriptedSource {
        fn new(connections: Vec<Vec<LiveEvent>>) -> Self {
            Self {
                connect_failures: 0,
                connections: connections.into_iter().collect(),
                current: VecDeque::new(),
                connected: false,
                connects: 0,
            }
        }
    }

    #[async_trait]
    impl LiveSource for ScriptedSource {
        async fn connect(&mut self) -> anyhow::Result<()> {
            self.connects += 1;
            if self.connect_failures > 0 {
                self.connect_failures -= 1;
                anyhow::bail!("scripted connect failure");
            }
            self.current = self
                .connections
                .pop_front()
                .map(|v| v.into_iter().collect())
                .unwrap_or_default();
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.connected = false;
        }

        async fn subscribe(&mut self, _channels: &[Channel]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn next_event(&mut self) -> anyhow::Result<Option<LiveEvent>> {
            match self.current.pop_front() {
                Some(ev) => Ok(Some(ev)),
                // Stream ends when this connection's script is exhausted.
                None => Ok(None),
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn health(&self) -> SourceHealth {
            SourceHealth {
                connected: self.connected,
                reconnects: 0,
                error_count: 0,
                seconds_since_last_event: None,
                queue_size: 0,
            }
        }
    }

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            max_reconnect_attempts: 3,
            stale_after: Duration::from_secs(60),
            grace: Duration::from_secs(30),
            escalation_pause: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_trades_and_survives_stream_end() {
        let source = ScriptedSource::new(vec![
            vec![LiveEvent::Trade(trade(1)), LiveEvent::Trade(trade(2))],
            vec![LiveEvent::Trade(trade(3))],
        ]);
        let health = Arc::new(LiveHealth::new());
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_supervised(
            Box::new(source),
            vec![Channel::AggTrades],
            health.clone(),
            tx,
            shutdown_rx,
            fast_settings(),
        ));

        // Trades from both connections arrive across the reconnect.
        for expected in [1i64, 2, 3] {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.id, TradeId::Int(expected));
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_backoff_then_succeed() {
        let mut source = ScriptedSource::new(vec![vec![LiveEvent::Trade(trade(7))]]);
        source.connect_failures = 2;
        let health = Arc::new(LiveHealth::new());
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_supervised(
            Box::new(source),
            vec![Channel::AggTrades],
            health.clone(),
            tx,
            shutdown_rx,
            fast_settings(),
        ));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.id, TradeId::Int(7));
        assert!(health.snapshot().error_count >= 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let source = ScriptedSource::new(vec![vec![LiveEvent::Trade(trade(1))]]);
        let health = Arc::new(LiveHealth::new());
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_supervised(
            Box::new(source),
            vec![Channel::AggTrades],
            health,
            tx,
            shutdown_rx,
            fast_settings(),
        ));

        let _ = rx.recv().await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn backoff_schedule_caps_at_eight_seconds() {
        for (attempt, expected_ms) in [(0u32, 500u64), (1, 1000), (2, 2000), (3, 4000), (4, 8000), (9, 8000)] {
            let d = reconnect_backoff(attempt);
            let ms = d.as_millis() as u64;
            // ±20 % jitter band.
            assert!(ms >= expected_ms * 8 / 10, "attempt {attempt}: {ms}ms");
            assert!(ms <= expected_ms * 12 / 10 + 1, "attempt {attempt}: {ms}ms");
        }
    }

    #[test]
    fn health_snapshot_tracks_counters() {
        let h = LiveHealth::new();
        h.set_connected(true);
        h.record_error();
        h.record_reconnect();
        h.set_queue_size(42);
        h.mark_event();
        let snap = h.snapshot();
        assert!(snap.connected);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.queue_size, 42);
        assert_eq!(snap.seconds_since_last_event, Some(0));
    }
}
