// =============================================================================
// REST polling live source
// =============================================================================
//
// Fallback connector for environments without WebSocket access: polls the
// aggregated-trades endpoint once per second and replays the new rows in
// order. Duplicate suppression keys on the trade id so an overlapping poll
// window never double-delivers.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::binance::TradesApi;
use crate::types::{Trade, TradeId};

use super::{Channel, LiveEvent, LiveSource, SourceHealth};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const POLL_PAGE_LIMIT: usize = 1000;

pub struct RestPollSource {
    api: Arc<dyn TradesApi>,
    poll_interval: Duration,
    buffer: VecDeque<Trade>,
    /// Next poll fetches from this timestamp.
    cursor_ts: i64,
    last_id: Option<TradeId>,
    connected: bool,
    error_count: u64,
    reconnects: u64,
    last_event: Option<Instant>,
}

impl RestPollSource {
    pub fn new(api: Arc<dyn TradesApi>) -> Self {
        Self {
            api,
            poll_interval: DEFAULT_POLL_INTERVAL,
            buffer: VecDeque::new(),
            cursor_ts: 0,
            last_id: None,
            connected: false,
            error_count: 0,
            reconnects: 0,
            last_event: None,
        }
    }

    #[cfg(test)]
    fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl LiveSource for RestPollSource {
    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            self.reconnects += 1;
        }
        // Only trades after the connect instant are "live"; older ones belong
        // to the backfill.
        if self.cursor_ts == 0 {
            self.cursor_ts = Utc::now().timestamp_millis();
        }
        self.connected = true;
        info!(from_ts = self.cursor_ts, "REST polling source started");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn subscribe(&mut self, _channels: &[Channel]) -> Result<()> {
        // The poll endpoint only carries trades; channel selection is a no-op.
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<LiveEvent>> {
        if !self.connected {
            return Ok(None);
        }

        loop {
            if let Some(trade) = self.buffer.pop_front() {
                self.last_event = Some(Instant::now());
                return Ok(Some(LiveEvent::Trade(trade)));
            }

            tokio::time::sleep(self.poll_interval).await;

            let now_ms = Utc::now().timestamp_millis();
            if now_ms <= self.cursor_ts {
                continue;
            }

            let api = self.api.clone();
            let batch = match api.agg_trades(self.cursor_ts, now_ms, POLL_PAGE_LIMIT).await {
                Ok(batch) => batch,
                Err(e) => {
                    self.error_count += 1;
                    self.connected = false;
                    return Err(e.into());
                }
            };

            let mut fresh: Vec<Trade> = batch
                .into_iter()
                .filter(|t| match &self.last_id {
                    Some(last) => t.id > *last,
                    None => true,
                })
                .collect();
            fresh.sort_by(|a, b| a.ts_ms.cmp(&b.ts_ms).then_with(|| a.id.cmp(&b.id)));

            if let Some(last) = fresh.last() {
                self.cursor_ts = last.ts_ms + 1;
                self.last_id = Some(last.id.clone());
            } else {
                self.cursor_ts = now_ms;
            }

            debug!(fresh = fresh.len(), next_from = self.cursor_ts, "poll cycle");
            self.buffer.extend(fresh);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn health(&self) -> SourceHealth {
        SourceHealth {
            connected: self.connected,
            reconnects: self.reconnects,
            error_count: self.error_count,
            seconds_since_last_event: self.last_event.map(|t| t.elapsed().as_secs()),
            queue_size: self.buffer.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    fn trade(ts: i64, id: i64) -> Trade {
        Trade {
            ts_ms: ts,
            id: TradeId::Int(id),
            price: dec!(50),
            qty: dec!(1),
            is_buyer_maker: false,
        }
    }

    /// Tape that grows between polls; windows overlap on purpose.
    struct GrowingTape {
        tape: Mutex<Vec<Trade>>,
        fail_next: Mutex<bool>,
    }

    #[async_trait]
    impl TradesApi for GrowingTape {
        async fn agg_trades(
            &self,
            start_ms: i64,
            end_ms: i64,
            limit: usize,
        ) -> Result<Vec<Trade>, EngineError> {
            if std::mem::take(&mut *self.fail_next.lock()) {
                return Err(EngineError::Transient("poll failed".into()));
            }
            Ok(self
                .tape
                .lock()
                .iter()
                .filter(|t| t.ts_ms >= start_ms && t.ts_ms < end_ms)
                .take(limit)
                .cloned()
                .collect())
        }

        fn is_authenticated(&self) -> bool {
            false
        }

        fn demote_to_public(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_deliver_trades_in_order_without_duplicates() {
        let now = Utc::now().timestamp_millis();
        let api = Arc::new(GrowingTape {
            tape: Mutex::new(vec![trade(now + 10, 1), trade(now + 20, 2)]),
            fail_next: Mutex::new(false),
        });
        let mut source = RestPollSource::new(api.clone())
            .with_poll_interval(Duration::from_millis(10));
        source.connect().await.unwrap();

        let first = source.next_event().await.unwrap();
        let second = source.next_event().await.unwrap();
        let (Some(LiveEvent::Trade(t1)), Some(LiveEvent::Trade(t2))) = (first, second) else {
            panic!("expected two trades");
        };
        assert_eq!(t1.id, TradeId::Int(1));
        assert_eq!(t2.id, TradeId::Int(2));

        // The tape grows; an overlapping poll window must not re-deliver 1-2.
        api.tape.lock().push(trade(now + 30, 3));
        let third = source.next_event().await.unwrap();
        match third {
            Some(LiveEvent::Trade(t3)) => assert_eq!(t3.id, TradeId::Int(3)),
            other => panic!("expected trade 3, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_error_disconnects_and_propagates() {
        let api = Arc::new(GrowingTape {
            tape: Mutex::new(Vec::new()),
            fail_next: Mutex::new(true),
        });
        let mut source = RestPollSource::new(api)
            .with_poll_interval(Duration::from_millis(10));
        source.connect().await.unwrap();

        assert!(source.next_event().await.is_err());
        assert!(!source.is_connected());
        assert_eq!(source.health().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_source_yields_none() {
        let api = Arc::new(GrowingTape {
            tape: Mutex::new(Vec::new()),
            fail_next: Mutex::new(false),
        });
        let mut source = RestPollSource::new(api);
        assert!(source.next_event().await.unwrap().is_none());
    }
}
