// =============================================================================
// Historical backfill: cache store, chunked fetcher, shared progress
// =============================================================================

pub mod cache;
pub mod fetcher;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Instant;

use crate::types::{BackfillState, BackfillStatus};

pub use cache::TradeCache;
pub use fetcher::HistoricalFetcher;

struct ProgressInner {
    state: BackfillState,
    chunks_total: usize,
    chunks_done: usize,
    chunks_failed: usize,
    trades_loaded: u64,
    started_at: Option<(Instant, DateTime<Utc>)>,
    last_error: Option<String>,
}

/// Observable progress of the background backfill task. Shared between the
/// fetcher (writer) and the status endpoints (readers).
pub struct BackfillProgress {
    inner: RwLock<ProgressInner>,
}

impl BackfillProgress {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ProgressInner {
                state: BackfillState::NotStarted,
                chunks_total: 0,
                chunks_done: 0,
                chunks_failed: 0,
                trades_loaded: 0,
                started_at: None,
                last_error: None,
            }),
        }
    }

    pub fn set_state(&self, state: BackfillState) {
        self.inner.write().state = state;
    }

    pub fn state(&self) -> BackfillState {
        self.inner.read().state
    }

    /// Mark the task running over `chunks_total` chunks and stamp the start
    /// time.
    pub fn begin(&self, chunks_total: usize) {
        let mut inner = self.inner.write();
        inner.state = BackfillState::Running;
        inner.chunks_total = chunks_total;
        inner.chunks_done = 0;
        inner.chunks_failed = 0;
        inner.started_at = Some((Instant::now(), Utc::now()));
    }

    pub fn record_chunk_done(&self, trades: usize) {
        let mut inner = self.inner.write();
        inner.chunks_done += 1;
        inner.trades_loaded += trades as u64;
    }

    pub fn record_chunk_failed(&self) {
        let mut inner = self.inner.write();
        inner.chunks_done += 1;
        inner.chunks_failed += 1;
    }

    pub fn fail(&self, message: String) {
        let mut inner = self.inner.write();
        inner.state = BackfillState::Error;
        inner.last_error = Some(message);
    }

    pub fn snapshot(&self) -> BackfillStatus {
        let inner = self.inner.read();

        let eta_seconds = match (inner.started_at, inner.chunks_done, inner.chunks_total) {
            (Some((instant, _)), done, total) if done > 0 && total > done => {
                let per_chunk = instant.elapsed().as_secs_f64() / done as f64;
                Some((per_chunk * (total - done) as f64) as u64)
            }
            _ => None,
        };

        BackfillStatus {
            state: inner.state,
            chunks_total: inner.chunks_total,
            chunks_done: inner.chunks_done,
            chunks_failed: inner.chunks_failed,
            trades_loaded: inner.trades_loaded,
            started_at: inner.started_at.map(|(_, utc)| utc.to_rfc3339()),
            eta_seconds,
            last_error: inner.last_error.clone(),
        }
    }
}

impl Default for BackfillProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let p = BackfillProgress::new();
        assert_eq!(p.state(), BackfillState::NotStarted);

        p.set_state(BackfillState::Pending);
        assert_eq!(p.state(), BackfillState::Pending);

        p.begin(10);
        let snap = p.snapshot();
        assert_eq!(snap.state, BackfillState::Running);
        assert_eq!(snap.chunks_total, 10);
        assert!(snap.started_at.is_some());

        for _ in 0..9 {
            p.record_chunk_done(100);
        }
        p.record_chunk_failed();
        p.set_state(BackfillState::Complete);

        let snap = p.snapshot();
        assert_eq!(snap.chunks_done, 10);
        assert_eq!(snap.chunks_failed, 1);
        assert_eq!(snap.trades_loaded, 900);
        assert_eq!(snap.state, BackfillState::Complete);
    }

    #[test]
    fn eta_appears_once_progress_exists() {
        let p = BackfillProgress::new();
        p.begin(4);
        assert_eq!(p.snapshot().eta_seconds, None);
        p.record_chunk_done(10);
        // Some chunks remain, so an estimate must be present (possibly 0s).
        assert!(p.snapshot().eta_seconds.is_some());
    }

    #[test]
    fn error_records_message() {
        let p = BackfillProgress::new();
        p.begin(1);
        p.fail("boom".into());
        let snap = p.snapshot();
        assert_eq!(snap.state, BackfillState::Error);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn progress_fraction() {
        let p = BackfillProgress::new();
        p.begin(4);
        p.record_chunk_done(1);
        assert!((p.snapshot().progress_fraction() - 0.25).abs() < f64::EPSILON);
    }
}
