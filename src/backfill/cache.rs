// =============================================================================
// Backfill cache store: date-partitioned CSV files of raw trades
// =============================================================================
//
// One file per UTC date (`backfill_YYYY-MM-DD.csv`), columns
// `timestamp_ms,trade_id,price,qty,side,is_buyer_maker`, ordered by
// `(timestamp_ms, trade_id)` and deduplicated by trade id on every write.
// Writes go to a temporary sibling file first and are renamed into place, so
// a crash never leaves a half-written cache.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::types::{Side, Trade, TradeId};

/// Cache file name prefix; the date and `.csv` extension follow.
const FILE_PREFIX: &str = "backfill_";

/// On-disk row layout. Trade ids are stored textually so integer and string
/// ids share one schema.
#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    timestamp_ms: i64,
    trade_id: String,
    price: Decimal,
    qty: Decimal,
    side: Side,
    is_buyer_maker: bool,
}

impl From<&Trade> for CacheRecord {
    fn from(t: &Trade) -> Self {
        Self {
            timestamp_ms: t.ts_ms,
            trade_id: t.id.to_string(),
            price: t.price,
            qty: t.qty,
            side: t.side(),
            is_buyer_maker: t.is_buyer_maker,
        }
    }
}

impl From<CacheRecord> for Trade {
    fn from(r: CacheRecord) -> Self {
        Self {
            ts_ms: r.timestamp_ms,
            id: TradeId::parse(&r.trade_id),
            price: r.price,
            qty: r.qty,
            is_buyer_maker: r.is_buyer_maker,
        }
    }
}

pub struct TradeCache {
    dir: PathBuf,
}

impl TradeCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}.csv", date.format("%Y-%m-%d")))
    }

    /// Load a day's cached trades. An absent file is an empty day; a present
    /// file that cannot be read is `CacheCorrupt`, never silently empty.
    pub fn load(&self, date: NaiveDate) -> Result<Vec<Trade>, EngineError> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let corrupt = |reason: String| EngineError::CacheCorrupt {
            path: path.display().to_string(),
            reason,
        };

        let mut reader = csv::Reader::from_path(&path).map_err(|e| corrupt(e.to_string()))?;
        let mut trades = Vec::new();
        for row in reader.deserialize::<CacheRecord>() {
            let record = row.map_err(|e| corrupt(e.to_string()))?;
            trades.push(Trade::from(record));
        }

        debug!(path = %path.display(), rows = trades.len(), "cache file loaded");
        Ok(trades)
    }

    /// Merge `new_trades` into the day's file, dedup by trade id, sort by
    /// `(timestamp_ms, trade_id)`, and rewrite atomically. Returns the final
    /// row count.
    ///
    /// An unreadable existing file is logged and treated as empty so a
    /// corrupt cache heals on the next write.
    pub fn append_and_dedup(
        &self,
        date: NaiveDate,
        new_trades: &[Trade],
    ) -> Result<usize, EngineError> {
        let existing = match self.load(date) {
            Ok(v) => v,
            Err(e @ EngineError::CacheCorrupt { .. }) => {
                warn!(error = %e, "cache unreadable, rewriting from scratch");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut by_id: std::collections::BTreeMap<TradeId, Trade> = std::collections::BTreeMap::new();
        for t in existing.into_iter().chain(new_trades.iter().cloned()) {
            by_id.entry(t.id.clone()).or_insert(t);
        }

        let mut merged: Vec<Trade> = by_id.into_values().collect();
        merged.sort_by(|a, b| a.ts_ms.cmp(&b.ts_ms).then_with(|| a.id.cmp(&b.id)));

        self.write_atomic(&self.path_for(date), &merged)?;
        Ok(merged.len())
    }

    /// Highest cached timestamp for the day, used to resume a backfill.
    pub fn last_trade_ts(&self, date: NaiveDate) -> Result<Option<i64>, EngineError> {
        let trades = self.load(date)?;
        Ok(trades.iter().map(|t| t.ts_ms).max())
    }

    /// Best-effort deletion of cache files older than `days`. Returns how
    /// many files were removed.
    pub fn cleanup_older_than(&self, days: u32, today: NaiveDate) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(date) = parse_cache_file_date(&name.to_string_lossy()) else {
                continue;
            };
            let age = (today - date).num_days();
            if age > days as i64 {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        info!(file = %entry.path().display(), age_days = age, "stale cache file removed");
                        removed += 1;
                    }
                    Err(e) => {
                        warn!(file = %entry.path().display(), error = %e, "failed to remove stale cache file");
                    }
                }
            }
        }
        removed
    }

    fn write_atomic(&self, path: &Path, trades: &[Trade]) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            EngineError::Transient(format!("cannot create cache dir {}: {e}", self.dir.display()))
        })?;

        let tmp_path = path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp_path).map_err(|e| {
                EngineError::Transient(format!("cannot open {}: {e}", tmp_path.display()))
            })?;
            for t in trades {
                writer.serialize(CacheRecord::from(t)).map_err(|e| {
                    EngineError::Transient(format!("cache serialize failed: {e}"))
                })?;
            }
            writer
                .flush()
                .map_err(|e| EngineError::Transient(format!("cache flush failed: {e}")))?;
        }

        std::fs::rename(&tmp_path, path).map_err(|e| {
            EngineError::Transient(format!("cache rename to {} failed: {e}", path.display()))
        })?;

        debug!(path = %path.display(), rows = trades.len(), "cache file written (atomic)");
        Ok(())
    }
}

fn parse_cache_file_date(name: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix(FILE_PREFIX)?.strip_suffix(".csv")?;
    NaiveDate::parse_from_str(rest, "%Y-%m-%d").ok()
}
