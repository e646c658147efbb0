// =============================================================================
// History store: rolled daily volume profiles + level sidecars
// =============================================================================
//
// At day roll the finished profile is written as `<symbol>_YYYY-MM-DD_profile.csv`
// (columns `price,volume`) next to a small `_levels.json` sidecar holding the
// values that cannot be rebuilt from the binned profile alone (PDH, PDL,
// VWAP). On startup the previous day's levels are restored from these files
// so the engine never refetches a finished day.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::{PreviousDayLevels, RolledDay, VolumeProfile};
use crate::errors::EngineError;

#[derive(Debug, Serialize, Deserialize)]
struct ProfileRow {
    price: Decimal,
    volume: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
struct LevelsSidecar {
    pdh: Decimal,
    pdl: Decimal,
    vwap: Decimal,
}

pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn profile_path(&self, symbol: &str, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{symbol}_{}_profile.csv", date.format("%Y-%m-%d")))
    }

    fn levels_path(&self, symbol: &str, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{symbol}_{}_levels.json", date.format("%Y-%m-%d")))
    }

    /// Persist a rolled day: profile CSV plus the levels sidecar, both via
    /// tmp-then-rename.
    pub fn save_day(&self, symbol: &str, rolled: &RolledDay) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            EngineError::Transient(format!(
                "cannot create history dir {}: {e}",
                self.dir.display()
            ))
        })?;

        let profile_path = self.profile_path(symbol, rolled.date);
        write_profile_atomic(&profile_path, &rolled.profile)?;

        let sidecar = LevelsSidecar {
            pdh: rolled.levels.pdh,
            pdl: rolled.levels.pdl,
            vwap: rolled.levels.vwap,
        };
        let levels_path = self.levels_path(symbol, rolled.date);
        write_json_atomic(&levels_path, &sidecar)?;

        info!(
            symbol,
            date = %rolled.date,
            bins = rolled.profile.len(),
            "daily profile persisted"
        );
        Ok(())
    }

    /// Restore a day's levels, recomputing POC and the value area from the
    /// stored profile. Absent files yield `None`; a missing sidecar degrades
    /// to bin-derived approximations with a warning.
    pub fn load_levels(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<PreviousDayLevels>, EngineError> {
        let profile_path = self.profile_path(symbol, date);
        if !profile_path.exists() {
            return Ok(None);
        }

        let profile = read_profile(&profile_path)?;
        let Some(poc) = profile.poc() else {
            return Ok(None);
        };
        let (val, vah) = profile
            .value_area()
            .expect("non-empty profile always has a value area");

        let (pdh, pdl, vwap) = match read_sidecar(&self.levels_path(symbol, date))? {
            Some(s) => (s.pdh, s.pdl, s.vwap),
            None => {
                warn!(
                    symbol,
                    %date,
                    "levels sidecar missing, approximating PDH/PDL/VWAP from profile bins"
                );
                let high = profile.iter().map(|(&p, _)| p).max().unwrap_or(poc);
                let low = profile.iter().map(|(&p, _)| p).min().unwrap_or(poc);
                let weighted: Decimal =
                    profile.iter().map(|(&p, &v)| p * v).sum();
                let total = profile.total_volume();
                let vwap = if total > Decimal::ZERO {
                    weighted / total
                } else {
                    poc
                };
                (high, low, vwap)
            }
        };

        debug!(symbol, %date, %poc, "previous-day levels restored");
        Ok(Some(PreviousDayLevels {
            pdh,
            pdl,
            poc,
            vah,
            val,
            vwap,
        }))
    }
}

fn write_profile_atomic(path: &Path, profile: &VolumeProfile) -> Result<(), EngineError> {
    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp)
            .map_err(|e| EngineError::Transient(format!("cannot open {}: {e}", tmp.display())))?;
        for (&price, &volume) in profile.iter() {
            writer
                .serialize(ProfileRow { price, volume })
                .map_err(|e| EngineError::Transient(format!("profile serialize failed: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| EngineError::Transient(format!("profile flush failed: {e}")))?;
    }
    std::fs::rename(&tmp, path)
        .map_err(|e| EngineError::Transient(format!("profile rename failed: {e}")))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), EngineError> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| EngineError::Transient(format!("sidecar serialize failed: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)
        .map_err(|e| EngineError::Transient(format!("sidecar write failed: {e}")))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| EngineError::Transient(format!("sidecar rename failed: {e}")))
}

fn read_profile(path: &Path) -> Result<VolumeProfile, EngineError> {
    let corrupt = |reason: String| EngineError::CacheCorrupt {
        path: path.display().to_string(),
        reason,
    };
    let mut reader = csv::Reader::from_path(path).map_err(|e| corrupt(e.to_string()))?;
    let mut profile = VolumeProfile::new();
    for row in reader.deserialize::<ProfileRow>() {
        let row = row.map_err(|e| corrupt(e.to_string()))?;
        profile.add(row.price, row.volume);
    }
    Ok(profile)
}

fn read_sidecar(path: &Path) -> Result<Option<LevelsSidecar>, EngineError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| EngineError::CacheCorrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| EngineError::CacheCorrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}
