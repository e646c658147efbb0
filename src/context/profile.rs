// =============================================================================
// Volume profile: per-bin volume, POC, and the 70 % value area
// =============================================================================
//
// Keys are tick-aligned bin prices produced by the quantizer. The map is
// ordered so POC tie-breaks and value-area expansion walk adjacent bins
// directly.
// =============================================================================

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fraction of total day volume the value area must cover (0.70).
pub fn value_area_fraction() -> Decimal {
    Decimal::new(70, 2)
}

/// Mapping of binned price to accumulated base-asset volume for one session
/// day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeProfile {
    bins: BTreeMap<Decimal, Decimal>,
}

impl VolumeProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, bin: Decimal, qty: Decimal) {
        *self.bins.entry(bin).or_insert(Decimal::ZERO) += qty;
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn total_volume(&self) -> Decimal {
        self.bins.values().copied().sum()
    }

    pub fn volume_at(&self, bin: &Decimal) -> Decimal {
        self.bins.get(bin).copied().unwrap_or(Decimal::ZERO)
    }

    /// Iterate bins in ascending price order.
    pub fn iter(&self) -> impl Iterator<Item = (&Decimal, &Decimal)> {
        self.bins.iter()
    }

    /// Point of Control: the bin with the highest volume. Ties resolve to the
    /// lower price.
    pub fn poc(&self) -> Option<Decimal> {
        let mut best: Option<(Decimal, Decimal)> = None;
        for (&price, &vol) in &self.bins {
            match best {
                // Ascending iteration: only a strictly greater volume
                // displaces the current best, so the lowest price wins ties.
                Some((_, best_vol)) if vol <= best_vol => {}
                _ => best = Some((price, vol)),
            }
        }
        best.map(|(price, _)| price)
    }

    /// Value area: the contiguous bin range around POC covering at least
    /// 70 % of total volume. Returns `(val, vah)`.
    ///
    /// Expansion compares the immediate neighbor above the current high bin
    /// with the immediate neighbor below the current low bin and takes the
    /// larger; equal neighbors extend upward.
    pub fn value_area(&self) -> Option<(Decimal, Decimal)> {
        if self.bins.is_empty() {
            return None;
        }

        let sorted: Vec<(Decimal, Decimal)> =
            self.bins.iter().map(|(&p, &v)| (p, v)).collect();
        let poc = self.poc()?;
        let poc_idx = sorted.iter().position(|(p, _)| *p == poc)?;

        let target = self.total_volume() * value_area_fraction();

        let mut lo = poc_idx;
        let mut hi = poc_idx;
        let mut covered = sorted[poc_idx].1;

        while covered < target {
            let below = lo.checked_sub(1).map(|i| sorted[i].1);
            let above = (hi + 1 < sorted.len()).then(|| sorted[hi + 1].1);

            match (below, above) {
                (None, None) => break,
                (Some(b), Some(a)) => {
                    if a >= b {
                        hi += 1;
                        covered += a;
                    } else {
                        lo -= 1;
                        covered += b;
                    }
                }
                (Some(b), None) => {
                    lo -= 1;
                    covered += b;
                }
                (None, Some(a)) => {
                    hi += 1;
                    covered += a;
                }
            }
        }

        Some((sorted[lo].0, sorted[hi].0))
    }

    /// The `n` highest-volume bins, descending by volume with ties broken by
    /// ascending price. Used by the POC debug endpoint.
    pub fn top_bins(&self, n: usize) -> Vec<(Decimal, Decimal)> {
        let mut all: Vec<(Decimal, Decimal)> =
            self.bins.iter().map(|(&p, &v)| (p, v)).collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        all.truncate(n);
        all
    }
}

impl FromIterator<(Decimal, Decimal)> for VolumeProfile {
    fn from_iter<T: IntoIterator<Item = (Decimal, Decimal)>>(iter: T) -> Self {
        let mut profile = Self::new();
        for (bin, qty) in iter {
            profile.add(bin, qty);
        }
        profile
    }
}

// ---------------------------------------------------------------------------
// Previous-day levels
// ---------------------------------------------------------------------------

/// Levels derived from the prior session's profile. Computed once at day roll
/// (or on startup from the history store) and never mutated intraday.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousDayLevels {
    pub pdh: Decimal,
    pub pdl: Decimal,
    pub poc: Decimal,
    pub vah: Decimal,
    pub val: Decimal,
    pub vwap: Decimal,
}

impl PreviousDayLevels {
    /// Derive levels from a finished day. Returns `None` for an empty day.
    pub fn derive(
        profile: &VolumeProfile,
        vwap: Option<Decimal>,
        day_high: Option<Decimal>,
        day_low: Option<Decimal>,
    ) -> Option<Self> {
        let poc = profile.poc()?;
        let (val, vah) = profile.value_area()?;
        Some(Self {
            pdh: day_high?,
            pdl: day_low?,
            poc,
            vah,
            val,
            vwap: vwap?,
        })
    }
}
