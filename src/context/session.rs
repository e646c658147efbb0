// =============================================================================
// Session-day bookkeeping: VWAP sums, opening range, day extremes, counters
// =============================================================================

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::TradeId;

use super::profile::VolumeProfile;

/// Opening-range window start/end, seconds after UTC midnight.
const OR_START_SECS: i64 = 8 * 3600; // 08:00:00
const OR_END_SECS: i64 = 8 * 3600 + 600; // 08:10:00

// ---------------------------------------------------------------------------
// VWAP accumulator
// ---------------------------------------------------------------------------

/// Running sums for the day-anchored VWAP. All three sums are monotonically
/// non-decreasing within a session day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VwapAccumulator {
    pub sum_price_qty: Decimal,
    pub sum_qty: Decimal,
    /// Numerator of the diagnostic quote-denominated VWAP.
    pub sum_price2_qty: Decimal,
}

impl VwapAccumulator {
    pub fn add(&mut self, price: Decimal, qty: Decimal) {
        self.sum_price_qty += price * qty;
        self.sum_qty += qty;
        self.sum_price2_qty += price * price * qty;
    }

    /// Base-denominated VWAP: sum(p*q) / sum(q).
    pub fn vwap_base(&self) -> Option<Decimal> {
        (self.sum_qty > Decimal::ZERO).then(|| self.sum_price_qty / self.sum_qty)
    }

    /// Quote-denominated VWAP (diagnostic): sum(p*p*q) / sum(p*q).
    pub fn vwap_quote(&self) -> Option<Decimal> {
        (self.sum_price_qty > Decimal::ZERO).then(|| self.sum_price2_qty / self.sum_price_qty)
    }
}

// ---------------------------------------------------------------------------
// Opening range
// ---------------------------------------------------------------------------

/// High/low established in the fixed [08:00, 08:10) UTC window. Values
/// mutate only while the trade timestamp lies inside the window and are
/// frozen until the next day roll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningRange {
    pub start_ms: i64,
    pub end_ms: i64,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
}

impl OpeningRange {
    pub fn for_date(date: NaiveDate) -> Self {
        let midnight_ms = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc()
            .timestamp_millis();
        Self {
            start_ms: midnight_ms + OR_START_SECS * 1000,
            end_ms: midnight_ms + OR_END_SECS * 1000,
            high: None,
            low: None,
        }
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms
    }

    /// Fold a trade into the range; trades outside the window are ignored.
    pub fn update(&mut self, ts_ms: i64, price: Decimal) {
        if !self.contains(ts_ms) {
            return;
        }
        self.high = Some(self.high.map_or(price, |h| h.max(price)));
        self.low = Some(self.low.map_or(price, |l| l.min(price)));
    }
}

// ---------------------------------------------------------------------------
// Session day
// ---------------------------------------------------------------------------

/// All intraday state for the current UTC calendar day. Exclusively owned by
/// the accumulator; reset wholesale at day roll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDay {
    pub date: NaiveDate,
    pub vwap: VwapAccumulator,
    pub profile: VolumeProfile,
    pub opening_range: OpeningRange,
    pub day_high: Option<Decimal>,
    pub day_low: Option<Decimal>,
    pub trade_count: u64,
    pub trades_from_backfill: u64,
    pub trades_from_live: u64,
    pub live_trades_rejected: u64,
    /// Base volume traded with a buy aggressor.
    pub buy_volume: Decimal,
    /// Base volume traded with a sell aggressor.
    pub sell_volume: Decimal,
    /// First / last ingested trade, kept as debug checkpoints.
    pub first_trade: Option<(i64, TradeId)>,
    pub last_trade: Option<(i64, TradeId)>,
}

impl SessionDay {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            vwap: VwapAccumulator::default(),
            profile: VolumeProfile::new(),
            opening_range: OpeningRange::for_date(date),
            day_high: None,
            day_low: None,
            trade_count: 0,
            trades_from_backfill: 0,
            trades_from_live: 0,
            live_trades_rejected: 0,
            buy_volume: Decimal::ZERO,
            sell_volume: Decimal::ZERO,
            first_trade: None,
            last_trade: None,
        }
    }

    /// Millisecond bounds of this session day: [00:00, 24:00) UTC.
    pub fn bounds_ms(&self) -> (i64, i64) {
        let start = self
            .date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc()
            .timestamp_millis();
        (start, start + 86_400_000)
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        let (start, end) = self.bounds_ms();
        ts_ms >= start && ts_ms < end
    }

    /// Running buy-minus-sell aggressor volume.
    pub fn cumulative_delta(&self) -> Decimal {
        self.buy_volume - self.sell_volume
    }

    /// High-minus-low of the day, zero before the first trade.
    pub fn day_range(&self) -> Decimal {
        match (self.day_high, self.day_low) {
            (Some(h), Some(l)) => h - l,
            _ => Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ms(date: NaiveDate, h: u32, m: u32, s: u32) -> i64 {
        date.and_hms_opt(h, m, s).unwrap().and_utc().timestamp_millis()
    }

    #[test]
    fn vwap_base_and_quote() {
        let mut acc = VwapAccumulator::default();
        acc.add(dec!(100), dec!(2));
        acc.add(dec!(102), dec!(2));
        assert_eq!(acc.vwap_base(), Some(dec!(101)));
        // quote mode: (100^2*2 + 102^2*2) / (100*2 + 102*2)
        let q = acc.vwap_quote().unwrap();
        assert!(q > dec!(101) && q < dec!(101.02));
    }

    #[test]
    fn vwap_empty_is_none() {
        let acc = VwapAccumulator::default();
        assert_eq!(acc.vwap_base(), None);
        assert_eq!(acc.vwap_quote(), None);
    }

    #[test]
    fn opening_range_window_bounds() {
        let d = date(2024, 3, 1);
        let or = OpeningRange::for_date(d);
        assert!(or.contains(ms(d, 8, 0, 0)));
        assert!(or.contains(ms(d, 8, 9, 59)));
        assert!(!or.contains(ms(d, 8, 10, 0)));
        assert!(!or.contains(ms(d, 7, 59, 59)));
    }

    #[test]
    fn opening_range_frozen_outside_window() {
        let d = date(2024, 3, 1);
        let mut or = OpeningRange::for_date(d);
        or.update(ms(d, 8, 1, 0), dec!(100.2));
        or.update(ms(d, 8, 5, 0), dec!(99.8));
        assert_eq!(or.high, Some(dec!(100.2)));
        assert_eq!(or.low, Some(dec!(99.8)));

        // After the window closes the values must not move.
        or.update(ms(d, 8, 10, 0), dec!(150));
        or.update(ms(d, 12, 0, 0), dec!(50));
        assert_eq!(or.high, Some(dec!(100.2)));
        assert_eq!(or.low, Some(dec!(99.8)));
    }

    #[test]
    fn session_day_bounds() {
        let day = SessionDay::new(date(2024, 3, 1));
        assert!(day.contains(ms(date(2024, 3, 1), 0, 0, 0)));
        assert!(day.contains(ms(date(2024, 3, 1), 23, 59, 59)));
        assert!(!day.contains(ms(date(2024, 3, 2), 0, 0, 0)));
        assert!(!day.contains(ms(date(2024, 2, 29), 23, 59, 59)));
    }

    #[test]
    fn day_range_and_delta_defaults() {
        let day = SessionDay::new(date(2024, 3, 1));
        assert_eq!(day.day_range(), dec!(0));
        assert_eq!(day.cumulative_delta(), dec!(0));
    }
}
