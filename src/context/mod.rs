// =============================================================================
// Accumulator: the single ingress for every trade the engine sees
// =============================================================================
//
// Both the historical backfill and the live stream feed this component through
// one origin-tagged `ingest` call, so VWAP, the volume profile, the opening
// range, and the day counters stay mathematically identical regardless of how
// the day was assembled (cache, fresh backfill, or mid-session start).
//
// Single-writer contract: the engine serializes all ingress behind one lock;
// this type itself is plain mutable state with no interior locking.
// =============================================================================

pub mod profile;
pub mod session;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::errors::EngineError;
use crate::quantize::quantize;
use crate::types::{Side, Trade};

pub use profile::{PreviousDayLevels, VolumeProfile};
pub use session::{OpeningRange, SessionDay, VwapAccumulator};

/// Which VWAP definition a read asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VwapMode {
    #[default]
    Base,
    /// Quote-denominated diagnostic variant.
    Quote,
}

impl VwapMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "base" => Some(Self::Base),
            "quote" => Some(Self::Quote),
            _ => None,
        }
    }
}

/// What happened to a single ingested trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Timestamp outside the current session day; dropped.
    OutOfSession,
    /// Live data is disabled and the trade did not come from backfill.
    LiveRejected,
    /// Failed the price/qty sanity check; dropped.
    Invalid,
}

/// Snapshot handed back by `roll_day` so the caller can persist the finished
/// day.
#[derive(Debug, Clone)]
pub struct RolledDay {
    pub date: NaiveDate,
    pub profile: VolumeProfile,
    pub levels: PreviousDayLevels,
}

pub struct Accumulator {
    tick: Decimal,
    disable_live: bool,
    day: SessionDay,
    previous: Option<PreviousDayLevels>,
    last_price: Option<Decimal>,
}

impl Accumulator {
    pub fn new(tick: Decimal, disable_live: bool, today: NaiveDate) -> Self {
        Self {
            tick,
            disable_live,
            day: SessionDay::new(today),
            previous: None,
            last_price: None,
        }
    }

    pub fn tick(&self) -> Decimal {
        self.tick
    }

    pub fn day(&self) -> &SessionDay {
        &self.day
    }

    pub fn previous(&self) -> Option<&PreviousDayLevels> {
        self.previous.as_ref()
    }

    /// Install previous-day levels loaded from the history store at startup.
    pub fn set_previous(&mut self, levels: PreviousDayLevels) {
        self.previous = Some(levels);
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.last_price
    }

    pub fn vwap(&self, mode: VwapMode) -> Option<Decimal> {
        match mode {
            VwapMode::Base => self.day.vwap.vwap_base(),
            VwapMode::Quote => self.day.vwap.vwap_quote(),
        }
    }

    /// Fold one trade into the current session day.
    ///
    /// Origin tagging decides which counter the trade lands in and whether the
    /// live-disable switch applies. Out-of-day and malformed trades are
    /// dropped, never partially applied.
    pub fn ingest(
        &mut self,
        trade: &Trade,
        from_backfill: bool,
    ) -> Result<IngestOutcome, EngineError> {
        if !self.day.contains(trade.ts_ms) {
            debug!(ts_ms = trade.ts_ms, date = %self.day.date, "trade outside session day, dropped");
            return Ok(IngestOutcome::OutOfSession);
        }

        if self.disable_live && !from_backfill {
            self.day.live_trades_rejected += 1;
            return Ok(IngestOutcome::LiveRejected);
        }

        if !trade.is_valid() {
            debug!(id = %trade.id, price = %trade.price, qty = %trade.qty, "malformed trade skipped");
            return Ok(IngestOutcome::Invalid);
        }

        if from_backfill {
            self.day.trades_from_backfill += 1;
        } else {
            self.day.trades_from_live += 1;
        }
        self.day.trade_count += 1;

        self.day.vwap.add(trade.price, trade.qty);

        let bin = quantize(trade.price, self.tick)?;
        self.day.profile.add(bin, trade.qty);

        self.day.day_high = Some(self.day.day_high.map_or(trade.price, |h| h.max(trade.price)));
        self.day.day_low = Some(self.day.day_low.map_or(trade.price, |l| l.min(trade.price)));

        self.day.opening_range.update(trade.ts_ms, trade.price);

        match trade.side() {
            Side::Buy => self.day.buy_volume += trade.qty,
            Side::Sell => self.day.sell_volume += trade.qty,
        }

        if self.day.first_trade.is_none() {
            self.day.first_trade = Some((trade.ts_ms, trade.id.clone()));
        }
        self.day.last_trade = Some((trade.ts_ms, trade.id.clone()));
        self.last_price = Some(trade.price);

        self.check_invariants()?;
        Ok(IngestOutcome::Accepted)
    }

    /// Cheap per-trade invariant check. A breach here means the accumulator
    /// state is unusable and the engine must terminate.
    fn check_invariants(&self) -> Result<(), EngineError> {
        if self.day.vwap.sum_qty < Decimal::ZERO || self.day.vwap.sum_price_qty < Decimal::ZERO {
            return Err(EngineError::Fatal(format!(
                "negative vwap sums: sum_qty={} sum_price_qty={}",
                self.day.vwap.sum_qty, self.day.vwap.sum_price_qty
            )));
        }
        debug_assert_eq!(
            self.day.profile.total_volume(),
            self.day.vwap.sum_qty,
            "profile volume diverged from sum_qty"
        );
        Ok(())
    }

    /// Close the current day and open `new_date`.
    ///
    /// The finished day becomes the previous-day levels; the returned snapshot
    /// lets the caller persist the rolled profile. An empty day rolls to
    /// `None` and clears nothing but the intraday state.
    pub fn roll_day(&mut self, new_date: NaiveDate) -> Option<RolledDay> {
        let closed = std::mem::replace(&mut self.day, SessionDay::new(new_date));

        let rolled = PreviousDayLevels::derive(
            &closed.profile,
            closed.vwap.vwap_base(),
            closed.day_high,
            closed.day_low,
        )
        .map(|levels| RolledDay {
            date: closed.date,
            profile: closed.profile.clone(),
            levels,
        });

        match &rolled {
            Some(r) => {
                info!(
                    closed = %r.date, new = %new_date,
                    poc = %r.levels.poc, pdh = %r.levels.pdh, pdl = %r.levels.pdl,
                    "session day rolled"
                );
                self.previous = Some(r.levels.clone());
            }
            None => {
                info!(closed = %closed.date, new = %new_date, "empty session day rolled");
                self.previous = None;
            }
        }

        rolled
    }
}
