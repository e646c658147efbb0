// =============================================================================
// Price quantizer: snap a price to its tick-aligned volume-profile bin
// =============================================================================
//
// Uses decimal floor division, never binary floating point, so that the same
// price always lands in the same bin on the live and historical paths and the
// resulting profile reconciles with reference chart tools (101.505 with tick
// 0.1 must bin to exactly 101.5).
// =============================================================================

use rust_decimal::Decimal;

use crate::errors::EngineError;

/// Ticks below this are treated as configuration mistakes.
const MIN_TICK_EXPONENT: u32 = 12; // 1e-12

fn min_tick() -> Decimal {
    Decimal::new(1, MIN_TICK_EXPONENT)
}

/// Snap `price` down to the nearest multiple of `tick`.
///
/// `quantize(p, t) = floor(p / t) * t`, computed in decimal arithmetic.
pub fn quantize(price: Decimal, tick: Decimal) -> Result<Decimal, EngineError> {
    if tick <= Decimal::ZERO {
        return Err(EngineError::InvalidTick(format!(
            "tick must be positive, got {tick}"
        )));
    }
    if tick < min_tick() {
        return Err(EngineError::InvalidTick(format!(
            "tick {tick} is below the 1e-12 floor"
        )));
    }

    Ok(((price / tick).floor() * tick).normalize())
}

/// Validate a tick without quantizing anything. Used once at startup when the
/// exchange filter is resolved.
pub fn validate_tick(tick: Decimal) -> Result<Decimal, EngineError> {
    quantize(Decimal::ZERO, tick)?;
    Ok(tick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn snaps_down_to_bin() {
        assert_eq!(quantize(dec!(101.505), dec!(0.1)).unwrap(), dec!(101.5));
        assert_eq!(quantize(dec!(101.599), dec!(0.1)).unwrap(), dec!(101.5));
        assert_eq!(quantize(dec!(0.07), dec!(0.05)).unwrap(), dec!(0.05));
    }

    #[test]
    fn exact_multiples_are_fixed_points() {
        // quantize(k * tick, tick) == k * tick
        let tick = dec!(0.1);
        for k in 0i64..50 {
            let p = Decimal::from(k) * tick;
            assert_eq!(quantize(p, tick).unwrap(), p.normalize());
        }
    }

    #[test]
    fn idempotent() {
        // quantize(quantize(p, t), t) == quantize(p, t)
        let tick = dec!(0.25);
        for raw in [dec!(99.99), dec!(100.0), dec!(100.13), dec!(123.624)] {
            let once = quantize(raw, tick).unwrap();
            let twice = quantize(once, tick).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn no_float_drift() {
        // The canonical drift case: 0.1 is not representable in binary,
        // decimal arithmetic must still bin exactly.
        assert_eq!(quantize(dec!(101.505), dec!(0.1)).unwrap(), dec!(101.5));
        assert_ne!(quantize(dec!(101.505), dec!(0.1)).unwrap(), dec!(101.4));
        assert_eq!(quantize(dec!(0.3), dec!(0.1)).unwrap(), dec!(0.3));
    }

    #[test]
    fn rejects_bad_ticks() {
        assert!(matches!(
            quantize(dec!(100), dec!(0)),
            Err(EngineError::InvalidTick(_))
        ));
        assert!(matches!(
            quantize(dec!(100), dec!(-0.1)),
            Err(EngineError::InvalidTick(_))
        ));
        assert!(matches!(
            quantize(dec!(100), Decimal::new(1, 13)),
            Err(EngineError::InvalidTick(_))
        ));
    }

    #[test]
    fn validate_tick_passes_through() {
        assert_eq!(validate_tick(dec!(0.1)).unwrap(), dec!(0.1));
        assert!(validate_tick(dec!(0)).is_err());
    }
}
