// =============================================================================
// Volatility estimator — exponentially weighted absolute tick-to-tick move
// =============================================================================
//
// v <- v * e^(-dt/tau) + |mid - previous_mid|, with tau chosen so the weight
// halves every 30 seconds. Exposed to clients as a percentage of the
// symbol's average daily range, clamped to [0, 100].
// =============================================================================

const DEFAULT_HALF_LIFE_MS: f64 = 30_000.0;

#[derive(Debug)]
pub struct EwmaVolatility {
    value: f64,
    last_ms: Option<i64>,
    /// Decay time constant in milliseconds (half-life / ln 2).
    tau_ms: f64,
}

impl EwmaVolatility {
    pub fn new() -> Self {
        Self::with_half_life_ms(DEFAULT_HALF_LIFE_MS)
    }

    pub fn with_half_life_ms(half_life_ms: f64) -> Self {
        Self {
            value: 0.0,
            last_ms: None,
            tau_ms: half_life_ms / std::f64::consts::LN_2,
        }
    }

    /// Decay to `now_ms` and accumulate one absolute mid move.
    pub fn record(&mut self, now_ms: i64, abs_move: f64) {
        self.decay_to(now_ms);
        self.value += abs_move;
        self.last_ms = Some(now_ms);
    }

    /// Apply decay without accumulating; used by the periodic tock so the
    /// estimate falls off during quiet stretches.
    pub fn decay_to(&mut self, now_ms: i64) {
        if let Some(last) = self.last_ms {
            let dt = (now_ms - last) as f64;
            if dt > 0.0 {
                self.value *= (-dt / self.tau_ms).exp();
                self.last_ms = Some(now_ms);
            }
        } else {
            self.last_ms = Some(now_ms);
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Current value as a percentage of `adr`, clamped to [0, 100]. Zero when
    /// the ADR is unknown.
    pub fn pct_of(&self, adr: f64) -> f64 {
        if adr <= 0.0 || !adr.is_finite() {
            return 0.0;
        }
        (self.value / adr * 100.0).clamp(0.0, 100.0)
    }
}

impl Default for EwmaVolatility {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_moves() {
        let mut vol = EwmaVolatility::new();
        vol.record(0, 0.0010);
        vol.record(0, 0.0005);
        assert!((vol.value() - 0.0015).abs() < 1e-12);
    }

    #[test]
    fn halves_after_half_life() {
        let mut vol = EwmaVolatility::new();
        vol.record(0, 1.0);
        vol.decay_to(30_000);
        assert!((vol.value() - 0.5).abs() < 1e-9);
        vol.decay_to(60_000);
        assert!((vol.value() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn record_decays_before_accumulating() {
        let mut vol = EwmaVolatility::new();
        vol.record(0, 1.0);
        vol.record(30_000, 1.0);
        // 0.5 remaining from the first move plus the new unit move.
        assert!((vol.value() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn pct_of_adr_clamped() {
        let mut vol = EwmaVolatility::new();
        vol.record(0, 0.0050);
        assert!((vol.pct_of(0.0100) - 50.0).abs() < 1e-9);

        vol.record(0, 1.0);
        assert_eq!(vol.pct_of(0.0100), 100.0);
    }

    #[test]
    fn pct_of_zero_adr_is_zero() {
        let mut vol = EwmaVolatility::new();
        vol.record(0, 0.5);
        assert_eq!(vol.pct_of(0.0), 0.0);
        assert_eq!(vol.pct_of(f64::NAN), 0.0);
    }

    #[test]
    fn stale_clock_does_not_inflate() {
        let mut vol = EwmaVolatility::new();
        vol.record(10_000, 1.0);
        // A non-advancing clock leaves the value untouched.
        vol.decay_to(10_000);
        assert!((vol.value() - 1.0).abs() < 1e-12);
    }
}
