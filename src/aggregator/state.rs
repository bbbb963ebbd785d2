// =============================================================================
// SymbolState — all derived per-symbol figures, owned by one aggregator task
// =============================================================================
//
// Nothing here is shared: the owning task feeds events in and hands immutable
// snapshots out. Session figures anchor on the broker's daily-bar timestamp;
// the ADR window and anchor price, and the market-profile classification
// price, come from configuration.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::aggregator::profile::{MarketProfile, ProfileDeltaLevel, ProfileLevel};
use crate::aggregator::volatility::EwmaVolatility;
use crate::runtime_config::{AdrAnchor, AggregatorSettings, ClassificationPrice};
use crate::types::{Bar, SpotTick, SymbolInfo, TickDirection};

/// Ticks older than the last accepted tick by this much are dropped.
const STALE_TICK_LIMIT_MS: i64 = 5 * 60 * 1000;

/// Full snapshot pushed to a client right after subscribing (and again after
/// a session rollover).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolDataPackage {
    pub symbol: String,
    pub digits: i32,
    pub pip_position: i32,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub todays_open: f64,
    pub todays_high: f64,
    pub todays_low: f64,
    pub previous_close: f64,
    pub projected_adr_high: f64,
    pub projected_adr_low: f64,
    pub market_profile: MarketProfileSnapshot,
    pub volatility_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketProfileSnapshot {
    pub levels: Vec<ProfileLevel>,
}

/// Incremental frame emitted per accepted tick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickUpdate {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub ts: i64,
    pub last_tick_direction: TickDirection,
    pub todays_high: f64,
    pub todays_low: f64,
    pub volatility_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_delta: Option<Vec<ProfileDeltaLevel>>,
}

/// What became of one inbound tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// Accepted; fan this update out.
    Update(TickUpdate),
    /// Stored, but one quote side is still unknown so there is no mid yet.
    Incomplete,
    /// Malformed or stale; dropped with a counter increment.
    Rejected,
}

pub struct SymbolState {
    symbol: Arc<SymbolInfo>,
    settings: AggregatorSettings,

    // ── Live quote ──────────────────────────────────────────────────────
    bid: Option<f64>,
    ask: Option<f64>,
    mid: f64,
    prev_mid: Option<f64>,
    /// Previous value of the configured classification price series.
    prev_class: Option<f64>,
    timestamp_ms: i64,
    last_direction: TickDirection,

    // ── Session figures ─────────────────────────────────────────────────
    todays_open: f64,
    todays_high: f64,
    todays_low: f64,
    previous_close: f64,
    /// Timestamp of the broker daily bar anchoring the current session.
    session_anchor_ms: i64,
    /// Set at rollover; the next tick seeds high == low == mid.
    session_fresh: bool,

    // ── ADR ─────────────────────────────────────────────────────────────
    adr_value: f64,
    projected_adr_high: f64,
    projected_adr_low: f64,
    /// High-low ranges of the most recent completed sessions, oldest first.
    daily_ranges: VecDeque<f64>,

    profile: MarketProfile,
    volatility: EwmaVolatility,

    ready: bool,
    has_price: bool,
}

impl SymbolState {
    pub fn new(symbol: Arc<SymbolInfo>, settings: AggregatorSettings) -> Self {
        let pip = symbol.pip_size();
        Self {
            symbol,
            settings,
            bid: None,
            ask: None,
            mid: 0.0,
            prev_mid: None,
            prev_class: None,
            timestamp_ms: 0,
            last_direction: TickDirection::Flat,
            todays_open: 0.0,
            todays_high: 0.0,
            todays_low: 0.0,
            previous_close: 0.0,
            session_anchor_ms: 0,
            session_fresh: false,
            adr_value: 0.0,
            projected_adr_high: 0.0,
            projected_adr_low: 0.0,
            daily_ranges: VecDeque::new(),
            profile: MarketProfile::new(pip),
            volatility: EwmaVolatility::new(),
            ready: false,
            has_price: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn has_price(&self) -> bool {
        self.has_price
    }

    pub fn adr_value(&self) -> f64 {
        self.adr_value
    }

    pub fn last_tick_direction(&self) -> TickDirection {
        self.last_direction
    }

    // ── Priming ─────────────────────────────────────────────────────────

    /// Seed session figures, ADR, and the market profile from historical
    /// bars: the last daily bars (ascending, the final one being the current
    /// session) and the current session's one-minute bars (ascending).
    pub fn apply_prime(&mut self, daily: &[Bar], minute: &[Bar]) {
        if let Some((current, completed)) = daily.split_last() {
            self.session_anchor_ms = current.timestamp_ms;

            self.daily_ranges = completed
                .iter()
                .rev()
                .take(self.settings.adr_window_days)
                .map(|b| b.high - b.low)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            self.recompute_adr();

            if let Some(last_completed) = completed.last() {
                self.previous_close = last_completed.close;
            }
            self.todays_open = minute.first().map_or(current.open, |b| b.open);
        } else {
            self.todays_open = minute.first().map_or(0.0, |b| b.open);
        }

        if minute.is_empty() {
            self.todays_high = self.todays_open;
            self.todays_low = self.todays_open;
            self.session_fresh = true;
        } else {
            self.todays_high = f64::NEG_INFINITY;
            self.todays_low = f64::INFINITY;
            self.seed_from_minute_bars(minute);
            self.session_fresh = false;
        }

        // Ticks may have arrived while priming was in flight; keep them in
        // the session range.
        if self.has_price {
            self.todays_high = self.todays_high.max(self.mid);
            self.todays_low = self.todays_low.min(self.mid);
        }

        self.recompute_projection();
        self.ready = true;
        debug!(
            symbol = %self.symbol.name,
            adr = self.adr_value,
            todays_open = self.todays_open,
            previous_close = self.previous_close,
            profile_levels = self.profile.len(),
            "aggregator primed"
        );
    }

    /// Replay each bar's OHLC as four synthetic ticks, in open, high, low,
    /// close order, chaining the synthesized direction off the previous
    /// synthetic price. The very first open has no predecessor and
    /// contributes flat (volume only).
    fn seed_from_minute_bars(&mut self, minute: &[Bar]) {
        let mut prev: Option<f64> = if self.has_price { self.prev_class } else { None };
        for bar in minute {
            self.todays_high = self.todays_high.max(bar.high);
            self.todays_low = self.todays_low.min(bar.low);
            for price in [bar.open, bar.high, bar.low, bar.close] {
                let direction = TickDirection::classify(price, prev);
                self.profile.record(price, direction);
                prev = Some(price);
            }
        }
        if !self.has_price {
            self.prev_class = prev;
            self.prev_mid = prev;
        }
        // Seeding is part of the initial snapshot, not an incremental delta.
        let _ = self.profile.take_dirty();
    }

    // ── Ticks ───────────────────────────────────────────────────────────

    pub fn apply_tick(&mut self, tick: SpotTick) -> TickOutcome {
        for side in [tick.bid, tick.ask].into_iter().flatten() {
            if !side.is_finite() || side <= 0.0 {
                return TickOutcome::Rejected;
            }
        }
        if self.has_price && tick.timestamp_ms + STALE_TICK_LIMIT_MS < self.timestamp_ms {
            return TickOutcome::Rejected;
        }

        if let Some(bid) = tick.bid {
            self.bid = Some(bid);
        }
        if let Some(ask) = tick.ask {
            self.ask = Some(ask);
        }
        let (bid, ask) = match (self.bid, self.ask) {
            (Some(b), Some(a)) => (b, a),
            _ => return TickOutcome::Incomplete,
        };

        let mid = (bid + ask) / 2.0;
        let class_price = match self.settings.profile_classification {
            ClassificationPrice::Mid => mid,
            ClassificationPrice::Bid => bid,
        };

        let direction = TickDirection::classify(mid, self.prev_mid);
        let class_direction = TickDirection::classify(class_price, self.prev_class);

        // Session range bookkeeping.
        if self.session_fresh {
            self.todays_high = mid;
            self.todays_low = mid;
            self.session_fresh = false;
        } else if !self.has_price && self.todays_open == 0.0 {
            // Never primed and no session figures yet.
            self.todays_open = mid;
            self.todays_high = mid;
            self.todays_low = mid;
            self.recompute_projection();
        } else {
            self.todays_high = self.todays_high.max(mid);
            self.todays_low = self.todays_low.min(mid);
        }

        self.profile.record(class_price, class_direction);

        match self.prev_mid {
            Some(prev) => self.volatility.record(tick.timestamp_ms, (mid - prev).abs()),
            None => self.volatility.decay_to(tick.timestamp_ms),
        }

        self.mid = mid;
        self.prev_mid = Some(mid);
        self.prev_class = Some(class_price);
        self.timestamp_ms = tick.timestamp_ms;
        self.last_direction = direction;
        self.has_price = true;

        TickOutcome::Update(TickUpdate {
            symbol: self.symbol.name.clone(),
            bid,
            ask,
            mid,
            ts: tick.timestamp_ms,
            last_tick_direction: direction,
            todays_high: self.todays_high,
            todays_low: self.todays_low,
            volatility_pct: self.volatility.pct_of(self.adr_value),
            profile_delta: Some(self.profile.take_dirty()),
        })
    }

    // ── Bars ────────────────────────────────────────────────────────────

    /// Process a live daily bar. Returns `true` when it opened a new session
    /// (rollover): session figures reset, the profile empties, and the ADR is
    /// refreshed from the completed sessions.
    pub fn apply_daily_bar(&mut self, bar: Bar) -> bool {
        if self.session_anchor_ms == 0 {
            self.session_anchor_ms = bar.timestamp_ms;
            if self.todays_open == 0.0 {
                self.todays_open = bar.open;
                self.recompute_projection();
            }
            return false;
        }
        if bar.timestamp_ms <= self.session_anchor_ms {
            return false;
        }

        // The session that just ended becomes a completed range.
        if self.has_price && self.todays_high >= self.todays_low && self.todays_high > 0.0 {
            self.daily_ranges.push_back(self.todays_high - self.todays_low);
            while self.daily_ranges.len() > self.settings.adr_window_days {
                self.daily_ranges.pop_front();
            }
        }
        self.recompute_adr();

        if self.has_price {
            self.previous_close = self.mid;
        }
        self.todays_open = bar.open;
        self.todays_high = bar.open;
        self.todays_low = bar.open;
        self.session_fresh = true;
        self.profile.clear();
        self.session_anchor_ms = bar.timestamp_ms;
        self.recompute_projection();

        debug!(
            symbol = %self.symbol.name,
            todays_open = self.todays_open,
            previous_close = self.previous_close,
            adr = self.adr_value,
            "session rollover"
        );
        true
    }

    /// Live minute bars keep the session range honest across tick gaps.
    pub fn apply_minute_bar(&mut self, bar: Bar) {
        if self.ready && !self.session_fresh {
            self.todays_high = self.todays_high.max(bar.high);
            self.todays_low = self.todays_low.min(bar.low);
        }
    }

    /// Periodic recompute: decays the volatility estimate through quiet
    /// stretches.
    pub fn on_tock(&mut self, now_ms: i64) {
        self.volatility.decay_to(now_ms);
    }

    /// Apply a runtime settings change; the ADR window and anchor take
    /// effect immediately.
    pub fn update_settings(&mut self, settings: AggregatorSettings) {
        self.settings = settings;
        while self.daily_ranges.len() > self.settings.adr_window_days {
            self.daily_ranges.pop_front();
        }
        self.recompute_adr();
        self.recompute_projection();
    }

    // ── Derived figures ─────────────────────────────────────────────────

    fn recompute_adr(&mut self) {
        self.adr_value = if self.daily_ranges.is_empty() {
            0.0
        } else {
            self.daily_ranges.iter().sum::<f64>() / self.daily_ranges.len() as f64
        };
    }

    fn recompute_projection(&mut self) {
        let anchor = match self.settings.adr_anchor {
            AdrAnchor::TodaysOpen => self.todays_open,
            AdrAnchor::PreviousClose => self.previous_close,
        };
        if self.adr_value > 0.0 && anchor > 0.0 {
            self.projected_adr_high = anchor + self.adr_value / 2.0;
            self.projected_adr_low = anchor - self.adr_value / 2.0;
        } else {
            self.projected_adr_high = 0.0;
            self.projected_adr_low = 0.0;
        }
    }

    pub fn snapshot(&self) -> SymbolDataPackage {
        SymbolDataPackage {
            symbol: self.symbol.name.clone(),
            digits: self.symbol.digits,
            pip_position: self.symbol.pip_position,
            bid: self.bid.unwrap_or(0.0),
            ask: self.ask.unwrap_or(0.0),
            mid: self.mid,
            todays_open: self.todays_open,
            todays_high: self.todays_high,
            todays_low: self.todays_low,
            previous_close: self.previous_close,
            projected_adr_high: self.projected_adr_high,
            projected_adr_low: self.projected_adr_low,
            market_profile: MarketProfileSnapshot {
                levels: self.profile.levels(),
            },
            volatility_pct: self.volatility.pct_of(self.adr_value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eurusd() -> Arc<SymbolInfo> {
        Arc::new(SymbolInfo {
            id: 1,
            name: "EURUSD".into(),
            digits: 5,
            pip_position: 4,
        })
    }

    fn settings() -> AggregatorSettings {
        AggregatorSettings::default()
    }

    fn daily_bar(day: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp_ms: day * 86_400_000,
            open,
            high,
            low,
            close,
            volume: 1000,
        }
    }

    fn minute_bar(ts: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp_ms: ts,
            open,
            high,
            low,
            close,
            volume: 10,
        }
    }

    fn tick(bid: f64, ask: f64, ts: i64) -> SpotTick {
        SpotTick {
            bid: Some(bid),
            ask: Some(ask),
            timestamp_ms: ts,
        }
    }

    /// Five completed dailies with ranges 10/12/14/16/18 pips, then today.
    fn primed_state() -> SymbolState {
        let mut state = SymbolState::new(eurusd(), settings());
        let daily = vec![
            daily_bar(1, 1.0800, 1.0810, 1.0800, 1.0805),
            daily_bar(2, 1.0805, 1.0817, 1.0805, 1.0810),
            daily_bar(3, 1.0810, 1.0824, 1.0810, 1.0815),
            daily_bar(4, 1.0815, 1.0831, 1.0815, 1.0820),
            daily_bar(5, 1.0820, 1.0838, 1.0820, 1.0825),
            daily_bar(6, 1.0825, 1.0830, 1.0822, 1.0828), // today, in progress
        ];
        let minute = vec![
            minute_bar(6 * 86_400_000, 1.0825, 1.0828, 1.0824, 1.0826),
            minute_bar(6 * 86_400_000 + 60_000, 1.0826, 1.0830, 1.0825, 1.0829),
        ];
        state.apply_prime(&daily, &minute);
        state
    }

    #[test]
    fn prime_computes_adr_and_session_figures() {
        let state = primed_state();
        assert!(state.is_ready());

        // Mean of 10, 12, 14, 16, 18 pips = 14 pips.
        assert!((state.adr_value() - 0.0014).abs() < 1e-9);
        assert!((state.previous_close - 1.0825).abs() < 1e-9);
        assert!((state.todays_open - 1.0825).abs() < 1e-9);
        assert!((state.todays_high - 1.0830).abs() < 1e-9);
        assert!((state.todays_low - 1.0824).abs() < 1e-9);
    }

    #[test]
    fn projection_is_centered_on_todays_open() {
        let state = primed_state();
        let pkg = state.snapshot();
        assert!((pkg.projected_adr_high - (1.0825 + 0.0007)).abs() < 1e-9);
        assert!((pkg.projected_adr_low - (1.0825 - 0.0007)).abs() < 1e-9);
        // projectedAdrHigh - projectedAdrLow == adrValue within tolerance.
        assert!(
            ((pkg.projected_adr_high - pkg.projected_adr_low) - state.adr_value()).abs()
                < state.adr_value() * 1e-12
        );
    }

    #[test]
    fn prime_seeds_profile_from_bar_corners() {
        let state = primed_state();
        let pkg = state.snapshot();
        // Two bars, four synthetic ticks each.
        let total: u64 = pkg.market_profile.levels.iter().map(|l| l.volume).sum();
        assert_eq!(total, 8);
        // The first synthetic open has no predecessor and the second bar's
        // open repeats the first bar's close: both flat, so buy+sell < volume.
        let buys: u64 = pkg.market_profile.levels.iter().map(|l| l.buy_volume).sum();
        let sells: u64 = pkg
            .market_profile
            .levels
            .iter()
            .map(|l| l.sell_volume)
            .sum();
        assert_eq!(buys + sells, 6);
    }

    #[test]
    fn tick_updates_quote_and_direction() {
        let mut state = primed_state();
        let ts = 6 * 86_400_000 + 120_000;

        let first = state.apply_tick(tick(1.0826, 1.0828, ts));
        let update = match first {
            TickOutcome::Update(u) => u,
            other => panic!("expected update, got {other:?}"),
        };
        assert!((update.mid - 1.0827).abs() < 1e-9);

        let second = state.apply_tick(tick(1.0828, 1.0830, ts + 100));
        match second {
            TickOutcome::Update(u) => {
                assert_eq!(u.last_tick_direction, TickDirection::Up);
                assert!((u.mid - 1.0829).abs() < 1e-9);
            }
            other => panic!("expected update, got {other:?}"),
        }

        let third = state.apply_tick(tick(1.0820, 1.0822, ts + 200));
        match third {
            TickOutcome::Update(u) => {
                assert_eq!(u.last_tick_direction, TickDirection::Down);
                assert!((u.todays_low - 1.0821).abs() < 1e-9);
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(state.last_tick_direction(), TickDirection::Down);
    }

    #[test]
    fn one_sided_quote_is_incomplete_until_both_sides_seen() {
        let mut state = SymbolState::new(eurusd(), settings());
        let only_bid = SpotTick {
            bid: Some(1.0826),
            ask: None,
            timestamp_ms: 1_000,
        };
        assert!(matches!(state.apply_tick(only_bid), TickOutcome::Incomplete));

        let only_ask = SpotTick {
            bid: None,
            ask: Some(1.0828),
            timestamp_ms: 2_000,
        };
        assert!(matches!(state.apply_tick(only_ask), TickOutcome::Update(_)));
    }

    #[test]
    fn malformed_ticks_rejected() {
        let mut state = primed_state();
        assert!(matches!(
            state.apply_tick(tick(-1.0, 1.0828, 1_000)),
            TickOutcome::Rejected
        ));
        assert!(matches!(
            state.apply_tick(tick(f64::NAN, 1.0828, 1_000)),
            TickOutcome::Rejected
        ));
    }

    #[test]
    fn stale_ticks_rejected() {
        let mut state = primed_state();
        let now = 6 * 86_400_000 + 600_000;
        assert!(matches!(
            state.apply_tick(tick(1.0826, 1.0828, now)),
            TickOutcome::Update(_)
        ));
        // Six minutes older than the accepted tick.
        assert!(matches!(
            state.apply_tick(tick(1.0825, 1.0827, now - 360_000)),
            TickOutcome::Rejected
        ));
        // Four minutes old is within tolerance.
        assert!(matches!(
            state.apply_tick(tick(1.0825, 1.0827, now - 240_000)),
            TickOutcome::Update(_)
        ));
    }

    #[test]
    fn rollover_resets_session_and_refreshes_adr() {
        let mut state = primed_state();
        let ts = 6 * 86_400_000 + 120_000;
        state.apply_tick(tick(1.0830, 1.0832, ts));
        state.apply_tick(tick(1.0810, 1.0812, ts + 100));
        let last_mid = 1.0811;

        let new_day = daily_bar(7, 1.0815, 1.0815, 1.0815, 1.0815);
        assert!(state.apply_daily_bar(new_day));

        let pkg = state.snapshot();
        assert!((pkg.previous_close - last_mid).abs() < 1e-9);
        assert!((pkg.todays_open - 1.0815).abs() < 1e-9);
        assert!(pkg.market_profile.levels.is_empty());

        // The ended session's range (1.0831 high, 1.0811 low from ticks over
        // the primed 1.0830/1.0824 bars) joined the ADR window.
        assert!(state.adr_value() > 0.0);

        // First tick of the new session pins high == low == mid.
        match state.apply_tick(tick(1.0816, 1.0818, 7 * 86_400_000 + 1_000)) {
            TickOutcome::Update(u) => {
                assert!((u.todays_high - 1.0817).abs() < 1e-9);
                assert!((u.todays_low - 1.0817).abs() < 1e-9);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn same_session_daily_bar_is_not_a_rollover() {
        let mut state = primed_state();
        let same_day = daily_bar(6, 1.0825, 1.0840, 1.0820, 1.0835);
        assert!(!state.apply_daily_bar(same_day));
    }

    #[test]
    fn adr_window_is_configurable() {
        let mut custom = settings();
        custom.adr_window_days = 2;
        let mut state = SymbolState::new(eurusd(), custom);
        let daily = vec![
            daily_bar(1, 1.0, 1.0010, 1.0, 1.0),
            daily_bar(2, 1.0, 1.0020, 1.0, 1.0),
            daily_bar(3, 1.0, 1.0030, 1.0, 1.0),
            daily_bar(4, 1.0, 1.0040, 1.0, 1.0), // today
        ];
        state.apply_prime(&daily, &[]);
        // Only the last two completed ranges: (20 + 30) / 2 = 25 pips.
        assert!((state.adr_value() - 0.0025).abs() < 1e-9);
    }

    #[test]
    fn anchor_on_previous_close_is_configurable() {
        let mut custom = settings();
        custom.adr_anchor = AdrAnchor::PreviousClose;
        let mut state = SymbolState::new(eurusd(), custom);
        let daily = vec![
            daily_bar(1, 1.0800, 1.0820, 1.0800, 1.0810),
            daily_bar(2, 1.0810, 1.0815, 1.0805, 1.0812), // today
        ];
        state.apply_prime(&daily, &[]);

        let pkg = state.snapshot();
        assert!((pkg.projected_adr_high - (1.0810 + 0.0010)).abs() < 1e-9);
        assert!((pkg.projected_adr_low - (1.0810 - 0.0010)).abs() < 1e-9);
    }

    #[test]
    fn bid_classification_is_configurable() {
        let mut custom = settings();
        custom.profile_classification = ClassificationPrice::Bid;
        let mut state = SymbolState::new(eurusd(), custom);

        state.apply_tick(tick(1.0826, 1.0828, 1_000));
        // Bid up, mid up too; bucket sits on the bid, not the mid.
        state.apply_tick(tick(1.0830, 1.0832, 2_000));

        let pkg = state.snapshot();
        let prices: Vec<f64> = pkg.market_profile.levels.iter().map(|l| l.price).collect();
        assert!(prices.iter().any(|p| (p - 1.0826).abs() < 1e-9));
        assert!(prices.iter().any(|p| (p - 1.0830).abs() < 1e-9));
    }

    #[test]
    fn volatility_pct_tracks_adr() {
        let mut state = primed_state();
        let ts = 6 * 86_400_000 + 120_000;
        state.apply_tick(tick(1.0826, 1.0828, ts));
        // A 14-pip jump equals the full ADR: clamps at 100.
        match state.apply_tick(tick(1.0840, 1.0842, ts + 10)) {
            TickOutcome::Update(u) => {
                assert!(u.volatility_pct > 90.0);
                assert!(u.volatility_pct <= 100.0);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn profile_delta_carries_only_touched_buckets() {
        let mut state = primed_state();
        let ts = 6 * 86_400_000 + 120_000;
        state.apply_tick(tick(1.0826, 1.0828, ts));
        match state.apply_tick(tick(1.0826, 1.0828, ts + 10)) {
            TickOutcome::Update(u) => {
                let delta = u.profile_delta.unwrap();
                assert_eq!(delta.len(), 1);
                assert!((delta[0].price - 1.0827).abs() < 1e-9);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }
}
