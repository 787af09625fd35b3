//! Message and event types flowing between scanner tasks.
//!
//! Everything here crosses an mpsc or broadcast channel boundary; components
//! never hand each other live references, only identifiers and values.

use std::time::Instant;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::spread_thresholds;

/// Best-price update for one token, routed from the feed connector to the
/// spread detector. `received_at` is stamped the moment the frame is parsed
/// and travels with the tick for latency measurement.
#[derive(Debug, Clone)]
pub struct PriceUpdate {
    pub token_id: String,
    pub best_ask: Decimal,
    pub best_bid: Decimal,
    /// Monotonic receive instant, for detection latency.
    pub received_at: Instant,
    /// Wall-clock receive time, nanoseconds since the Unix epoch.
    pub received_at_ns: u64,
    /// True when this tick was produced by a trade event.
    pub trade_fired: bool,
    /// True when this tick reflects a traded-volume change.
    pub volume_changed: bool,
}

/// Control commands for the feed connector, processed in order between
/// incoming frames. Token ids are resolved by the sender while the market is
/// still present in the store.
#[derive(Debug)]
pub enum FeedCmd {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Reported spread bucket for a window's opening spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadCategory {
    Noise,
    Small,
    Medium,
    Large,
}

impl SpreadCategory {
    pub fn from_spread(spread: Decimal) -> Self {
        if spread < spread_thresholds::NOISE_MAX {
            SpreadCategory::Noise
        } else if spread < spread_thresholds::SMALL_MAX {
            SpreadCategory::Small
        } else if spread < spread_thresholds::MEDIUM_MAX {
            SpreadCategory::Medium
        } else {
            SpreadCategory::Large
        }
    }
}

impl std::fmt::Display for SpreadCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SpreadCategory::Noise => "noise",
            SpreadCategory::Small => "small",
            SpreadCategory::Medium => "medium",
            SpreadCategory::Large => "large",
        };
        write!(f, "{s}")
    }
}

/// Did the window survive long enough to be real?
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationClass {
    /// Died before MIN_ARB_TICKS: stale-order noise, never published.
    SingleTick,
    /// Survived to confirmation: a real window.
    MultiTick,
}

impl std::fmt::Display for DurationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DurationClass::SingleTick => write!(f, "single_tick"),
            DurationClass::MultiTick => write!(f, "multi_tick"),
        }
    }
}

/// How a confirmed window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Trade fired and volume changed across several ticks.
    VolumeSpikeGradual,
    /// Trade fired on a single tick only.
    VolumeSpikeInstant,
    /// No trade, but an ask drifted before the close.
    PriceDrift,
    /// No trade, no drift: the resting order was pulled.
    OrderVanished,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::VolumeSpikeGradual => "volume_spike_gradual",
            CloseReason::VolumeSpikeInstant => "volume_spike_instant",
            CloseReason::PriceDrift => "price_drift",
            CloseReason::OrderVanished => "order_vanished",
        };
        write!(f, "{s}")
    }
}

/// Combined priority: 1 = best target, 4 = lowest, 0 = noise (never emitted).
pub fn opportunity_class(class: DurationClass, reason: Option<CloseReason>) -> u8 {
    match (class, reason) {
        (DurationClass::SingleTick, _) => 0,
        (DurationClass::MultiTick, Some(CloseReason::VolumeSpikeGradual)) => 1,
        (DurationClass::MultiTick, Some(CloseReason::PriceDrift)) => 2,
        (DurationClass::MultiTick, Some(CloseReason::VolumeSpikeInstant)) => 3,
        (DurationClass::MultiTick, Some(CloseReason::OrderVanished)) => 4,
        (DurationClass::MultiTick, None) => 4,
    }
}

/// Raw observables accumulated while a window is live.
#[derive(Debug, Clone, Serialize)]
pub struct Observables {
    pub tick_count: u32,
    /// A trade event fired while the window was live.
    pub trade_event_fired: bool,
    /// Ticks on which traded volume changed (0 without trades).
    pub volume_change_ticks: u32,
    /// An ask moved between consecutive in-window ticks.
    pub price_shifted: bool,
}

// ---------------------------------------------------------------------------
// Window events
// ---------------------------------------------------------------------------

/// One side-pair quote snapshot with its derived sums.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuotePair {
    pub yes_ask: Decimal,
    pub no_ask: Decimal,
    pub combined: Decimal,
    pub spread: Decimal,
}

impl QuotePair {
    pub fn new(yes_ask: Decimal, no_ask: Decimal) -> Self {
        let combined = yes_ask + no_ask;
        Self {
            yes_ask,
            no_ask,
            combined,
            spread: Decimal::ONE - combined,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowOpen {
    pub market_id: String,
    pub opened_at_ns: u64,
    pub open: QuotePair,
    pub spread_category: SpreadCategory,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowClose {
    pub market_id: String,
    pub opened_at_ns: u64,
    pub closed_at_ns: u64,
    pub duration_ms: f64,
    pub open: QuotePair,
    pub close: QuotePair,
    pub spread_category: SpreadCategory,
    pub duration_class: DurationClass,
    pub close_reason: CloseReason,
    pub opportunity_class: u8,
    pub observables: Observables,
    /// Wire-receive to decision elapsed time on the closing tick.
    pub detection_latency_us: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WindowEvent {
    Open(WindowOpen),
    Close(WindowClose),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn spread_category_boundaries() {
        assert_eq!(SpreadCategory::from_spread(dec!(0.019)), SpreadCategory::Noise);
        assert_eq!(SpreadCategory::from_spread(dec!(0.02)), SpreadCategory::Small);
        assert_eq!(SpreadCategory::from_spread(dec!(0.05)), SpreadCategory::Medium);
        assert_eq!(SpreadCategory::from_spread(dec!(0.10)), SpreadCategory::Large);
        assert_eq!(SpreadCategory::from_spread(dec!(0.25)), SpreadCategory::Large);
    }

    #[test]
    fn quote_pair_derives_sums() {
        let q = QuotePair::new(dec!(0.45), dec!(0.49));
        assert_eq!(q.combined, dec!(0.94));
        assert_eq!(q.spread, dec!(0.06));
    }

    #[test]
    fn opportunity_priorities() {
        use CloseReason::*;
        assert_eq!(opportunity_class(DurationClass::SingleTick, None), 0);
        assert_eq!(
            opportunity_class(DurationClass::MultiTick, Some(VolumeSpikeGradual)),
            1
        );
        assert_eq!(opportunity_class(DurationClass::MultiTick, Some(PriceDrift)), 2);
        assert_eq!(
            opportunity_class(DurationClass::MultiTick, Some(VolumeSpikeInstant)),
            3
        );
        assert_eq!(
            opportunity_class(DurationClass::MultiTick, Some(OrderVanished)),
            4
        );
    }
}
