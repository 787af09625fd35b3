//! Window classification.
//!
//! A pure mapping from accumulated observables to the closed-window labels;
//! identical observables always produce identical labels.

use crate::config::MIN_ARB_TICKS;
use crate::events::{CloseReason, DurationClass, Observables};

/// Classify a closing window. The close reason is None for single-tick
/// windows, which are never published.
pub fn classify(obs: &Observables) -> (DurationClass, Option<CloseReason>) {
    if obs.tick_count < MIN_ARB_TICKS {
        return (DurationClass::SingleTick, None);
    }

    let reason = if obs.trade_event_fired {
        if obs.volume_change_ticks > 1 {
            CloseReason::VolumeSpikeGradual
        } else {
            CloseReason::VolumeSpikeInstant
        }
    } else if obs.price_shifted {
        CloseReason::PriceDrift
    } else {
        CloseReason::OrderVanished
    };

    (DurationClass::MultiTick, Some(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::opportunity_class;

    fn obs(tick_count: u32, trade: bool, volume_ticks: u32, shifted: bool) -> Observables {
        Observables {
            tick_count,
            trade_event_fired: trade,
            volume_change_ticks: volume_ticks,
            price_shifted: shifted,
        }
    }

    #[test]
    fn single_tick_is_noise() {
        let (class, reason) = classify(&obs(1, true, 3, true));
        assert_eq!(class, DurationClass::SingleTick);
        assert!(reason.is_none());
        assert_eq!(opportunity_class(class, reason), 0);
    }

    #[test]
    fn gradual_volume_spike_is_priority_one() {
        let (class, reason) = classify(&obs(3, true, 2, false));
        assert_eq!(class, DurationClass::MultiTick);
        assert_eq!(reason, Some(CloseReason::VolumeSpikeGradual));
        assert_eq!(opportunity_class(class, reason), 1);
    }

    #[test]
    fn instant_volume_spike_is_priority_three() {
        let (class, reason) = classify(&obs(3, true, 1, true));
        assert_eq!(reason, Some(CloseReason::VolumeSpikeInstant));
        assert_eq!(opportunity_class(class, reason), 3);
    }

    #[test]
    fn drift_without_trades_is_priority_two() {
        let (class, reason) = classify(&obs(4, false, 0, true));
        assert_eq!(reason, Some(CloseReason::PriceDrift));
        assert_eq!(opportunity_class(class, reason), 2);
    }

    #[test]
    fn vanished_order_is_priority_four() {
        let (class, reason) = classify(&obs(2, false, 0, false));
        assert_eq!(reason, Some(CloseReason::OrderVanished));
        assert_eq!(opportunity_class(class, reason), 4);
    }

    #[test]
    fn classification_is_deterministic() {
        let sample = obs(5, true, 2, true);
        let first = classify(&sample);
        for _ in 0..100 {
            assert_eq!(classify(&sample), first);
        }
    }
}
