//! Spread detection over paired YES/NO best asks.
//!
//! The detector keeps a private quote cache updated strictly in the order
//! price updates arrive. Reading the shared store here would race the feed
//! connector's writes and expose half-updated snapshots; the private cache
//! guarantees each decision sees exactly the prices as of the current tick,
//! and makes the detector single-threaded and replayable.

pub mod classifier;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MIN_ARB_TICKS;
use crate::events::{
    opportunity_class, Observables, PriceUpdate, QuotePair, SpreadCategory, WindowClose,
    WindowEvent, WindowOpen,
};
use crate::metrics::{LatencyStats, NoiseStats};
use crate::store::MarketStore;
use crate::ws::feed::now_ns;

/// State for one market's live window, owned exclusively by the detector.
struct TrackedWindow {
    first_seen_ns: u64,
    last_seen_ns: u64,
    tick_count: u32,
    /// Quotes published with the Open event; set at confirmation.
    open: QuotePair,
    /// Previous tick's asks, for drift detection.
    prev_yes_ask: Decimal,
    prev_no_ask: Decimal,
    trade_event_fired: bool,
    volume_change_ticks: u32,
    price_shift_ticks: u32,
    /// True until the window has survived MIN_ARB_TICKS.
    pending: bool,
}

impl TrackedWindow {
    fn observables(&self) -> Observables {
        Observables {
            tick_count: self.tick_count,
            trade_event_fired: self.trade_event_fired,
            volume_change_ticks: self.volume_change_ticks,
            price_shifted: self.price_shift_ticks > 0,
        }
    }
}

pub struct SpreadDetector {
    store: Arc<MarketStore>,
    price_rx: mpsc::Receiver<PriceUpdate>,
    /// Market ids removed by the subscription controller; any live window is
    /// closed synthetically.
    removal_rx: mpsc::Receiver<String>,
    window_tx: mpsc::Sender<WindowEvent>,
    latency: Arc<LatencyStats>,
    noise: Arc<NoiseStats>,
    /// token_id → (best_ask, best_bid), in strict message order.
    quotes: HashMap<String, (Decimal, Decimal)>,
    /// market_id → live window.
    windows: HashMap<String, TrackedWindow>,
    ticks_processed: u64,
    windows_opened: u64,
    windows_closed: u64,
    last_diag_at: Instant,
}

impl SpreadDetector {
    pub fn new(
        store: Arc<MarketStore>,
        price_rx: mpsc::Receiver<PriceUpdate>,
        removal_rx: mpsc::Receiver<String>,
        window_tx: mpsc::Sender<WindowEvent>,
        latency: Arc<LatencyStats>,
        noise: Arc<NoiseStats>,
    ) -> Self {
        Self {
            store,
            price_rx,
            removal_rx,
            window_tx,
            latency,
            noise,
            quotes: HashMap::new(),
            windows: HashMap::new(),
            ticks_processed: 0,
            windows_opened: 0,
            windows_closed: 0,
            last_diag_at: Instant::now(),
        }
    }

    pub async fn run(mut self) {
        let mut removals_open = true;
        loop {
            tokio::select! {
                update = self.price_rx.recv() => {
                    match update {
                        Some(update) => self.handle_price(update),
                        None => break,
                    }
                }
                removed = self.removal_rx.recv(), if removals_open => {
                    match removed {
                        Some(market_id) => self.handle_removal(&market_id),
                        None => removals_open = false,
                    }
                }
            }
        }
        info!(
            ticks = self.ticks_processed,
            opened = self.windows_opened,
            closed = self.windows_closed,
            "detector drained"
        );
    }

    /// One tick: update the private cache, resolve the market, decide.
    /// No suspension points; the whole decision is synchronous.
    fn handle_price(&mut self, update: PriceUpdate) {
        self.ticks_processed += 1;
        self.quotes.insert(
            update.token_id.clone(),
            (update.best_ask, update.best_bid),
        );

        // Metadata lookup only; prices come from the private cache.
        let Some((market_id, yes_token, no_token)) = self.store.market_for_token(&update.token_id)
        else {
            // Expected during unsubscribe races.
            debug!(token_id = %update.token_id, "price update for unknown token");
            return;
        };

        // The counterpart side must have arrived through the channel before
        // a spread can be decided.
        let Some(&(yes_ask, _)) = self.quotes.get(&yes_token) else {
            return;
        };
        let Some(&(no_ask, _)) = self.quotes.get(&no_token) else {
            return;
        };
        if yes_ask <= Decimal::ZERO || no_ask <= Decimal::ZERO {
            return;
        }

        let quote = QuotePair::new(yes_ask, no_ask);
        let is_arb = quote.combined < Decimal::ONE;

        let elapsed = update.received_at.elapsed();
        self.latency.record(elapsed);
        self.maybe_log_diagnostics();

        match (is_arb, self.windows.contains_key(&market_id)) {
            (true, false) => {
                debug!(
                    market_id = %market_id,
                    spread = %quote.spread,
                    "window pending"
                );
                self.windows.insert(
                    market_id,
                    TrackedWindow {
                        first_seen_ns: update.received_at_ns,
                        last_seen_ns: update.received_at_ns,
                        tick_count: 1,
                        open: quote,
                        prev_yes_ask: yes_ask,
                        prev_no_ask: no_ask,
                        trade_event_fired: update.trade_fired,
                        volume_change_ticks: u32::from(update.volume_changed),
                        price_shift_ticks: 0,
                        pending: true,
                    },
                );
            }

            (true, true) => {
                let confirm = {
                    // Window is known to exist in this branch.
                    let Some(window) = self.windows.get_mut(&market_id) else {
                        return;
                    };
                    window.tick_count += 1;
                    window.last_seen_ns = update.received_at_ns;

                    if update.trade_fired {
                        window.trade_event_fired = true;
                    }
                    if update.volume_changed {
                        window.volume_change_ticks += 1;
                    }
                    if yes_ask != window.prev_yes_ask || no_ask != window.prev_no_ask {
                        window.price_shift_ticks += 1;
                    }
                    window.prev_yes_ask = yes_ask;
                    window.prev_no_ask = no_ask;

                    if window.pending && window.tick_count >= MIN_ARB_TICKS {
                        window.pending = false;
                        // The confirming tick's quotes are the published open.
                        window.open = quote;
                        true
                    } else {
                        false
                    }
                };

                if confirm {
                    self.windows_opened += 1;
                    let Some(window) = self.windows.get(&market_id) else {
                        return;
                    };
                    info!(
                        market_id = %market_id,
                        yes_ask = %quote.yes_ask,
                        no_ask = %quote.no_ask,
                        spread = %quote.spread,
                        "window open"
                    );
                    self.emit(WindowEvent::Open(WindowOpen {
                        market_id,
                        opened_at_ns: window.first_seen_ns,
                        open: window.open,
                        spread_category: SpreadCategory::from_spread(window.open.spread),
                    }));
                }
            }

            (false, true) => {
                let Some(mut window) = self.windows.remove(&market_id) else {
                    return;
                };
                if window.pending {
                    // Single-tick glitch: discard silently, count as noise.
                    self.noise.record_discard(&market_id);
                    debug!(market_id = %market_id, "pending window discarded");
                    return;
                }

                // Trade/volume on the closing tick still informs the
                // classification; price shift does not: the closing tick
                // almost always moves an ask.
                if update.trade_fired {
                    window.trade_event_fired = true;
                }
                if update.volume_changed {
                    window.volume_change_ticks += 1;
                }

                self.windows_closed += 1;
                let latency_us = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
                self.emit_close(market_id, window, quote, update.received_at_ns, latency_us);
            }

            (false, false) => {}
        }
    }

    /// Market removed mid-window: synthesise a close from the last known
    /// quotes so the Open is always paired.
    fn handle_removal(&mut self, market_id: &str) {
        let Some(window) = self.windows.remove(market_id) else {
            return;
        };
        if window.pending {
            self.noise.record_discard(market_id);
            return;
        }
        info!(market_id = %market_id, "market removed mid-window, synthesising close");
        self.windows_closed += 1;
        let closing = QuotePair::new(window.prev_yes_ask, window.prev_no_ask);
        self.emit_close(market_id.to_string(), window, closing, now_ns(), 0);
    }

    fn emit_close(
        &mut self,
        market_id: String,
        window: TrackedWindow,
        close: QuotePair,
        closed_at_ns: u64,
        detection_latency_us: u64,
    ) {
        let obs = window.observables();
        debug_assert!(window.last_seen_ns >= window.first_seen_ns);
        let (duration_class, reason) = classifier::classify(&obs);
        let Some(close_reason) = reason else {
            // Unreachable for published windows; reset silently in release.
            debug_assert!(false, "published window classified single_tick");
            return;
        };
        let duration_ms =
            closed_at_ns.saturating_sub(window.first_seen_ns) as f64 / 1_000_000.0;

        info!(
            market_id = %market_id,
            duration_ms = format_args!("{duration_ms:.0}"),
            ticks = obs.tick_count,
            close_reason = %close_reason,
            priority = opportunity_class(duration_class, Some(close_reason)),
            "window closed"
        );

        self.emit(WindowEvent::Close(WindowClose {
            market_id,
            opened_at_ns: window.first_seen_ns,
            closed_at_ns,
            duration_ms,
            open: window.open,
            close,
            spread_category: SpreadCategory::from_spread(window.open.spread),
            duration_class,
            close_reason,
            opportunity_class: opportunity_class(duration_class, Some(close_reason)),
            observables: obs,
            detection_latency_us,
        }));
    }

    /// Detection must never block on a slow consumer; a full queue drops the
    /// event with a warning.
    fn emit(&self, event: WindowEvent) {
        if let Err(e) = self.window_tx.try_send(event) {
            warn!(error = %e, "window channel full, dropping event");
        }
    }

    fn maybe_log_diagnostics(&mut self) {
        if self.last_diag_at.elapsed() < Duration::from_secs(30) {
            return;
        }
        self.last_diag_at = Instant::now();
        info!(
            ticks = self.ticks_processed,
            opened = self.windows_opened,
            closed = self.windows_closed,
            live = self.windows.len(),
            hydrated = self.store.hydrated_count(),
            "detector diagnostics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CloseReason, DurationClass};
    use crate::market::Market;
    use rust_decimal_macros::dec;

    struct Harness {
        detector: SpreadDetector,
        window_rx: mpsc::Receiver<WindowEvent>,
        noise: Arc<NoiseStats>,
        clock_ns: u64,
    }

    impl Harness {
        /// Feed one price message. Scenario ticks are single messages: a
        /// side whose price did not change produces no message.
        fn update(&mut self, token: &str, ask: Decimal, trade: bool) {
            self.clock_ns += 1_000_000;
            self.detector.handle_price(PriceUpdate {
                token_id: token.to_string(),
                best_ask: ask,
                best_bid: ask - dec!(0.01),
                received_at: Instant::now(),
                received_at_ns: self.clock_ns,
                trade_fired: trade,
                volume_changed: trade,
            });
        }

        fn events(&mut self) -> Vec<WindowEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.window_rx.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn harness() -> Harness {
        let store = MarketStore::new();
        store.insert_market(Market {
            id: "m1".to_string(),
            question: "Test market".to_string(),
            category: "other".to_string(),
            slug: None,
            end_date_iso: None,
            volume_24h: 0.0,
            liquidity: 0.0,
            yes_token_id: "yes1".to_string(),
            no_token_id: "no1".to_string(),
        });

        let (_price_tx, price_rx) = mpsc::channel(16);
        let (_removal_tx, removal_rx) = mpsc::channel(16);
        let (window_tx, window_rx) = mpsc::channel(16);
        let noise = Arc::new(NoiseStats::new());
        let detector = SpreadDetector::new(
            store,
            price_rx,
            removal_rx,
            window_tx,
            Arc::new(LatencyStats::new()),
            Arc::clone(&noise),
        );
        Harness {
            detector,
            window_rx,
            noise,
            clock_ns: 1_000,
        }
    }

    #[test]
    fn single_tick_glitch_emits_nothing() {
        let mut h = harness();
        // S1: (0.48, 0.49) for one tick, then yes jumps to 0.52.
        h.update("no1", dec!(0.49), false);
        h.update("yes1", dec!(0.48), false);
        h.update("yes1", dec!(0.52), false);

        assert!(h.events().is_empty(), "no events for a single-tick glitch");
        assert_eq!(h.noise.discards("m1"), 1);
    }

    #[test]
    fn gradual_volume_window_opens_and_closes() {
        let mut h = harness();
        // S2: (0.45,0.50) no-trade, (0.45,0.49) trade+vol, (0.45,0.49)
        // trade+vol, (0.47,0.54) no-trade.
        h.update("no1", dec!(0.50), false);
        h.update("yes1", dec!(0.45), false);
        h.update("no1", dec!(0.49), true);
        h.update("yes1", dec!(0.45), true);
        h.update("no1", dec!(0.54), false);
        h.update("yes1", dec!(0.47), false);

        let events = h.events();
        assert_eq!(events.len(), 2);
        let WindowEvent::Open(open) = &events[0] else {
            panic!("expected Open first, got {:?}", events[0]);
        };
        // Published with the confirming tick's quotes.
        assert_eq!(open.open.spread, dec!(0.06));
        assert_eq!(open.spread_category, SpreadCategory::Medium);

        let WindowEvent::Close(close) = &events[1] else {
            panic!("expected Close second, got {:?}", events[1]);
        };
        assert_eq!(close.market_id, "m1");
        assert_eq!(close.opened_at_ns, open.opened_at_ns);
        assert!(close.closed_at_ns >= close.opened_at_ns);
        assert_eq!(close.duration_class, DurationClass::MultiTick);
        assert_eq!(close.close_reason, CloseReason::VolumeSpikeGradual);
        assert_eq!(close.opportunity_class, 1);
        assert!(close.observables.tick_count >= MIN_ARB_TICKS);
        assert!(close.observables.volume_change_ticks > 1);
        assert_eq!(close.close.combined, dec!(1.01));
        let expected_ms = (close.closed_at_ns - close.opened_at_ns) as f64 / 1_000_000.0;
        assert!((close.duration_ms - expected_ms).abs() < f64::EPSILON);
    }

    #[test]
    fn price_drift_close_is_priority_two() {
        let mut h = harness();
        // S3: (0.46,0.49), (0.46,0.49), (0.47,0.49), (0.48,0.53); no trades.
        h.update("no1", dec!(0.49), false);
        h.update("yes1", dec!(0.46), false);
        h.update("yes1", dec!(0.46), false);
        h.update("yes1", dec!(0.47), false);
        h.update("no1", dec!(0.53), false);

        let events = h.events();
        assert_eq!(events.len(), 2);
        let WindowEvent::Close(close) = &events[1] else {
            panic!("expected Close");
        };
        assert_eq!(close.close_reason, CloseReason::PriceDrift);
        assert_eq!(close.opportunity_class, 2);
        // 0.47 + 0.53 == 1.00 exactly: equality is non-arb.
        assert_eq!(close.close.combined, dec!(1.00));
    }

    #[test]
    fn trade_on_closing_tick_is_instant_spike() {
        let mut h = harness();
        // S4: steady (0.44, 0.48), trade only on the tick that kills it.
        h.update("no1", dec!(0.48), false);
        h.update("yes1", dec!(0.44), false);
        h.update("yes1", dec!(0.44), false);
        h.update("yes1", dec!(0.44), false);
        h.update("yes1", dec!(0.55), true);

        let events = h.events();
        let WindowEvent::Close(close) = events.last().expect("close event") else {
            panic!("expected Close");
        };
        assert_eq!(close.observables.volume_change_ticks, 1);
        assert_eq!(close.close_reason, CloseReason::VolumeSpikeInstant);
        assert_eq!(close.opportunity_class, 3);
    }

    #[test]
    fn steady_quotes_without_trades_vanish() {
        let mut h = harness();
        h.update("no1", dec!(0.48), false);
        h.update("yes1", dec!(0.44), false);
        h.update("yes1", dec!(0.44), false);
        // Resting NO ask pulled without any trade.
        h.update("no1", dec!(0.60), false);

        let events = h.events();
        let WindowEvent::Close(close) = events.last().expect("close event") else {
            panic!("expected Close");
        };
        assert_eq!(close.close_reason, CloseReason::OrderVanished);
        assert_eq!(close.opportunity_class, 4);
    }

    #[test]
    fn removal_mid_window_synthesises_one_close() {
        let mut h = harness();
        // S5: S3 through its third tick, then the market is removed.
        h.update("no1", dec!(0.49), false);
        h.update("yes1", dec!(0.46), false);
        h.update("yes1", dec!(0.46), false);
        h.update("yes1", dec!(0.47), false);
        h.detector.handle_removal("m1");

        let events = h.events();
        assert_eq!(events.len(), 2);
        let WindowEvent::Close(close) = &events[1] else {
            panic!("expected Close");
        };
        // Last-known quotes, classified from observables at removal time.
        assert_eq!(close.close.yes_ask, dec!(0.47));
        assert_eq!(close.close.no_ask, dec!(0.49));
        assert_eq!(close.close_reason, CloseReason::PriceDrift);
        assert_eq!(close.detection_latency_us, 0);

        // Removal is idempotent: no second close.
        h.detector.handle_removal("m1");
        assert!(h.events().is_empty());
    }

    #[test]
    fn unchanged_replay_after_open_emits_no_duplicate_open() {
        let mut h = harness();
        h.update("no1", dec!(0.50), false);
        h.update("yes1", dec!(0.45), false);
        h.update("yes1", dec!(0.45), false);
        assert_eq!(h.events().len(), 1, "window confirmed");

        // S6: reconnect replays an identical book snapshot mid-window.
        h.update("no1", dec!(0.50), false);
        h.update("yes1", dec!(0.45), false);
        assert!(h.events().is_empty(), "no duplicate Open on identical replay");

        h.update("yes1", dec!(0.51), false);
        let events = h.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], WindowEvent::Close(_)));
    }

    #[test]
    fn replaying_the_same_sequence_is_deterministic() {
        let sequence: &[(&str, Decimal, bool)] = &[
            ("no1", dec!(0.49), false),
            ("yes1", dec!(0.46), false),
            ("yes1", dec!(0.46), true),
            ("yes1", dec!(0.47), false),
            ("no1", dec!(0.55), false),
            ("yes1", dec!(0.44), false),
            ("no1", dec!(0.48), false),
            ("no1", dec!(0.61), true),
        ];

        let run = || {
            let mut h = harness();
            for &(token, ask, trade) in sequence {
                h.update(token, ask, trade);
            }
            h.events()
                .into_iter()
                .map(|e| match e {
                    WindowEvent::Open(o) => format!("open:{}", o.open.spread),
                    WindowEvent::Close(c) => {
                        format!("close:{}:{}", c.close_reason, c.observables.tick_count)
                    }
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn half_hydrated_market_never_decides() {
        let mut h = harness();
        h.update("yes1", dec!(0.10), false);
        h.update("yes1", dec!(0.10), false);
        assert!(h.events().is_empty());
    }
}
