//! Per-token order book maintained from feed snapshots and deltas.
//!
//! Best prices are always derived from the local ladder, never taken from a
//! transport field that could be stale.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

/// Which side of the book a level or delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

/// One side of the ladder. Keys are prices quantised to four decimal places;
/// every stored level has size > 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookSide {
    levels: BTreeMap<Decimal, Decimal>,
}

/// Quantise a price to the book's four-decimal tick grid.
fn quantise(price: Decimal) -> Decimal {
    price.round_dp(4)
}

impl BookSide {
    /// Best price: minimum for asks, maximum for bids.
    pub fn best(&self, is_bid: bool) -> Option<Decimal> {
        if is_bid {
            self.levels.keys().next_back().copied()
        } else {
            self.levels.keys().next().copied()
        }
    }

    pub fn replace(&mut self, levels: &[(Decimal, Decimal)]) {
        self.levels.clear();
        for &(price, size) in levels {
            if size > Decimal::ZERO {
                self.levels.insert(quantise(price), size);
            }
        }
    }

    /// size == 0 deletes the level, anything else sets it.
    pub fn apply(&mut self, price: Decimal, size: Decimal) {
        let key = quantise(price);
        if size == Decimal::ZERO {
            self.levels.remove(&key);
        } else {
            self.levels.insert(key, size);
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// A single (price, side, size) change from the feed.
#[derive(Debug, Clone, Copy)]
pub struct BookDelta {
    pub price: Decimal,
    pub side: Side,
    pub size: Decimal,
}

/// Full order book for one outcome token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBook {
    pub asks: BookSide,
    pub bids: BookSide,
}

impl OrderBook {
    /// Replace the whole book from a snapshot. Zero-size levels are skipped.
    pub fn apply_snapshot(&mut self, asks: &[(Decimal, Decimal)], bids: &[(Decimal, Decimal)]) {
        self.asks.replace(asks);
        self.bids.replace(bids);
    }

    pub fn apply_deltas(&mut self, deltas: &[BookDelta]) {
        for delta in deltas {
            match delta.side {
                Side::Sell => self.asks.apply(delta.price, delta.size),
                Side::Buy => self.bids.apply(delta.price, delta.size),
            }
        }
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.best(false)
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.best(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn delta(price: Decimal, side: Side, size: Decimal) -> BookDelta {
        BookDelta { price, side, size }
    }

    #[test]
    fn snapshot_sets_best_prices() {
        let mut book = OrderBook::default();
        book.apply_snapshot(
            &[(dec!(0.55), dec!(100)), (dec!(0.60), dec!(50))],
            &[(dec!(0.54), dec!(200)), (dec!(0.50), dec!(75))],
        );
        assert_eq!(book.best_ask(), Some(dec!(0.55)));
        assert_eq!(book.best_bid(), Some(dec!(0.54)));
    }

    #[test]
    fn snapshot_skips_zero_size_levels() {
        let mut book = OrderBook::default();
        book.apply_snapshot(&[(dec!(0.55), dec!(0)), (dec!(0.60), dec!(50))], &[]);
        assert_eq!(book.best_ask(), Some(dec!(0.60)));
        assert_eq!(book.asks.len(), 1);
    }

    #[test]
    fn zero_size_delta_removes_level() {
        let mut book = OrderBook::default();
        book.apply_snapshot(&[(dec!(0.55), dec!(100)), (dec!(0.60), dec!(50))], &[]);
        book.apply_deltas(&[delta(dec!(0.55), Side::Sell, dec!(0))]);
        assert_eq!(book.best_ask(), Some(dec!(0.60)));
    }

    #[test]
    fn bid_delta_updates_best_bid() {
        let mut book = OrderBook::default();
        book.apply_snapshot(&[], &[(dec!(0.50), dec!(10))]);
        book.apply_deltas(&[delta(dec!(0.52), Side::Buy, dec!(25))]);
        assert_eq!(book.best_bid(), Some(dec!(0.52)));
    }

    #[test]
    fn prices_quantise_to_four_decimals() {
        let mut book = OrderBook::default();
        book.apply_deltas(&[delta(dec!(0.55001), Side::Sell, dec!(10))]);
        // 0.55001 and 0.5500 land on the same tick; the delete must find it.
        book.apply_deltas(&[delta(dec!(0.5500), Side::Sell, dec!(0))]);
        assert!(book.asks.is_empty());
    }

    #[test]
    fn best_ask_not_below_best_bid_after_crossing_delta_resolves() {
        let mut book = OrderBook::default();
        book.apply_snapshot(&[(dec!(0.56), dec!(10))], &[(dec!(0.54), dec!(10))]);
        // Ask replaced at a higher level, bid lifted: both sides stay ordered.
        book.apply_deltas(&[
            delta(dec!(0.56), Side::Sell, dec!(0)),
            delta(dec!(0.58), Side::Sell, dec!(5)),
            delta(dec!(0.55), Side::Buy, dec!(5)),
        ]);
        let (ask, bid) = (book.best_ask().unwrap(), book.best_bid().unwrap());
        assert!(ask >= bid, "ask {ask} crossed below bid {bid}");
    }

    #[test]
    fn snapshot_after_deltas_converges_to_snapshot_alone() {
        // apply(b); apply(deltas); apply(b') == apply(b')
        let b: &[(Decimal, Decimal)] = &[(dec!(0.55), dec!(100)), (dec!(0.57), dec!(30))];
        let b2: &[(Decimal, Decimal)] = &[(dec!(0.52), dec!(40)), (dec!(0.59), dec!(10))];

        let mut via_deltas = OrderBook::default();
        via_deltas.apply_snapshot(b, &[]);
        via_deltas.apply_deltas(&[
            delta(dec!(0.55), Side::Sell, dec!(0)),
            delta(dec!(0.61), Side::Sell, dec!(12)),
            delta(dec!(0.48), Side::Buy, dec!(77)),
        ]);
        via_deltas.apply_snapshot(b2, &[]);

        let mut direct = OrderBook::default();
        direct.apply_snapshot(b2, &[]);

        assert_eq!(via_deltas, direct);
    }
}
