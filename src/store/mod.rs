//! Concurrent in-memory market directory.
//!
//! Owns market metadata, the token→market reverse map, per-token order
//! books, and the cached best prices the rest of the scanner reads. Book
//! mutations serialise per token through the map's entry locks; there is no
//! global lock on the hot path.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;

use crate::market::Market;
use crate::orderbook::{BookDelta, OrderBook};

/// Cached best prices for a hydrated token (both sides observed).
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub best_ask: Decimal,
    pub best_bid: Decimal,
}

#[derive(Debug, Clone)]
struct TokenRef {
    market_id: String,
}

/// Inputs for one spread computation, resolved from either token of a market.
#[derive(Debug, Clone)]
pub struct SpreadInputs {
    pub market_id: String,
    pub yes_ask: Decimal,
    pub no_ask: Decimal,
    pub yes_bid: Decimal,
    pub no_bid: Decimal,
}

#[derive(Default)]
pub struct MarketStore {
    /// market_id → metadata
    markets: DashMap<String, Market>,
    /// token_id → owning market
    token_index: DashMap<String, TokenRef>,
    /// token_id → live order book
    books: DashMap<String, OrderBook>,
    /// token_id → cached best prices, set once both sides are observed
    quotes: DashMap<String, Quote>,
    /// market_ids exempt from removal by the regular refresh cycle
    pinned: DashSet<String>,
}

impl MarketStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_market(&self, market: Market) {
        let market_ref = TokenRef {
            market_id: market.id.clone(),
        };
        self.token_index
            .insert(market.yes_token_id.clone(), market_ref.clone());
        self.token_index
            .insert(market.no_token_id.clone(), market_ref);
        self.books
            .entry(market.yes_token_id.clone())
            .or_default();
        self.books.entry(market.no_token_id.clone()).or_default();
        self.markets.insert(market.id.clone(), market);
    }

    pub fn remove_market(&self, market_id: &str) {
        if let Some((_, market)) = self.markets.remove(market_id) {
            for token in [&market.yes_token_id, &market.no_token_id] {
                self.token_index.remove(token);
                self.books.remove(token);
                self.quotes.remove(token);
            }
        }
        self.pinned.remove(market_id);
    }

    pub fn contains_market(&self, market_id: &str) -> bool {
        self.markets.contains_key(market_id)
    }

    pub fn pin_market(&self, market_id: &str) {
        self.pinned.insert(market_id.to_string());
    }

    pub fn is_pinned(&self, market_id: &str) -> bool {
        self.pinned.contains(market_id)
    }

    /// Replace a token's book from a full snapshot and refresh the cached
    /// quote. Returns the new quote once both sides are populated.
    pub fn apply_book_snapshot(
        &self,
        token_id: &str,
        asks: &[(Decimal, Decimal)],
        bids: &[(Decimal, Decimal)],
    ) -> Option<Quote> {
        if !self.token_index.contains_key(token_id) {
            return None;
        }
        let mut book = self.books.entry(token_id.to_string()).or_default();
        book.apply_snapshot(asks, bids);
        let best = (book.best_ask(), book.best_bid());
        drop(book);
        self.refresh_quote(token_id, best)
    }

    /// Apply incremental level changes and refresh the cached quote.
    pub fn apply_book_deltas(&self, token_id: &str, deltas: &[BookDelta]) -> Option<Quote> {
        if !self.token_index.contains_key(token_id) {
            return None;
        }
        let mut book = self.books.entry(token_id.to_string()).or_default();
        book.apply_deltas(deltas);
        let best = (book.best_ask(), book.best_bid());
        drop(book);
        self.refresh_quote(token_id, best)
    }

    /// A side emptied by deltas leaves the previous quote cached rather than
    /// poisoning it with a missing best.
    fn refresh_quote(
        &self,
        token_id: &str,
        best: (Option<Decimal>, Option<Decimal>),
    ) -> Option<Quote> {
        let (Some(best_ask), Some(best_bid)) = best else {
            return None;
        };
        let quote = Quote { best_ask, best_bid };
        self.quotes.insert(token_id.to_string(), quote);
        Some(quote)
    }

    /// Cached best prices for a token, if hydrated.
    pub fn quote(&self, token_id: &str) -> Option<Quote> {
        self.quotes.get(token_id).map(|q| *q)
    }

    /// Spread inputs for the market owning `token_id`; None until both of
    /// the market's tokens are hydrated.
    pub fn spread_inputs(&self, token_id: &str) -> Option<SpreadInputs> {
        let market_id = self.token_index.get(token_id)?.market_id.clone();
        let market = self.markets.get(&market_id)?;
        let yes = self.quote(&market.yes_token_id)?;
        let no = self.quote(&market.no_token_id)?;
        Some(SpreadInputs {
            market_id,
            yes_ask: yes.best_ask,
            no_ask: no.best_ask,
            yes_bid: yes.best_bid,
            no_bid: no.best_bid,
        })
    }

    /// `(market_id, yes_token_id, no_token_id)` for the market owning
    /// `token_id`, without touching any price state.
    pub fn market_for_token(&self, token_id: &str) -> Option<(String, String, String)> {
        let market_id = self.token_index.get(token_id)?.market_id.clone();
        let market = self.markets.get(&market_id)?;
        Some((
            market_id,
            market.yes_token_id.clone(),
            market.no_token_id.clone(),
        ))
    }

    pub fn market(&self, market_id: &str) -> Option<Market> {
        self.markets.get(market_id).map(|m| m.clone())
    }

    /// `[yes_token_id, no_token_id]` for a market, used to build
    /// unsubscribe commands before the market leaves the store.
    pub fn tokens_for_market(&self, market_id: &str) -> Option<Vec<String>> {
        let market = self.markets.get(market_id)?;
        Some(vec![
            market.yes_token_id.clone(),
            market.no_token_id.clone(),
        ])
    }

    pub fn all_token_ids(&self) -> Vec<String> {
        self.token_index.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all_market_ids(&self) -> Vec<String> {
        self.markets.iter().map(|e| e.key().clone()).collect()
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    /// Markets where both outcome tokens have cached quotes.
    pub fn hydrated_count(&self) -> usize {
        self.markets
            .iter()
            .filter(|entry| {
                let m = entry.value();
                self.quotes.contains_key(&m.yes_token_id) && self.quotes.contains_key(&m.no_token_id)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::Side;
    use rust_decimal_macros::dec;

    fn test_market() -> Market {
        Market {
            id: "m1".to_string(),
            question: "Will it settle YES?".to_string(),
            category: "crypto".to_string(),
            slug: None,
            end_date_iso: None,
            volume_24h: 0.0,
            liquidity: 0.0,
            yes_token_id: "yes1".to_string(),
            no_token_id: "no1".to_string(),
        }
    }

    #[test]
    fn snapshot_hydrates_quote() {
        let store = MarketStore::new();
        store.insert_market(test_market());

        let quote = store
            .apply_book_snapshot(
                "yes1",
                &[(dec!(0.55), dec!(100))],
                &[(dec!(0.54), dec!(200))],
            )
            .expect("both sides present");
        assert_eq!(quote.best_ask, dec!(0.55));
        assert_eq!(quote.best_bid, dec!(0.54));
    }

    #[test]
    fn one_sided_snapshot_does_not_hydrate() {
        let store = MarketStore::new();
        store.insert_market(test_market());

        assert!(store
            .apply_book_snapshot("yes1", &[(dec!(0.55), dec!(100))], &[])
            .is_none());
        assert!(store.quote("yes1").is_none());
    }

    #[test]
    fn delta_removing_best_ask_moves_it_up() {
        let store = MarketStore::new();
        store.insert_market(test_market());
        store.apply_book_snapshot(
            "yes1",
            &[(dec!(0.55), dec!(100)), (dec!(0.60), dec!(50))],
            &[(dec!(0.50), dec!(10))],
        );

        let quote = store
            .apply_book_deltas(
                "yes1",
                &[BookDelta {
                    price: dec!(0.55),
                    side: Side::Sell,
                    size: dec!(0),
                }],
            )
            .expect("quote after delta");
        assert_eq!(quote.best_ask, dec!(0.60));
        assert!(quote.best_ask >= quote.best_bid);
    }

    #[test]
    fn emptied_side_keeps_previous_quote_cached() {
        let store = MarketStore::new();
        store.insert_market(test_market());
        store.apply_book_snapshot("yes1", &[(dec!(0.55), dec!(5))], &[(dec!(0.50), dec!(5))]);

        let result = store.apply_book_deltas(
            "yes1",
            &[BookDelta {
                price: dec!(0.55),
                side: Side::Sell,
                size: dec!(0),
            }],
        );
        assert!(result.is_none());
        // Stale but intact; the detector keeps deciding on the last snapshot.
        assert_eq!(store.quote("yes1").unwrap().best_ask, dec!(0.55));
    }

    #[test]
    fn unknown_token_is_rejected() {
        let store = MarketStore::new();
        store.insert_market(test_market());
        assert!(store
            .apply_book_snapshot("mystery", &[(dec!(0.55), dec!(1))], &[(dec!(0.50), dec!(1))])
            .is_none());
    }

    #[test]
    fn spread_inputs_require_both_tokens_hydrated() {
        let store = MarketStore::new();
        store.insert_market(test_market());

        store.apply_book_snapshot("yes1", &[(dec!(0.55), dec!(10))], &[(dec!(0.53), dec!(10))]);
        assert!(store.spread_inputs("yes1").is_none());

        store.apply_book_snapshot("no1", &[(dec!(0.46), dec!(10))], &[(dec!(0.44), dec!(10))]);
        let inputs = store.spread_inputs("yes1").expect("hydrated market");
        assert_eq!(inputs.market_id, "m1");
        assert_eq!(inputs.yes_ask, dec!(0.55));
        assert_eq!(inputs.no_ask, dec!(0.46));
        assert_eq!(store.hydrated_count(), 1);
    }

    #[test]
    fn remove_market_clears_reverse_map_and_quotes() {
        let store = MarketStore::new();
        store.insert_market(test_market());
        store.apply_book_snapshot("yes1", &[(dec!(0.55), dec!(10))], &[(dec!(0.53), dec!(10))]);

        store.remove_market("m1");
        assert!(store.market_for_token("yes1").is_none());
        assert!(store.quote("yes1").is_none());
        assert_eq!(store.market_count(), 0);
    }
}
