//! Market-channel frame parsing.
//!
//! Frames arrive either as a single JSON object or an array of objects.
//! Three event kinds matter: `book` (full snapshot), `price_change`
//! (level deltas), and `last_trade_price`. Everything else is ignored;
//! frames that fail to parse are dropped with a counter increment.

use std::sync::atomic::{AtomicU64, Ordering};

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::orderbook::{BookDelta, Side};

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

pub fn parse_failures() -> u64 {
    PARSE_FAILURES.load(Ordering::Relaxed)
}

/// A price level as it appears on the wire (decimal strings).
#[derive(Debug, Deserialize, Clone)]
pub struct WireLevel {
    pub price: String,
    pub size: String,
}

/// One entry of a `price_change` frame's `changes` array.
#[derive(Debug, Deserialize, Clone)]
pub struct WireDelta {
    pub price: String,
    /// "SELL" = ask side, "BUY" = bid side.
    pub side: String,
    pub size: String,
}

/// Raw superset of all market-channel messages; each event type carries a
/// different subset of fields.
#[derive(Debug, Deserialize)]
struct RawFrame {
    event_type: Option<String>,
    asset_id: Option<String>,
    asks: Option<Vec<WireLevel>>,
    bids: Option<Vec<WireLevel>>,
    changes: Option<Vec<WireDelta>>,
    size: Option<String>,
}

/// Parsed event from one frame object.
#[derive(Debug)]
pub enum FeedEvent {
    Snapshot {
        token_id: String,
        asks: Vec<(Decimal, Decimal)>,
        bids: Vec<(Decimal, Decimal)>,
    },
    Deltas {
        token_id: String,
        deltas: Vec<BookDelta>,
    },
    Trade {
        token_id: String,
        size: Decimal,
    },
}

/// Parse a raw text frame into zero or more events.
pub fn parse_frame(raw: &str) -> Vec<FeedEvent> {
    let frames: Vec<RawFrame> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        match serde_json::from_str::<RawFrame>(raw) {
            Ok(frame) => vec![frame],
            Err(_) => vec![],
        }
    };

    if frames.is_empty() {
        let count = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 10 || count % 1000 == 0 {
            let sample = &raw[..raw.len().min(300)];
            warn!(count, sample, "unparseable feed frame");
        }
        return vec![];
    }

    frames.into_iter().filter_map(expand).collect()
}

fn expand(frame: RawFrame) -> Option<FeedEvent> {
    let token_id = frame.asset_id?;
    match frame.event_type.as_deref() {
        Some("book") => Some(FeedEvent::Snapshot {
            token_id,
            asks: parse_levels(frame.asks.unwrap_or_default()),
            bids: parse_levels(frame.bids.unwrap_or_default()),
        }),
        Some("price_change") => {
            let deltas: Vec<BookDelta> = frame
                .changes
                .unwrap_or_default()
                .into_iter()
                .filter_map(parse_delta)
                .collect();
            if deltas.is_empty() {
                return None;
            }
            Some(FeedEvent::Deltas { token_id, deltas })
        }
        Some("last_trade_price") => {
            let size = frame.size.as_deref().and_then(|s| s.parse().ok())?;
            Some(FeedEvent::Trade { token_id, size })
        }
        _ => None,
    }
}

fn parse_levels(levels: Vec<WireLevel>) -> Vec<(Decimal, Decimal)> {
    levels
        .into_iter()
        .filter_map(|l| Some((l.price.parse().ok()?, l.size.parse().ok()?)))
        .collect()
}

fn parse_delta(change: WireDelta) -> Option<BookDelta> {
    let side = match change.side.as_str() {
        "SELL" => Side::Sell,
        "BUY" => Side::Buy,
        _ => return None,
    };
    Some(BookDelta {
        price: change.price.parse().ok()?,
        side,
        size: change.size.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_book_snapshot() {
        let raw = r#"{"event_type":"book","asset_id":"tok1","asks":[{"price":"0.55","size":"100"}],"bids":[{"price":"0.54","size":"200"}]}"#;
        let events = parse_frame(raw);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::Snapshot { token_id, asks, bids } => {
                assert_eq!(token_id, "tok1");
                assert_eq!(asks, &[(dec!(0.55), dec!(100))]);
                assert_eq!(bids, &[(dec!(0.54), dec!(200))]);
            }
            other => panic!("expected Snapshot, got {other:?}"),
        }
    }

    #[test]
    fn parses_price_change_deltas() {
        let raw = r#"{"event_type":"price_change","asset_id":"tok1","changes":[{"price":"0.55","side":"SELL","size":"0"},{"price":"0.54","side":"BUY","size":"25"}]}"#;
        let events = parse_frame(raw);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::Deltas { token_id, deltas } => {
                assert_eq!(token_id, "tok1");
                assert_eq!(deltas.len(), 2);
                assert_eq!(deltas[0].side, Side::Sell);
                assert_eq!(deltas[0].size, dec!(0));
                assert_eq!(deltas[1].side, Side::Buy);
                assert_eq!(deltas[1].price, dec!(0.54));
            }
            other => panic!("expected Deltas, got {other:?}"),
        }
    }

    #[test]
    fn parses_last_trade() {
        let raw = r#"{"event_type":"last_trade_price","asset_id":"tok1","price":"0.57","size":"40"}"#;
        let events = parse_frame(raw);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FeedEvent::Trade { token_id, size } => {
                assert_eq!(token_id, "tok1");
                assert_eq!(*size, dec!(40));
            }
            other => panic!("expected Trade, got {other:?}"),
        }
    }

    #[test]
    fn array_frame_yields_multiple_events() {
        let raw = r#"[{"event_type":"book","asset_id":"a","asks":[],"bids":[]},{"event_type":"last_trade_price","asset_id":"b","size":"1"}]"#;
        let events = parse_frame(raw);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        let raw = r#"{"event_type":"tick_size_change","asset_id":"tok1"}"#;
        assert!(parse_frame(raw).is_empty());
    }

    #[test]
    fn unknown_side_is_skipped() {
        let raw = r#"{"event_type":"price_change","asset_id":"tok1","changes":[{"price":"0.55","side":"HOLD","size":"10"}]}"#;
        assert!(parse_frame(raw).is_empty());
    }

    #[test]
    fn garbage_increments_failure_counter() {
        let before = parse_failures();
        assert!(parse_frame("not json at all").is_empty());
        assert!(parse_failures() > before);
    }
}
