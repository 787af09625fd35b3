//! Typed row models for sqlx reads.

use serde::Serialize;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MarketRow {
    pub id: String,
    pub question: String,
    pub category: Option<String>,
    pub end_date_iso: Option<String>,
    pub volume_24h: Option<f64>,
    pub liquidity: Option<f64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct WindowRow {
    pub id: i64,
    pub market_id: String,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
    pub duration_ms: Option<f64>,
    pub open_yes_ask: f64,
    pub open_no_ask: f64,
    pub open_combined: f64,
    pub open_spread: f64,
    pub close_yes_ask: Option<f64>,
    pub close_no_ask: Option<f64>,
    pub close_combined: Option<f64>,
    pub close_spread: Option<f64>,
    pub spread_category: String,
    pub open_duration_class: Option<String>,
    pub close_reason: Option<String>,
    pub tick_count: i64,
    pub trade_event_fired: i64,
    pub volume_change_ticks: i64,
    pub price_shifted: i64,
    pub opportunity_class: Option<i64>,
    pub detection_latency_us: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MarketStatsRow {
    pub market_id: String,
    pub windows_24h: i64,
    pub class1_count: i64,
    pub class2_count: i64,
    pub avg_duration_ms: Option<f64>,
    pub avg_spread: Option<f64>,
    pub max_spread: Option<f64>,
    pub noise_ratio: Option<f64>,
    pub opportunity_score: Option<f64>,
    pub last_updated: i64,
}

/// markets LEFT JOIN market_stats, for the /markets listing.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MarketWithStatsRow {
    pub id: String,
    pub question: String,
    pub category: Option<String>,
    pub end_date_iso: Option<String>,
    pub windows_24h: Option<i64>,
    pub class1_count: Option<i64>,
    pub class2_count: Option<i64>,
    pub avg_duration_ms: Option<f64>,
    pub avg_spread: Option<f64>,
    pub noise_ratio: Option<f64>,
    pub opportunity_score: Option<f64>,
}
