//! HTTP query and push surface.
//!
//! Read-only views over the scanner's state and persisted windows:
//!   GET /health              → feed/store/writer health gauges
//!   GET /markets             → markets with rolling stats
//!   GET /markets/:id/windows → windows for one market
//!   GET /windows/recent      → latest closed windows
//!   GET /windows/open        → windows with no close yet
//!   GET /stats/latency       → detection latency percentiles
//!   GET /ws/windows          → live window-event push stream

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::db::models::{MarketWithStatsRow, WindowRow};
use crate::events::WindowEvent;
use crate::metrics::{HealthState, LatencyStats};
use crate::store::MarketStore;
use crate::ws::messages::parse_failures;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub store: Arc<MarketStore>,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub events: broadcast::Sender<WindowEvent>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/markets", get(get_markets))
        .route("/markets/:id/windows", get(get_market_windows))
        .route("/windows/recent", get(get_recent_windows))
        .route("/windows/open", get(get_open_windows))
        .route("/stats/latency", get(get_latency))
        .route("/ws/windows", get(ws_windows))
        .with_state(state)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

// --- Handlers ---

async fn get_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let p99_us = state.latency.percentiles().map(|(_, _, p99)| p99);
    Json(serde_json::json!({
        "feed_connected": state.health.feed_connected(),
        "markets_tracked": state.store.market_count(),
        "hydrated_markets": state.store.hydrated_count(),
        "pending_writes": state.health.pending_writes(),
        "opens_dropped": state.health.opens_dropped(),
        "frames_unparseable": parse_failures(),
        "last_window_at_ns": state.health.last_window_at_ns(),
        "p99_latency_us": p99_us,
    }))
}

#[derive(Deserialize)]
struct MarketsQuery {
    category: Option<String>,
    min_score: Option<f64>,
}

async fn get_markets(
    State(state): State<ApiState>,
    Query(params): Query<MarketsQuery>,
) -> Result<Json<Vec<MarketWithStatsRow>>, ApiError> {
    let rows = sqlx::query_as::<_, MarketWithStatsRow>(
        r#"
        SELECT m.id, m.question, m.category, m.end_date_iso,
               s.windows_24h, s.class1_count, s.class2_count,
               s.avg_duration_ms, s.avg_spread, s.noise_ratio,
               s.opportunity_score
        FROM markets m
        LEFT JOIN market_stats s ON m.id = s.market_id
        WHERE COALESCE(s.opportunity_score, 0.0) >= ?
        ORDER BY s.opportunity_score DESC
        "#,
    )
    .bind(params.min_score.unwrap_or(0.0))
    .fetch_all(&state.pool)
    .await?;

    let rows = match params.category {
        Some(category) => rows
            .into_iter()
            .filter(|r| r.category.as_deref() == Some(category.as_str()))
            .collect(),
        None => rows,
    };
    Ok(Json(rows))
}

#[derive(Deserialize)]
struct MarketWindowsQuery {
    limit: Option<i64>,
    since: Option<i64>,
}

async fn get_market_windows(
    State(state): State<ApiState>,
    Path(market_id): Path<String>,
    Query(params): Query<MarketWindowsQuery>,
) -> Result<Json<Vec<WindowRow>>, ApiError> {
    let rows = sqlx::query_as::<_, WindowRow>(
        r#"
        SELECT * FROM windows
        WHERE market_id = ? AND opened_at > ?
        ORDER BY opened_at DESC
        LIMIT ?
        "#,
    )
    .bind(&market_id)
    .bind(params.since.unwrap_or(0))
    .bind(params.limit.unwrap_or(100))
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
struct RecentWindowsQuery {
    limit: Option<i64>,
    min_spread: Option<f64>,
}

async fn get_recent_windows(
    State(state): State<ApiState>,
    Query(params): Query<RecentWindowsQuery>,
) -> Result<Json<Vec<WindowRow>>, ApiError> {
    let rows = sqlx::query_as::<_, WindowRow>(
        r#"
        SELECT * FROM windows
        WHERE closed_at IS NOT NULL AND open_spread >= ?
        ORDER BY opened_at DESC
        LIMIT ?
        "#,
    )
    .bind(params.min_spread.unwrap_or(0.0))
    .bind(params.limit.unwrap_or(50))
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

async fn get_open_windows(
    State(state): State<ApiState>,
) -> Result<Json<Vec<WindowRow>>, ApiError> {
    let rows = sqlx::query_as::<_, WindowRow>(
        "SELECT * FROM windows WHERE closed_at IS NULL ORDER BY opened_at DESC",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

async fn get_latency(State(state): State<ApiState>) -> Json<serde_json::Value> {
    match state.latency.percentiles() {
        Some((p50, p95, p99)) => Json(serde_json::json!({
            "samples": state.latency.sample_count(),
            "p50_us": p50,
            "p95_us": p95,
            "p99_us": p99,
        })),
        None => Json(serde_json::json!({
            "samples": 0,
            "p50_us": null,
            "p95_us": null,
            "p99_us": null,
        })),
    }
}

/// Live window-event push. Each subscriber gets its own lagging buffer; a
/// subscriber that falls behind skips missed events rather than slowing the
/// producer.
async fn ws_windows(
    State(state): State<ApiState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let rx = state.events.subscribe();
    upgrade.on_upgrade(move |socket| push_windows(socket, rx))
}

async fn push_windows(mut socket: WebSocket, mut rx: broadcast::Receiver<WindowEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Ok(payload) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "push subscriber lagged, skipping events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
