//! Window persistence writer.
//!
//! Owns all writes to the `windows` table and runs as its own task so the
//! detection path never waits on disk. Opens insert a row with NULL close
//! fields; Closes update that row, or insert a complete one when no open row
//! exists (the open was lost to overflow, or the events raced), so the final
//! row is the same for any interleaving.

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::events::{WindowClose, WindowEvent, WindowOpen};
use crate::metrics::HealthState;

fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

pub struct WindowWriter {
    pool: SqlitePool,
    window_rx: mpsc::Receiver<WindowEvent>,
    health: Arc<HealthState>,
}

impl WindowWriter {
    pub fn new(
        pool: SqlitePool,
        window_rx: mpsc::Receiver<WindowEvent>,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            pool,
            window_rx,
            health,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.window_rx.recv().await {
            let result = match &event {
                WindowEvent::Open(open) => self.write_open(open).await,
                WindowEvent::Close(close) => self.write_close(close).await,
            };
            self.health.inc_writes_completed();
            if let Err(e) = result {
                error!(error = %e, "window write failed");
            }
        }
        info!("window writer flushed");
    }

    pub async fn write_open(&self, open: &WindowOpen) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO windows
                (market_id, opened_at, closed_at, duration_ms,
                 open_yes_ask, open_no_ask, open_combined, open_spread,
                 spread_category)
            VALUES (?, ?, NULL, NULL, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&open.market_id)
        .bind(open.opened_at_ns as i64)
        .bind(to_f64(open.open.yes_ask))
        .bind(to_f64(open.open.no_ask))
        .bind(to_f64(open.open.combined))
        .bind(to_f64(open.open.spread))
        .bind(open.spread_category.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update the still-open row for this (market, opened_at); insert a
    /// complete row when none exists.
    pub async fn write_close(&self, close: &WindowClose) -> anyhow::Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE windows
            SET closed_at = ?, duration_ms = ?,
                close_yes_ask = ?, close_no_ask = ?,
                close_combined = ?, close_spread = ?,
                open_duration_class = ?, close_reason = ?,
                tick_count = ?, trade_event_fired = ?,
                volume_change_ticks = ?, price_shifted = ?,
                opportunity_class = ?, detection_latency_us = ?
            WHERE market_id = ? AND opened_at = ? AND closed_at IS NULL
            "#,
        )
        .bind(close.closed_at_ns as i64)
        .bind(close.duration_ms)
        .bind(to_f64(close.close.yes_ask))
        .bind(to_f64(close.close.no_ask))
        .bind(to_f64(close.close.combined))
        .bind(to_f64(close.close.spread))
        .bind(close.duration_class.to_string())
        .bind(close.close_reason.to_string())
        .bind(close.observables.tick_count as i64)
        .bind(i64::from(close.observables.trade_event_fired))
        .bind(close.observables.volume_change_ticks as i64)
        .bind(i64::from(close.observables.price_shifted))
        .bind(close.opportunity_class as i64)
        .bind(close.detection_latency_us as i64)
        .bind(&close.market_id)
        .bind(close.opened_at_ns as i64)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO windows
                (market_id, opened_at, closed_at, duration_ms,
                 open_yes_ask, open_no_ask, open_combined, open_spread,
                 close_yes_ask, close_no_ask, close_combined, close_spread,
                 spread_category, open_duration_class, close_reason,
                 tick_count, trade_event_fired, volume_change_ticks,
                 price_shifted, opportunity_class, detection_latency_us)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&close.market_id)
        .bind(close.opened_at_ns as i64)
        .bind(close.closed_at_ns as i64)
        .bind(close.duration_ms)
        .bind(to_f64(close.open.yes_ask))
        .bind(to_f64(close.open.no_ask))
        .bind(to_f64(close.open.combined))
        .bind(to_f64(close.open.spread))
        .bind(to_f64(close.close.yes_ask))
        .bind(to_f64(close.close.no_ask))
        .bind(to_f64(close.close.combined))
        .bind(to_f64(close.close.spread))
        .bind(close.spread_category.to_string())
        .bind(close.duration_class.to_string())
        .bind(close.close_reason.to_string())
        .bind(close.observables.tick_count as i64)
        .bind(i64::from(close.observables.trade_event_fired))
        .bind(close.observables.volume_change_ticks as i64)
        .bind(i64::from(close.observables.price_shifted))
        .bind(close.opportunity_class as i64)
        .bind(close.detection_latency_us as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
