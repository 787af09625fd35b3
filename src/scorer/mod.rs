//! Rolling per-market statistics.
//!
//! Every 60 seconds, aggregates the last 24 hours of persisted windows per
//! market and upserts a composite opportunity score into `market_stats`.
//! Class-1 windows (gradual volume spikes) weigh double and class-2 (price
//! drift) ×1.5: those are the tradeable shapes, so markets producing them
//! rank above markets producing the same raw window count of fast-required
//! or vanished-order noise.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{Row, SqlitePool};
use tracing::{error, info};

use crate::config::SCORER_INTERVAL_SECS;
use crate::metrics::NoiseStats;
use crate::ws::feed::now_ns;

pub struct MarketScorer {
    pool: SqlitePool,
    noise: Arc<NoiseStats>,
}

impl MarketScorer {
    pub fn new(pool: SqlitePool, noise: Arc<NoiseStats>) -> Self {
        Self { pool, noise }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(SCORER_INTERVAL_SECS));
        ticker.tick().await; // consume the immediate first tick

        loop {
            ticker.tick().await;
            if let Err(e) = self.score_all().await {
                error!(error = %e, "scorer pass failed");
            }
        }
    }

    async fn score_all(&self) -> anyhow::Result<()> {
        let now = now_ns() as i64;
        let since = now - 24i64 * 3_600 * 1_000_000_000;

        let rows = sqlx::query(
            r#"
            SELECT
                market_id,
                COUNT(*) AS windows_24h,
                SUM(CASE WHEN opportunity_class = 1 THEN 1 ELSE 0 END) AS class1_count,
                SUM(CASE WHEN opportunity_class = 2 THEN 1 ELSE 0 END) AS class2_count,
                SUM(CASE WHEN opportunity_class IN (3, 4) THEN 1 ELSE 0 END) AS other_count,
                AVG(duration_ms) AS avg_duration_ms,
                AVG(open_spread) AS avg_spread,
                MAX(open_spread) AS max_spread
            FROM windows
            WHERE opened_at > ?
            GROUP BY market_id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let scored = rows.len();
        for row in rows {
            let market_id: String = row.try_get("market_id")?;
            let windows_24h: i64 = row.try_get("windows_24h")?;
            let class1: i64 = row.try_get("class1_count")?;
            let class2: i64 = row.try_get("class2_count")?;
            let other: i64 = row.try_get("other_count")?;
            let avg_duration_ms: Option<f64> = row.try_get("avg_duration_ms")?;
            let avg_spread: Option<f64> = row.try_get("avg_spread")?;
            let max_spread: Option<f64> = row.try_get("max_spread")?;

            // Discarded pending windows never persist; the detector counts
            // them in memory.
            let discards = self.noise.discards(&market_id);
            let observations = discards + windows_24h.max(0) as u64;
            let noise_ratio = if observations > 0 {
                discards as f64 / observations as f64
            } else {
                0.0
            };

            let score = compute_score(
                class1,
                class2,
                other,
                avg_duration_ms.unwrap_or(0.0),
                avg_spread.unwrap_or(0.0),
                noise_ratio,
            );

            sqlx::query(
                r#"
                INSERT INTO market_stats (
                    market_id, windows_24h, class1_count, class2_count,
                    avg_duration_ms, avg_spread, max_spread,
                    noise_ratio, opportunity_score, last_updated
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(market_id) DO UPDATE SET
                    windows_24h = excluded.windows_24h,
                    class1_count = excluded.class1_count,
                    class2_count = excluded.class2_count,
                    avg_duration_ms = excluded.avg_duration_ms,
                    avg_spread = excluded.avg_spread,
                    max_spread = excluded.max_spread,
                    noise_ratio = excluded.noise_ratio,
                    opportunity_score = excluded.opportunity_score,
                    last_updated = excluded.last_updated
                "#,
            )
            .bind(&market_id)
            .bind(windows_24h)
            .bind(class1)
            .bind(class2)
            .bind(avg_duration_ms)
            .bind(avg_spread)
            .bind(max_spread)
            .bind(noise_ratio)
            .bind(score)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        info!(markets = scored, "market stats updated");
        Ok(())
    }
}

/// Composite opportunity score, higher = better market to watch.
///
/// The window mix is weighted (class 1 ×2, class 2 ×1.5, others ×1) and
/// normalised against a 50-window/24h ceiling; duration and average spread
/// add up to 45 more points; the noise ratio subtracts up to 15.
fn compute_score(
    class1: i64,
    class2: i64,
    other: i64,
    avg_duration_ms: f64,
    avg_spread: f64,
    noise_ratio: f64,
) -> f64 {
    let weighted_mix = 2.0 * class1 as f64 + 1.5 * class2 as f64 + other as f64;
    let mix_score = (weighted_mix / 50.0).min(1.0) * 40.0;
    let duration_score = (avg_duration_ms / 2_000.0).min(1.0) * 20.0;
    let spread_score = (avg_spread / 0.10).min(1.0) * 25.0;
    let noise_penalty = noise_ratio * 15.0;

    (mix_score + duration_score + spread_score - noise_penalty).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tradeable_mix_outscores_noise_mix() {
        // Same raw window count, different class mix.
        let tradeable = compute_score(10, 5, 0, 800.0, 0.04, 0.1);
        let junk = compute_score(0, 0, 15, 800.0, 0.04, 0.1);
        assert!(tradeable > junk);
    }

    #[test]
    fn noise_penalises_score() {
        let clean = compute_score(5, 5, 5, 500.0, 0.03, 0.0);
        let noisy = compute_score(5, 5, 5, 500.0, 0.03, 0.9);
        assert!(clean > noisy);
    }

    #[test]
    fn score_never_negative() {
        assert_eq!(compute_score(0, 0, 0, 0.0, 0.0, 1.0), 0.0);
    }

    #[test]
    fn score_saturates_at_the_mix_ceiling() {
        let at_ceiling = compute_score(25, 0, 0, 2_000.0, 0.10, 0.0);
        let beyond = compute_score(500, 0, 0, 10_000.0, 0.50, 0.0);
        assert_eq!(at_ceiling, beyond);
        assert_eq!(at_ceiling, 85.0);
    }
}
