//! SQLite persistence: pool setup, row models, and the window writer task.

pub mod models;
pub mod writer;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (creating if missing) the scanner database and run migrations.
pub async fn connect(db_path: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    info!(path = db_path, "database ready");
    Ok(pool)
}

/// Upsert one market's metadata row.
pub async fn insert_market(pool: &SqlitePool, market: &crate::market::Market) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO markets
            (id, question, category, end_date_iso, volume_24h, liquidity,
             yes_token_id, no_token_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&market.id)
    .bind(&market.question)
    .bind(&market.category)
    .bind(&market.end_date_iso)
    .bind(market.volume_24h)
    .bind(market.liquidity)
    .bind(&market.yes_token_id)
    .bind(&market.no_token_id)
    .bind(crate::ws::feed::now_ns() as i64)
    .execute(pool)
    .await?;
    Ok(())
}
