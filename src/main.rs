use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gapwatch::api::{self, ApiState};
use gapwatch::config::{Config, CHANNEL_CAPACITY, WRITER_QUEUE_CAPACITY};
use gapwatch::consumer::WindowConsumer;
use gapwatch::db;
use gapwatch::db::writer::WindowWriter;
use gapwatch::detector::SpreadDetector;
use gapwatch::events::{FeedCmd, WindowEvent};
use gapwatch::lifecycle::{MarketRefresher, PinnedMarketWatcher};
use gapwatch::market::CatalogClient;
use gapwatch::metrics::{HealthState, LatencyStats, NoiseStats};
use gapwatch::scorer::MarketScorer;
use gapwatch::store::MarketStore;
use gapwatch::ws::feed::FeedClient;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let pool = db::connect(&cfg.db_path).await?;

    // Seed the watched set before the feed opens so the first subscribe
    // frame carries the full token list.
    let catalog = CatalogClient::new(cfg.catalog_api_url.clone());
    let store = MarketStore::new();
    let (markets, _stats) = catalog.fetch_qualifying(&cfg).await?;
    for market in &markets {
        db::insert_market(&pool, market).await?;
        store.insert_market(market.clone());
    }
    info!(markets = markets.len(), "bootstrap complete");

    if cfg.pinned_prefixes.is_empty() {
        warn!("PINNED_PREFIXES not set; short-lived rolling markets will not be tracked");
    }

    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new());
    let noise = Arc::new(NoiseStats::new());

    let (feed_tx, feed_rx) = mpsc::channel::<FeedCmd>(64);
    let (price_tx, price_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (removal_tx, removal_rx) = mpsc::channel::<String>(64);
    let (window_tx, window_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
    let (event_tx, _) = broadcast::channel::<WindowEvent>(256);

    let feed = FeedClient::new(
        cfg.feed_ws_url.clone(),
        Arc::clone(&store),
        price_tx,
        feed_rx,
        Arc::clone(&health),
    );
    let feed_handle = tokio::spawn(feed.run());

    let detector = SpreadDetector::new(
        Arc::clone(&store),
        price_rx,
        removal_rx,
        window_tx,
        Arc::clone(&latency),
        Arc::clone(&noise),
    );
    let detector_handle = tokio::spawn(detector.run());

    let consumer = WindowConsumer::new(
        window_rx,
        writer_tx,
        event_tx.clone(),
        Arc::clone(&health),
    );
    let consumer_handle = tokio::spawn(consumer.run());

    let writer = WindowWriter::new(pool.clone(), writer_rx, Arc::clone(&health));
    let writer_handle = tokio::spawn(writer.run());

    let refresher = MarketRefresher::new(
        cfg.clone(),
        catalog.clone(),
        Arc::clone(&store),
        feed_tx.clone(),
        removal_tx.clone(),
        pool.clone(),
    );
    let refresher_handle = tokio::spawn(refresher.run());

    let pinned_watcher = PinnedMarketWatcher::new(
        cfg.clone(),
        catalog,
        Arc::clone(&store),
        feed_tx.clone(),
        removal_tx,
        pool.clone(),
    );
    let watcher_handle = tokio::spawn(pinned_watcher.run());

    let scorer = MarketScorer::new(pool.clone(), Arc::clone(&noise));
    let scorer_handle = tokio::spawn(scorer.run());

    // Serves until ctrl-c.
    let api_state = ApiState {
        pool,
        store,
        health,
        latency,
        events: event_tx,
    };
    api::serve(api_state, cfg.api_port).await?;

    // Shutdown cascade: stop the periodic controllers, close the feed's
    // control channel, then let feed → detector → consumer → writer drain in
    // causal order.
    info!("shutting down");
    refresher_handle.abort();
    watcher_handle.abort();
    scorer_handle.abort();
    drop(feed_tx);
    feed_handle.abort();
    let _ = detector_handle.await;
    let _ = consumer_handle.await;
    let _ = writer_handle.await;
    info!("scanner stopped");

    Ok(())
}
