//! Watched-set lifecycle management.
//!
//! Two controllers keep the watched market set fresh:
//!
//! - `MarketRefresher` reconciles the catalog's qualifying set against the
//!   store on every refresh tick. New markets are stored then subscribed;
//!   departed markets are unsubscribed then removed; the unsubscribe
//!   command carries token ids resolved while the market is still present.
//! - `PinnedMarketWatcher` covers short-lived rolling families the regular
//!   cadence would miss entirely: it keeps only the *current* market of each
//!   pinned prefix subscribed, pre-subscribes the next one shortly before
//!   rollover, and lets expired members linger through a grace period.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::events::FeedCmd;
use crate::market::{parse_prefix_duration_secs, CatalogClient, Market, PinnedCandidate};
use crate::store::MarketStore;

/// Grace period after a pinned market's end before unsubscribing (seconds).
const EXPIRY_GRACE_SECS: u64 = 60;
/// Pre-subscribe the next rolling market this close to the current's end.
const PRESUB_SECS: u64 = 30;
/// Pinned watcher tick cadence (seconds).
const WATCHER_TICK_SECS: u64 = 10;
/// Pinned watcher catalog re-fetch cadence (seconds).
const CATALOG_REFETCH_SECS: u64 = 30;

pub struct MarketRefresher {
    cfg: Config,
    catalog: CatalogClient,
    store: Arc<MarketStore>,
    feed_tx: mpsc::Sender<FeedCmd>,
    removal_tx: mpsc::Sender<String>,
    pool: SqlitePool,
}

impl MarketRefresher {
    pub fn new(
        cfg: Config,
        catalog: CatalogClient,
        store: Arc<MarketStore>,
        feed_tx: mpsc::Sender<FeedCmd>,
        removal_tx: mpsc::Sender<String>,
        pool: SqlitePool,
    ) -> Self {
        Self {
            cfg,
            catalog,
            store,
            feed_tx,
            removal_tx,
            pool,
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_secs(self.cfg.refresh_interval_secs));
        ticker.tick().await; // bootstrap already seeded the initial set

        loop {
            ticker.tick().await;
            // Fail soft: a catalog error keeps the previous watched set.
            if let Err(e) = self.refresh().await {
                error!(error = %e, "market refresh failed, keeping previous set");
            }
        }
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        let (fresh, _stats) = self.catalog.fetch_qualifying(&self.cfg).await?;

        let current: HashSet<String> = self.store.all_market_ids().into_iter().collect();
        let fresh_ids: HashSet<String> = fresh.iter().map(|m| m.id.clone()).collect();

        // Pinned markets belong to the watcher, not this cycle.
        let to_remove: Vec<String> = current
            .difference(&fresh_ids)
            .filter(|id| !self.store.is_pinned(id))
            .cloned()
            .collect();
        let to_add: Vec<Market> = fresh
            .into_iter()
            .filter(|m| !current.contains(&m.id))
            .collect();

        for market_id in &to_remove {
            self.retire_market(market_id).await;
        }

        if !to_add.is_empty() {
            let mut tokens = Vec::with_capacity(to_add.len() * 2);
            for market in &to_add {
                if let Err(e) = db::insert_market(&self.pool, market).await {
                    warn!(market_id = %market.id, error = %e, "market insert failed");
                }
                tokens.push(market.yes_token_id.clone());
                tokens.push(market.no_token_id.clone());
                self.store.insert_market(market.clone());
            }
            if self.feed_tx.send(FeedCmd::Subscribe(tokens)).await.is_err() {
                warn!("feed command channel closed");
            }
        }

        info!(
            added = to_add.len(),
            removed = to_remove.len(),
            total = self.store.market_count(),
            "watched set reconciled"
        );
        Ok(())
    }

    /// Unsubscribe before removal: token ids must be resolved while the
    /// market is still in the store, and the detector gets the chance to
    /// close any live window synthetically.
    async fn retire_market(&self, market_id: &str) {
        if let Some(tokens) = self.store.tokens_for_market(market_id) {
            if self.feed_tx.send(FeedCmd::Unsubscribe(tokens)).await.is_err() {
                warn!("feed command channel closed");
            }
        }
        if self.removal_tx.send(market_id.to_string()).await.is_err() {
            warn!("detector removal channel closed");
        }
        self.store.remove_market(market_id);
    }
}

// ---------------------------------------------------------------------------
// PinnedMarketWatcher
// ---------------------------------------------------------------------------

pub struct PinnedMarketWatcher {
    cfg: Config,
    catalog: CatalogClient,
    store: Arc<MarketStore>,
    feed_tx: mpsc::Sender<FeedCmd>,
    removal_tx: mpsc::Sender<String>,
    pool: SqlitePool,
    /// prefix → fetched candidates, sorted by end_ts ascending.
    known: HashMap<String, Vec<PinnedCandidate>>,
    /// Market ids this watcher currently has subscribed.
    subscribed: HashSet<String>,
    last_fetch_secs: u64,
}

impl PinnedMarketWatcher {
    pub fn new(
        cfg: Config,
        catalog: CatalogClient,
        store: Arc<MarketStore>,
        feed_tx: mpsc::Sender<FeedCmd>,
        removal_tx: mpsc::Sender<String>,
        pool: SqlitePool,
    ) -> Self {
        Self {
            cfg,
            catalog,
            store,
            feed_tx,
            removal_tx,
            pool,
            known: HashMap::new(),
            subscribed: HashSet::new(),
            last_fetch_secs: 0,
        }
    }

    pub async fn run(mut self) {
        if self.cfg.pinned_prefixes.is_empty() {
            return;
        }
        let mut ticker = interval(Duration::from_secs(WATCHER_TICK_SECS));
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "pinned watcher tick failed");
            }
        }
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let now = now_secs();

        if now.saturating_sub(self.last_fetch_secs) >= CATALOG_REFETCH_SECS {
            self.refetch().await?;
            self.last_fetch_secs = now;
        }

        self.reconcile(now).await;
        Ok(())
    }

    async fn refetch(&mut self) -> anyhow::Result<()> {
        let candidates = self.catalog.fetch_pinned(&self.cfg.pinned_prefixes).await?;
        self.known.clear();
        for candidate in candidates {
            self.known
                .entry(candidate.prefix.clone())
                .or_default()
                .push(candidate);
        }
        for family in self.known.values_mut() {
            family.sort_by_key(|c| c.end_ts);
        }
        Ok(())
    }

    /// Desired = the current market per prefix, plus the next one once the
    /// current is within the pre-subscribe horizon.
    fn desired_set(&self, now: u64) -> HashSet<String> {
        let mut desired = HashSet::new();
        for (prefix, family) in &self.known {
            let duration = parse_prefix_duration_secs(prefix);
            let active: Vec<&PinnedCandidate> = family
                .iter()
                .filter(|c| c.end_ts + EXPIRY_GRACE_SECS > now)
                .collect();

            if let Some(current) = active.first() {
                desired.insert(current.market.id.clone());
                let until_end = current.end_ts.saturating_sub(now);
                if until_end <= PRESUB_SECS + duration {
                    if let Some(next) = active.get(1) {
                        desired.insert(next.market.id.clone());
                    }
                }
            }
        }
        desired
    }

    async fn reconcile(&mut self, now: u64) {
        let desired = self.desired_set(now);

        let to_subscribe: Vec<Market> = desired
            .iter()
            .filter(|id| !self.subscribed.contains(*id))
            .filter_map(|id| {
                self.known
                    .values()
                    .flat_map(|family| family.iter())
                    .find(|c| &c.market.id == id)
                    .map(|c| c.market.clone())
            })
            .collect();
        let to_unsubscribe: Vec<String> = self
            .subscribed
            .iter()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect();

        if !to_subscribe.is_empty() {
            let mut tokens = Vec::with_capacity(to_subscribe.len() * 2);
            for market in &to_subscribe {
                if let Err(e) = db::insert_market(&self.pool, market).await {
                    warn!(market_id = %market.id, error = %e, "pinned market insert failed");
                }
                tokens.push(market.yes_token_id.clone());
                tokens.push(market.no_token_id.clone());
                self.store.insert_market(market.clone());
                self.store.pin_market(&market.id);
                self.subscribed.insert(market.id.clone());
                info!(
                    market_id = %market.id,
                    question = %market.question,
                    "pinned market subscribed"
                );
            }
            if self.feed_tx.send(FeedCmd::Subscribe(tokens)).await.is_err() {
                warn!("feed command channel closed");
            }
        }

        for market_id in &to_unsubscribe {
            if let Some(tokens) = self.store.tokens_for_market(market_id) {
                if self.feed_tx.send(FeedCmd::Unsubscribe(tokens)).await.is_err() {
                    warn!("feed command channel closed");
                }
            }
            if self.removal_tx.send(market_id.clone()).await.is_err() {
                warn!("detector removal channel closed");
            }
            self.store.remove_market(market_id);
            self.subscribed.remove(market_id);
            info!(market_id = %market_id, "pinned market expired, unsubscribed");
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, prefix: &str, end_ts: u64) -> PinnedCandidate {
        PinnedCandidate {
            market: Market {
                id: id.to_string(),
                question: format!("{id}?"),
                category: "crypto".to_string(),
                slug: Some(format!("{prefix}-{end_ts}")),
                end_date_iso: None,
                volume_24h: 0.0,
                liquidity: 0.0,
                yes_token_id: format!("{id}-yes"),
                no_token_id: format!("{id}-no"),
            },
            prefix: prefix.to_string(),
            end_ts,
        }
    }

    fn watcher_with(family: Vec<PinnedCandidate>) -> PinnedMarketWatcher {
        let cfg = Config {
            db_path: ":memory:".to_string(),
            api_port: 0,
            log_level: "info".to_string(),
            feed_ws_url: String::new(),
            catalog_api_url: String::new(),
            max_subscriptions: 10,
            min_volume_24h: 0.0,
            min_liquidity: 0.0,
            min_expiry_minutes: 0.0,
            max_expiry_hours: 1.0,
            refresh_interval_secs: 60,
            pinned_prefixes: vec!["btc-updown-5m".to_string()],
        };
        let (feed_tx, _feed_rx) = mpsc::channel(8);
        let (removal_tx, _removal_rx) = mpsc::channel(8);
        let mut watcher = PinnedMarketWatcher::new(
            cfg,
            CatalogClient::new(String::new()),
            MarketStore::new(),
            feed_tx,
            removal_tx,
            SqlitePool::connect_lazy("sqlite::memory:").expect("lazy pool"),
        );
        let mut sorted = family;
        sorted.sort_by_key(|c| c.end_ts);
        watcher.known.insert("btc-updown-5m".to_string(), sorted);
        watcher
    }

    #[tokio::test]
    async fn only_current_market_is_desired_far_from_rollover() {
        let now = 10_000;
        let watcher = watcher_with(vec![
            candidate("cur", "btc-updown-5m", now + 2_000),
            candidate("next", "btc-updown-5m", now + 2_300),
        ]);
        let desired = watcher.desired_set(now);
        assert_eq!(desired.len(), 1);
        assert!(desired.contains("cur"));
    }

    #[tokio::test]
    async fn next_market_is_presubscribed_near_rollover() {
        let now = 10_000;
        // 5m family: horizon is PRESUB_SECS + 300.
        let watcher = watcher_with(vec![
            candidate("cur", "btc-updown-5m", now + 200),
            candidate("next", "btc-updown-5m", now + 500),
        ]);
        let desired = watcher.desired_set(now);
        assert!(desired.contains("cur"));
        assert!(desired.contains("next"), "next must be pre-subscribed");
    }

    #[tokio::test]
    async fn expired_market_stays_through_grace_then_drops() {
        let end = 10_000;
        let watcher = watcher_with(vec![candidate("cur", "btc-updown-5m", end)]);

        // Inside the grace period the market is still desired.
        let desired = watcher.desired_set(end + EXPIRY_GRACE_SECS - 1);
        assert!(desired.contains("cur"));

        // Past the grace period it is gone.
        let desired = watcher.desired_set(end + EXPIRY_GRACE_SECS + 1);
        assert!(desired.is_empty());
    }
}
