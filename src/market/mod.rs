//! Market discovery from the upstream catalog.
//!
//! The catalog is a paged REST endpoint returning market descriptors with
//! stringified token-id and outcome-label arrays. Discovery applies three
//! admission gates (24h volume, liquidity, expiry window) and
//! disambiguates YES/NO tokens from the outcome labels, falling back to
//! positional order for unlabelled binary markets.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;

/// A watched market: one stable id and its pair of outcome tokens.
#[derive(Debug, Clone)]
pub struct Market {
    pub id: String,
    pub question: String,
    pub category: String,
    pub slug: Option<String>,
    pub end_date_iso: Option<String>,
    pub volume_24h: f64,
    pub liquidity: f64,
    pub yes_token_id: String,
    pub no_token_id: String,
}

/// Per-gate rejection counts for one discovery pass.
#[derive(Debug, Default)]
pub struct FetchStats {
    pub api_total: usize,
    pub rejected_no_tokens: usize,
    pub rejected_no_outcomes: usize,
    pub rejected_low_volume: usize,
    pub rejected_low_liquidity: usize,
    pub rejected_expiry: usize,
    pub qualified: usize,
}

/// A pinned-family market with its slug-derived end timestamp.
#[derive(Debug, Clone)]
pub struct PinnedCandidate {
    pub market: Market,
    pub prefix: String,
    pub end_ts: u64,
}

/// Raw catalog descriptor. `outcomes` and `clobTokenIds` arrive as
/// JSON-encoded strings inside the JSON.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogEntry {
    condition_id: Option<String>,
    question: Option<String>,
    slug: Option<String>,
    end_date_iso: Option<String>,
    outcomes: Option<String>,
    clob_token_ids: Option<String>,
    #[serde(rename = "volume24hr")]
    volume_24hr: Option<Value>,
    liquidity_num: Option<Value>,
    #[serde(default)]
    events: Vec<CatalogEvent>,
}

#[derive(Debug, Deserialize)]
struct CatalogEvent {
    category: Option<String>,
}

#[derive(Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http, base_url }
    }

    /// Fetch qualifying markets, highest 24h volume first, capped at
    /// `cfg.max_subscriptions`.
    pub async fn fetch_qualifying(&self, cfg: &Config) -> anyhow::Result<(Vec<Market>, FetchStats)> {
        let now = Utc::now();
        let min_expiry = chrono::Duration::seconds((cfg.min_expiry_minutes * 60.0) as i64);
        let max_expiry = chrono::Duration::seconds((cfg.max_expiry_hours * 3600.0) as i64);

        let mut markets = Vec::new();
        let mut stats = FetchStats::default();
        let page_size = 500usize;
        let mut offset = 0usize;

        'pages: loop {
            let url = format!(
                "{}/markets?active=true&closed=false&limit={}&offset={}&order=volume24hr&ascending=false",
                self.base_url, page_size, offset
            );
            debug!(offset, "fetching catalog page");
            let entries: Vec<CatalogEntry> =
                self.http.get(&url).send().await?.error_for_status()?.json().await?;

            if entries.is_empty() {
                break;
            }
            let page_len = entries.len();
            stats.api_total += page_len;

            for entry in entries {
                match admit(entry, cfg, now, min_expiry, max_expiry) {
                    Ok(market) => {
                        markets.push(market);
                        if markets.len() >= cfg.max_subscriptions {
                            break 'pages;
                        }
                    }
                    Err(Rejection::NoTokens) => stats.rejected_no_tokens += 1,
                    Err(Rejection::NoOutcomes) => stats.rejected_no_outcomes += 1,
                    Err(Rejection::LowVolume) => stats.rejected_low_volume += 1,
                    Err(Rejection::LowLiquidity) => stats.rejected_low_liquidity += 1,
                    Err(Rejection::Expiry) => stats.rejected_expiry += 1,
                }
            }

            if page_len < page_size {
                break;
            }
            offset += page_size;
        }

        stats.qualified = markets.len();
        info!(
            qualified = stats.qualified,
            api_total = stats.api_total,
            no_tokens = stats.rejected_no_tokens,
            no_outcomes = stats.rejected_no_outcomes,
            low_volume = stats.rejected_low_volume,
            low_liquidity = stats.rejected_low_liquidity,
            expiry = stats.rejected_expiry,
            "catalog discovery complete"
        );
        Ok((markets, stats))
    }

    /// Fetch markets whose slug starts with one of the pinned prefixes.
    /// The catalog has no slug filter, so this scans the most recently
    /// created markets; rolling families appear there with fresh slugs
    /// every few minutes.
    pub async fn fetch_pinned(&self, prefixes: &[String]) -> anyhow::Result<Vec<PinnedCandidate>> {
        if prefixes.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/markets?active=true&closed=false&limit=300&order=startDate&ascending=false",
            self.base_url
        );
        let entries: Vec<CatalogEntry> =
            self.http.get(&url).send().await?.error_for_status()?.json().await?;

        let mut candidates: Vec<PinnedCandidate> = entries
            .into_iter()
            .filter_map(|entry| {
                let slug = entry.slug.clone()?;
                let prefix = prefixes.iter().find(|p| slug.starts_with(p.as_str()))?;
                let end_ts = parse_slug_end_ts(&slug);
                let market = parse_market(entry)?;
                Some(PinnedCandidate {
                    market,
                    prefix: prefix.clone(),
                    end_ts,
                })
            })
            .collect();

        candidates.sort_by(|a, b| a.market.id.cmp(&b.market.id));
        candidates.dedup_by(|a, b| a.market.id == b.market.id);
        Ok(candidates)
    }
}

enum Rejection {
    NoTokens,
    NoOutcomes,
    LowVolume,
    LowLiquidity,
    Expiry,
}

/// Structural parse with no admission gates applied.
fn parse_market(entry: CatalogEntry) -> Option<Market> {
    let id = entry.condition_id.as_deref().filter(|s| !s.is_empty())?.to_string();
    let token_ids: Vec<String> = serde_json::from_str(entry.clob_token_ids.as_deref()?).ok()?;
    let outcomes: Vec<String> =
        serde_json::from_str(entry.outcomes.as_deref().unwrap_or("[]")).unwrap_or_default();
    let (yes_idx, no_idx) = resolve_outcome_indices(&outcomes)?;
    let yes_token_id = token_ids.get(yes_idx)?.clone();
    let no_token_id = token_ids.get(no_idx)?.clone();

    let category = entry
        .events
        .first()
        .and_then(|e| e.category.clone())
        .unwrap_or_else(|| "other".to_string())
        .to_lowercase();

    Some(Market {
        id,
        question: entry.question.unwrap_or_default(),
        category,
        slug: entry.slug,
        end_date_iso: entry.end_date_iso,
        volume_24h: num(entry.volume_24hr.as_ref()),
        liquidity: num(entry.liquidity_num.as_ref()),
        yes_token_id,
        no_token_id,
    })
}

fn admit(
    entry: CatalogEntry,
    cfg: &Config,
    now: DateTime<Utc>,
    min_expiry: chrono::Duration,
    max_expiry: chrono::Duration,
) -> Result<Market, Rejection> {
    let has_tokens = entry
        .clob_token_ids
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        .map(|ids| ids.len() >= 2)
        .unwrap_or(false);
    if !has_tokens {
        return Err(Rejection::NoTokens);
    }

    let volume_24h = num(entry.volume_24hr.as_ref());
    if volume_24h < cfg.min_volume_24h {
        return Err(Rejection::LowVolume);
    }
    let liquidity = num(entry.liquidity_num.as_ref());
    if liquidity < cfg.min_liquidity {
        return Err(Rejection::LowLiquidity);
    }

    let Some(end) = entry
        .end_date_iso
        .as_deref()
        .and_then(parse_end_timestamp)
    else {
        return Err(Rejection::Expiry);
    };
    let until_expiry = end.signed_duration_since(now);
    if until_expiry < min_expiry || until_expiry > max_expiry {
        return Err(Rejection::Expiry);
    }

    parse_market(entry).ok_or(Rejection::NoOutcomes)
}

/// (yes_index, no_index) within the outcome-label list. Labels win; a
/// two-outcome market with unrecognised labels falls back to positional
/// YES=0 / NO=1.
fn resolve_outcome_indices(outcomes: &[String]) -> Option<(usize, usize)> {
    let yes = outcomes
        .iter()
        .position(|o| o.eq_ignore_ascii_case("yes") || o.eq_ignore_ascii_case("up"));
    let no = outcomes
        .iter()
        .position(|o| o.eq_ignore_ascii_case("no") || o.eq_ignore_ascii_case("down"));
    match (yes, no) {
        (Some(y), Some(n)) => Some((y, n)),
        _ if outcomes.len() == 2 => Some((0, 1)),
        _ => None,
    }
}

/// Catalog numerics arrive as either numbers or strings.
fn num(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Catalog end timestamps are RFC 3339, occasionally date-only.
fn parse_end_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Unix timestamp from a rolling-market slug's trailing segment:
/// `btc-updown-5m-1772068500` → 1772068500. 0 when absent.
pub fn parse_slug_end_ts(slug: &str) -> u64 {
    slug.rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Trading-window length from a pinned prefix: `…-5m` → 300, `…-1h` → 3600.
/// Defaults to 300 for unrecognised shapes.
pub fn parse_prefix_duration_secs(prefix: &str) -> u64 {
    let Some(segment) = prefix.rsplit('-').next() else {
        return 300;
    };
    if let Some(n) = segment.strip_suffix('m') {
        return n.parse::<u64>().unwrap_or(5) * 60;
    }
    if let Some(n) = segment.strip_suffix('h') {
        return n.parse::<u64>().unwrap_or(1) * 3600;
    }
    300
}
