//! Durable market-channel WebSocket connector.
//!
//! Maintains a single persistent stream: subscribes the full watched token
//! set on every (re)connect, applies snapshots and deltas to the store, and
//! routes one `PriceUpdate` per event to the detector. Control commands are
//! processed in order between incoming frames. Reconnects back off
//! exponentially from 100ms to a 30s cap and reset on a successful open.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{PING_INTERVAL, RECONNECT_BASE, RECONNECT_CAP, SUBSCRIBE_CHUNK_SIZE};
use crate::events::{FeedCmd, PriceUpdate};
use crate::metrics::HealthState;
use crate::store::{MarketStore, Quote};
use crate::ws::messages::{parse_frame, FeedEvent};
use crate::ws::WsError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct FeedClient {
    ws_url: String,
    store: Arc<MarketStore>,
    price_tx: mpsc::Sender<PriceUpdate>,
    cmd_rx: mpsc::Receiver<FeedCmd>,
    health: Arc<HealthState>,
}

impl FeedClient {
    pub fn new(
        ws_url: String,
        store: Arc<MarketStore>,
        price_tx: mpsc::Sender<PriceUpdate>,
        cmd_rx: mpsc::Receiver<FeedCmd>,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            ws_url,
            store,
            price_tx,
            cmd_rx,
            health,
        }
    }

    pub async fn run(mut self) {
        let mut backoff = RECONNECT_BASE;

        loop {
            info!(url = %self.ws_url, "connecting to market feed");
            match connect_async(&self.ws_url).await {
                Ok((stream, _)) => {
                    backoff = RECONNECT_BASE;
                    self.health.set_feed_connected(true);
                    let outcome = self.serve_stream(stream).await;
                    self.health.set_feed_connected(false);
                    match outcome {
                        Ok(ShutdownKind::ControlClosed) => {
                            info!("control channel closed, feed connector stopping");
                            return;
                        }
                        Ok(ShutdownKind::StreamEnded) => {
                            info!("feed stream closed");
                        }
                        Err(e) => {
                            error!(error = %e, "feed stream error");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "feed connect failed");
                }
            }

            warn!(delay = ?backoff, "reconnecting to market feed");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }
    }

    async fn serve_stream(
        &mut self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<ShutdownKind, WsError> {
        let (mut write, mut read) = stream.split();

        // Resubscribe the complete current token set on every open.
        let token_ids = self.store.all_token_ids();
        if !token_ids.is_empty() {
            send_subscribe(&mut write, &token_ids).await?;
            info!(tokens = token_ids.len(), "subscribed to market channel");
        }

        let mut ping = interval(PING_INTERVAL);
        ping.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(ShutdownKind::StreamEnded);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ping.tick() => {
                    debug!("feed keepalive ping");
                    write.send(Message::Ping(Vec::new().into())).await?;
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(FeedCmd::Subscribe(tokens)) => {
                            send_subscribe(&mut write, &tokens).await?;
                            info!(tokens = tokens.len(), "subscribed additional tokens");
                        }
                        Some(FeedCmd::Unsubscribe(tokens)) => {
                            let frame = serde_json::json!({
                                "assets_ids": &tokens,
                                "operation": "unsubscribe",
                            });
                            write.send(Message::Text(frame.to_string().into())).await?;
                            info!(tokens = tokens.len(), "unsubscribed tokens");
                        }
                        None => return Ok(ShutdownKind::ControlClosed),
                    }
                }
            }
        }
    }

    /// Parse one text frame, apply it to the store, and route price updates.
    /// Receive time is stamped here, before any parsing.
    async fn handle_frame(&self, text: &str) {
        let received_at = Instant::now();
        let received_at_ns = now_ns();

        for event in parse_frame(text) {
            match event {
                FeedEvent::Snapshot { token_id, asks, bids } => {
                    if let Some(quote) = self.store.apply_book_snapshot(&token_id, &asks, &bids) {
                        debug!(
                            token_id = %token_id,
                            best_ask = %quote.best_ask,
                            best_bid = %quote.best_bid,
                            "book snapshot applied"
                        );
                        self.route(token_id, quote, received_at, received_at_ns, false, false);
                    }
                }
                FeedEvent::Deltas { token_id, deltas } => {
                    if let Some(quote) = self.store.apply_book_deltas(&token_id, &deltas) {
                        self.route(token_id, quote, received_at, received_at_ns, false, false);
                    }
                }
                FeedEvent::Trade { token_id, size } => {
                    debug!(token_id = %token_id, size = %size, "trade event");
                    // A trade tick routes the freshest cached quote with the
                    // trade/volume flags set.
                    if let Some(quote) = self.store.quote(&token_id) {
                        self.route(token_id, quote, received_at, received_at_ns, true, true);
                    }
                }
            }
        }
    }

    fn route(
        &self,
        token_id: String,
        quote: Quote,
        received_at: Instant,
        received_at_ns: u64,
        trade_fired: bool,
        volume_changed: bool,
    ) {
        let update = PriceUpdate {
            token_id,
            best_ask: quote.best_ask,
            best_bid: quote.best_bid,
            received_at,
            received_at_ns,
            trade_fired,
            volume_changed,
        };
        if let Err(e) = self.price_tx.try_send(update) {
            warn!(error = %e, "price channel full, dropping update");
        }
    }
}

enum ShutdownKind {
    /// Control channel dropped; the scanner is shutting down.
    ControlClosed,
    /// Server closed the stream; reconnect.
    StreamEnded,
}

async fn send_subscribe(write: &mut WsSink, token_ids: &[String]) -> Result<(), WsError> {
    let chunks: Vec<_> = token_ids.chunks(SUBSCRIBE_CHUNK_SIZE).collect();
    let total = chunks.len();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let frame = serde_json::json!({
            "assets_ids": chunk,
            "type": "market",
        });
        write.send(Message::Text(frame.to_string().into())).await?;
        debug!(chunk = i + 1, total, ids = chunk.len(), "subscribe chunk sent");
        if total > 1 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    Ok(())
}

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
