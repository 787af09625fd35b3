//! Window event fan-out.
//!
//! Drains the detector's output queue and forwards every event to the
//! persistence writer, plus a best-effort broadcast to live subscribers
//! (slow subscribers lag and drop; the producer never waits on them).
//!
//! Overflow policy: Opens are forwarded with `try_send` and dropped when the
//! writer queue is full; Closes carry the full observables and are always
//! delivered, waiting for queue space if needed. Detection is unaffected
//! either way: this task sits behind its own bounded queue.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::events::WindowEvent;
use crate::metrics::HealthState;

pub struct WindowConsumer {
    window_rx: mpsc::Receiver<WindowEvent>,
    writer_tx: mpsc::Sender<WindowEvent>,
    subscribers: broadcast::Sender<WindowEvent>,
    health: Arc<HealthState>,
}

impl WindowConsumer {
    pub fn new(
        window_rx: mpsc::Receiver<WindowEvent>,
        writer_tx: mpsc::Sender<WindowEvent>,
        subscribers: broadcast::Sender<WindowEvent>,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            window_rx,
            writer_tx,
            subscribers,
            health,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.window_rx.recv().await {
            // Errors only mean "no subscribers right now".
            let _ = self.subscribers.send(event.clone());

            match event {
                WindowEvent::Open(open) => {
                    match self.writer_tx.try_send(WindowEvent::Open(open)) {
                        Ok(()) => self.health.inc_writes_enqueued(),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            self.health.inc_opens_dropped();
                            warn!(
                                dropped = self.health.opens_dropped(),
                                "writer queue full, dropping open event"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                WindowEvent::Close(close) => {
                    self.health.set_last_window_at_ns(close.closed_at_ns);
                    self.health.inc_writes_enqueued();
                    if self.writer_tx.send(WindowEvent::Close(close)).await.is_err() {
                        break;
                    }
                }
            }
        }
        info!("window consumer drained");
    }
}
