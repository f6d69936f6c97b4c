//! Bridge fan-out for accepted articles.
//!
//! Bridges (Fediverse, Matrix, ...) are thin outbound adapters living
//! outside this crate. Ingestion publishes accepted articles to every
//! subscriber over bounded channels; a full channel drops the event rather
//! than ever blocking the write path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};

use crate::article::Article;
use crate::config::BRIDGE_QUEUE_CAPACITY;

/// A message-accepted event.
#[derive(Debug, Clone)]
pub struct BridgeEvent {
    pub article: Arc<Article>,
    pub group: String,
}

/// Fan-out hub; subscribers each get their own bounded queue.
#[derive(Default)]
pub struct BridgeHub {
    senders: Vec<Sender<BridgeEvent>>,
    dropped: AtomicU64,
}

impl BridgeHub {
    pub fn new() -> BridgeHub {
        BridgeHub::default()
    }

    /// Register a subscriber; call before ingestion starts.
    pub fn subscribe(&mut self) -> Receiver<BridgeEvent> {
        let (tx, rx) = async_channel::bounded(BRIDGE_QUEUE_CAPACITY);
        self.senders.push(tx);
        rx
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Best-effort publish; never blocks, drops on a full queue.
    pub fn notify(&self, event: BridgeEvent) {
        for sender in &self.senders {
            if sender.try_send(event.clone()).is_err() {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    group = %event.group,
                    dropped,
                    "bridge queue full, dropping event"
                );
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
