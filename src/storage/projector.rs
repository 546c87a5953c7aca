//! Storage projector: the wildcard bus subscriber.
//!
//! Every event lands in the append-only log unless its topic is in the
//! skip set (oversize payloads the document store cannot hold). Signals,
//! position frames, and order transitions additionally project into their
//! compact collections. Write errors are logged and swallowed; storage
//! trouble never stalls signal or whale processing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::EventStore;
use crate::bus::EventBus;
use crate::events::{EventPayload, StandardEvent};

#[derive(Debug, Clone, Default)]
pub struct ProjectorStats {
    pub events_stored: u64,
    pub events_skipped: u64,
    pub write_errors: u64,
}

pub struct StorageProjector {
    store: Arc<dyn EventStore>,
    skip_topics: HashSet<String>,
    events_stored: AtomicU64,
    events_skipped: AtomicU64,
    write_errors: AtomicU64,
}

impl StorageProjector {
    pub fn new(store: Arc<dyn EventStore>, skip_topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            store,
            skip_topics: skip_topics.into_iter().collect(),
            events_stored: AtomicU64::new(0),
            events_skipped: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        }
    }

    /// Subscribe to every topic on the bus.
    pub async fn register(self: Arc<Self>, bus: &EventBus) {
        let projector = Arc::clone(&self);
        bus.subscribe("*", "storage_projector", move |event| {
            let projector = Arc::clone(&projector);
            async move {
                projector.handle(event).await;
                Ok(())
            }
        })
        .await;
    }

    pub async fn handle(&self, event: StandardEvent) {
        let topic = event.topic();
        if self.skip_topics.contains(topic) {
            self.events_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Err(e) = self.store.append_event(&event).await {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(topic, error = %e, "event log write failed");
        } else {
            self.events_stored.fetch_add(1, Ordering::Relaxed);
        }

        match &event.payload {
            EventPayload::TradingSignal(signal) => {
                if let Err(e) = self.store.upsert_signal(signal).await {
                    self.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "signal upsert failed");
                }
            }
            EventPayload::TraderPositions(payload) => {
                if let Err(e) = self.store.insert_snapshot(payload).await {
                    self.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(address = %payload.address, error = %e, "snapshot write failed");
                }
                if let Err(e) = self.store.upsert_current_state(payload).await {
                    self.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(address = %payload.address, error = %e, "current-state upsert failed");
                }
            }
            EventPayload::TraderOrders(payload) => {
                if let Err(e) = self
                    .store
                    .upsert_order_state(&payload.address, &payload.orders)
                    .await
                {
                    self.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(address = %payload.address, error = %e, "order-state upsert failed");
                }
            }
            EventPayload::Candles(candle) => {
                if let Err(e) = self.store.upsert_candle(candle).await {
                    self.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(symbol = %candle.symbol, error = %e, "candle upsert failed");
                }
            }
            _ => {}
        }
    }

    pub fn stats(&self) -> ProjectorStats {
        ProjectorStats {
            events_stored: self.events_stored.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}
