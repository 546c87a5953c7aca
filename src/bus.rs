//! In-process event bus.
//!
//! Topic-keyed publish/subscribe with `*` wildcard. Handlers run
//! sequentially in registration order for each publish, so per-subscriber
//! ordering is well-defined; across publishes only publication order is
//! preserved. Handler errors are logged and never cross the bus boundary.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::events::StandardEvent;

type Handler = Arc<dyn Fn(StandardEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Subscription {
    pattern: String,
    name: String,
    handler: Handler,
}

impl Subscription {
    fn matches(&self, topic: &str) -> bool {
        self.pattern == "*" || self.pattern == topic
    }
}

#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub subscribers: usize,
    pub published: HashMap<String, u64>,
    pub delivered: HashMap<String, u64>,
}

pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    closed: AtomicBool,
    in_flight: AtomicU64,
    published: Mutex<HashMap<String, u64>>,
    delivered: Mutex<HashMap<String, u64>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            published: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler for a topic pattern (`*` matches every topic).
    /// Handlers registered earlier run earlier for each matching publish.
    pub async fn subscribe<F, Fut>(&self, pattern: &str, name: &str, f: F)
    where
        F: Fn(StandardEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(f(event)));
        let mut subs = self.subscriptions.write().await;
        subs.push(Subscription {
            pattern: pattern.to_string(),
            name: name.to_string(),
            handler,
        });
        debug!(pattern, name, total = subs.len(), "bus subscriber registered");
    }

    /// Deliver an event to every matching subscriber. Returns the number of
    /// deliveries made.
    pub async fn publish(&self, event: StandardEvent) -> usize {
        if self.closed.load(Ordering::Acquire) {
            warn!(topic = event.topic(), "publish on closed bus dropped");
            return 0;
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let delivered = self.deliver(event).await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        delivered
    }

    /// Batch publish; same per-event semantics as [`publish`](Self::publish).
    pub async fn publish_bulk(&self, events: Vec<StandardEvent>) -> usize {
        let mut delivered = 0;
        for event in events {
            delivered += self.publish(event).await;
        }
        delivered
    }

    async fn deliver(&self, event: StandardEvent) -> usize {
        let topic = event.topic();

        *self.published.lock().entry(topic.to_string()).or_insert(0) += 1;
        metrics::increment_counter!("bus_events_published_total", "topic" => topic);

        // Snapshot matching handlers so delivery never holds the list lock.
        let handlers: Vec<(String, Handler)> = {
            let subs = self.subscriptions.read().await;
            subs.iter()
                .filter(|s| s.matches(topic))
                .map(|s| (s.name.clone(), Arc::clone(&s.handler)))
                .collect()
        };

        let mut delivered = 0;
        for (name, handler) in handlers {
            // Guard: a failing handler is logged and the rest still run.
            if let Err(e) = handler(event.clone()).await {
                warn!(topic, subscriber = %name, error = %e, "bus handler failed");
            }
            delivered += 1;
            metrics::increment_counter!("bus_events_delivered_total", "topic" => topic);
        }

        *self.delivered.lock().entry(topic.to_string()).or_insert(0) += delivered as u64;
        delivered
    }

    /// Stop accepting publishes and wait for in-flight deliveries to drain.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.in_flight.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        debug!("event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> BusStats {
        BusStats {
            subscribers: self.subscriptions.read().await.len(),
            published: self.published.lock().clone(),
            delivered: self.delivered.lock().clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
