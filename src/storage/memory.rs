//! In-memory event store for tests and storeless runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{snapshot_from_payload, EventStore};
use crate::events::{StandardEvent, TraderPositionsPayload};
use crate::models::{Candle, OrderState, PositionSnapshot, Signal};

#[derive(Default)]
struct Inner {
    seen_events: HashSet<Uuid>,
    event_counts: HashMap<String, u64>,
    signals: BTreeMap<(String, i64), Signal>,
    snapshots: BTreeMap<(String, i64), PositionSnapshot>,
    current_state: HashMap<String, PositionSnapshot>,
    orders: HashMap<(String, u64), OrderState>,
    candles: BTreeMap<(String, i64, i64), Candle>,
}

#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<Inner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.lock().snapshots.len()
    }

    pub fn order_count(&self) -> usize {
        self.inner.lock().orders.len()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append_event(&self, event: &StandardEvent) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.seen_events.insert(event.event_id) {
            *inner
                .event_counts
                .entry(event.topic().to_string())
                .or_insert(0) += 1;
        }
        Ok(())
    }

    async fn upsert_signal(&self, signal: &Signal) -> Result<()> {
        let key = (signal.symbol.clone(), signal.timestamp.timestamp_millis());
        self.inner.lock().signals.insert(key, signal.clone());
        Ok(())
    }

    async fn insert_snapshot(&self, payload: &TraderPositionsPayload) -> Result<()> {
        let key = (
            payload.address.clone(),
            payload.timestamp.timestamp_millis(),
        );
        self.inner
            .lock()
            .snapshots
            .insert(key, snapshot_from_payload(payload));
        Ok(())
    }

    async fn upsert_current_state(&self, payload: &TraderPositionsPayload) -> Result<()> {
        self.inner
            .lock()
            .current_state
            .insert(payload.address.clone(), snapshot_from_payload(payload));
        Ok(())
    }

    async fn upsert_order_state(&self, address: &str, orders: &[OrderState]) -> Result<()> {
        let mut inner = self.inner.lock();
        for order in orders {
            inner
                .orders
                .insert((address.to_string(), order.oid), order.clone());
        }
        Ok(())
    }

    async fn upsert_candle(&self, candle: &Candle) -> Result<()> {
        let key = (
            candle.symbol.clone(),
            candle.interval_minutes,
            candle.open_time.timestamp_millis(),
        );
        self.inner.lock().candles.insert(key, candle.clone());
        Ok(())
    }

    async fn latest_signal(&self, symbol: &str) -> Result<Option<Signal>> {
        let inner = self.inner.lock();
        Ok(inner
            .signals
            .range((symbol.to_string(), i64::MIN)..=(symbol.to_string(), i64::MAX))
            .next_back()
            .map(|(_, signal)| signal.clone()))
    }

    async fn signal_history(&self, symbol: &str, limit: usize) -> Result<Vec<Signal>> {
        let inner = self.inner.lock();
        Ok(inner
            .signals
            .range((symbol.to_string(), i64::MIN)..=(symbol.to_string(), i64::MAX))
            .rev()
            .take(limit)
            .map(|(_, signal)| signal.clone())
            .collect())
    }

    async fn current_state(&self, address: &str) -> Result<Option<PositionSnapshot>> {
        Ok(self.inner.lock().current_state.get(address).cloned())
    }

    async fn position_history(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<PositionSnapshot>> {
        let inner = self.inner.lock();
        Ok(inner
            .snapshots
            .range((address.to_string(), i64::MIN)..=(address.to_string(), i64::MAX))
            .rev()
            .take(limit)
            .map(|(_, snapshot)| snapshot.clone())
            .collect())
    }

    async fn candle_history(
        &self,
        symbol: &str,
        interval_minutes: i64,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let inner = self.inner.lock();
        Ok(inner
            .candles
            .range(
                (symbol.to_string(), interval_minutes, i64::MIN)
                    ..=(symbol.to_string(), interval_minutes, i64::MAX),
            )
            .rev()
            .take(limit)
            .map(|(_, candle)| candle.clone())
            .collect())
    }

    async fn event_count(&self, topic: &str) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .event_counts
            .get(topic)
            .copied()
            .unwrap_or(0))
    }
}
