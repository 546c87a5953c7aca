//! Event store and storage projector.
//!
//! The store is a trait so the document backend stays a collaborator
//! concern: the SQLite implementation is the production default, the
//! in-memory one backs tests. Every write is an idempotent upsert, so
//! replaying any prefix of the event log converges to the same
//! projections.

pub mod memory;
pub mod projector;
pub mod sqlite;

pub use memory::MemoryEventStore;
pub use projector::StorageProjector;
pub use sqlite::SqliteEventStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::events::{StandardEvent, TraderPositionsPayload};
use crate::models::{Candle, OrderState, PositionSnapshot, Signal};

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append to the event log, keyed by event id (replay-safe).
    async fn append_event(&self, event: &StandardEvent) -> Result<()>;

    /// Compact signal record keyed by (symbol, timestamp).
    async fn upsert_signal(&self, signal: &Signal) -> Result<()>;

    /// Historical snapshot keyed by (address, observed timestamp).
    async fn insert_snapshot(&self, payload: &TraderPositionsPayload) -> Result<()>;

    /// Current-state projection keyed by address.
    async fn upsert_current_state(&self, payload: &TraderPositionsPayload) -> Result<()>;

    /// Order-state projection keyed by (address, oid).
    async fn upsert_order_state(&self, address: &str, orders: &[OrderState]) -> Result<()>;

    /// Per-symbol candle keyed by (symbol, interval, open time).
    async fn upsert_candle(&self, candle: &Candle) -> Result<()>;

    async fn latest_signal(&self, symbol: &str) -> Result<Option<Signal>>;

    async fn signal_history(&self, symbol: &str, limit: usize) -> Result<Vec<Signal>>;

    async fn current_state(&self, address: &str) -> Result<Option<PositionSnapshot>>;

    async fn position_history(&self, address: &str, limit: usize)
        -> Result<Vec<PositionSnapshot>>;

    async fn candle_history(
        &self,
        symbol: &str,
        interval_minutes: i64,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    async fn event_count(&self, topic: &str) -> Result<u64>;
}

pub(crate) fn snapshot_from_payload(payload: &TraderPositionsPayload) -> PositionSnapshot {
    PositionSnapshot {
        address: payload.address.clone(),
        positions: payload.positions.clone(),
        margin_summary: payload.margin_summary.clone(),
        source_timestamp: None,
        observed_timestamp: payload.timestamp,
    }
}
