//! SQLite-backed event store.
//!
//! WAL mode for concurrent reads during writes, cached prepared statements,
//! and `ON CONFLICT` upserts on every projection so replays converge.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::info;

use super::{snapshot_from_payload, EventStore};
use crate::events::{StandardEvent, TraderPositionsPayload};
use crate::models::{Candle, OrderState, PositionSnapshot, Signal};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS events (
    event_id     TEXT PRIMARY KEY,
    topic        TEXT NOT NULL,
    source       TEXT NOT NULL,
    ts           INTEGER NOT NULL,
    payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_topic_ts ON events(topic, ts);

CREATE TABLE IF NOT EXISTS signals (
    symbol      TEXT NOT NULL,
    ts          INTEGER NOT NULL,
    signal_json TEXT NOT NULL,
    PRIMARY KEY (symbol, ts)
);

CREATE TABLE IF NOT EXISTS position_snapshots (
    address       TEXT NOT NULL,
    ts            INTEGER NOT NULL,
    snapshot_json TEXT NOT NULL,
    PRIMARY KEY (address, ts)
);

CREATE TABLE IF NOT EXISTS current_state (
    address       TEXT PRIMARY KEY,
    ts            INTEGER NOT NULL,
    snapshot_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS order_states (
    address    TEXT NOT NULL,
    oid        INTEGER NOT NULL,
    status     TEXT NOT NULL,
    ts         INTEGER NOT NULL,
    order_json TEXT NOT NULL,
    PRIMARY KEY (address, oid)
);

CREATE TABLE IF NOT EXISTS candles (
    symbol           TEXT NOT NULL,
    interval_minutes INTEGER NOT NULL,
    open_time        INTEGER NOT NULL,
    candle_json      TEXT NOT NULL,
    PRIMARY KEY (symbol, interval_minutes, open_time)
);
"#;

pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path.as_ref(), flags)
            .with_context(|| format!("open event store at {}", path.as_ref().display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("apply event store schema")?;
        info!(path = %path.as_ref().display(), "event store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append_event(&self, event: &StandardEvent) -> Result<()> {
        let payload_json = serde_json::to_string(event)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO events (event_id, topic, source, ts, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(event_id) DO NOTHING",
        )?;
        stmt.execute(params![
            event.event_id.to_string(),
            event.topic(),
            event.source,
            event.timestamp.timestamp_millis(),
            payload_json,
        ])?;
        Ok(())
    }

    async fn upsert_signal(&self, signal: &Signal) -> Result<()> {
        let signal_json = serde_json::to_string(signal)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO signals (symbol, ts, signal_json)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol, ts) DO UPDATE SET signal_json = excluded.signal_json",
        )?;
        stmt.execute(params![
            signal.symbol,
            signal.timestamp.timestamp_millis(),
            signal_json,
        ])?;
        Ok(())
    }

    async fn insert_snapshot(&self, payload: &TraderPositionsPayload) -> Result<()> {
        let snapshot_json = serde_json::to_string(&snapshot_from_payload(payload))?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO position_snapshots (address, ts, snapshot_json)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(address, ts) DO UPDATE SET snapshot_json = excluded.snapshot_json",
        )?;
        stmt.execute(params![
            payload.address,
            payload.timestamp.timestamp_millis(),
            snapshot_json,
        ])?;
        Ok(())
    }

    async fn upsert_current_state(&self, payload: &TraderPositionsPayload) -> Result<()> {
        let snapshot_json = serde_json::to_string(&snapshot_from_payload(payload))?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO current_state (address, ts, snapshot_json)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(address) DO UPDATE
                 SET ts = excluded.ts, snapshot_json = excluded.snapshot_json",
        )?;
        stmt.execute(params![
            payload.address,
            payload.timestamp.timestamp_millis(),
            snapshot_json,
        ])?;
        Ok(())
    }

    async fn upsert_order_state(&self, address: &str, orders: &[OrderState]) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO order_states (address, oid, status, ts, order_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(address, oid) DO UPDATE
                 SET status = excluded.status, ts = excluded.ts,
                     order_json = excluded.order_json",
        )?;
        for order in orders {
            let order_json = serde_json::to_string(order)?;
            stmt.execute(params![
                address,
                order.oid,
                order.status.as_str(),
                order.timestamp.timestamp_millis(),
                order_json,
            ])?;
        }
        Ok(())
    }

    async fn upsert_candle(&self, candle: &Candle) -> Result<()> {
        let candle_json = serde_json::to_string(candle)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO candles (symbol, interval_minutes, open_time, candle_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol, interval_minutes, open_time)
                 DO UPDATE SET candle_json = excluded.candle_json",
        )?;
        stmt.execute(params![
            candle.symbol,
            candle.interval_minutes,
            candle.open_time.timestamp_millis(),
            candle_json,
        ])?;
        Ok(())
    }

    async fn latest_signal(&self, symbol: &str) -> Result<Option<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT signal_json FROM signals WHERE symbol = ?1 ORDER BY ts DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![symbol])?;
        match rows.next()? {
            Some(row) => {
                let json: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn signal_history(&self, symbol: &str, limit: usize) -> Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT signal_json FROM signals WHERE symbol = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut signals = Vec::new();
        for json in rows {
            signals.push(serde_json::from_str(&json?)?);
        }
        Ok(signals)
    }

    async fn current_state(&self, address: &str) -> Result<Option<PositionSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT snapshot_json FROM current_state WHERE address = ?1")?;
        let mut rows = stmt.query(params![address])?;
        match rows.next()? {
            Some(row) => {
                let json: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn position_history(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<PositionSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT snapshot_json FROM position_snapshots
             WHERE address = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![address, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut snapshots = Vec::new();
        for json in rows {
            snapshots.push(serde_json::from_str(&json?)?);
        }
        Ok(snapshots)
    }

    async fn candle_history(
        &self,
        symbol: &str,
        interval_minutes: i64,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT candle_json FROM candles
             WHERE symbol = ?1 AND interval_minutes = ?2
             ORDER BY open_time DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![symbol, interval_minutes, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut candles = Vec::new();
        for json in rows {
            candles.push(serde_json::from_str(&json?)?);
        }
        Ok(candles)
    }

    async fn event_count(&self, topic: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT COUNT(*) FROM events WHERE topic = ?1")?;
        let count: i64 = stmt.query_row(params![topic], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use crate::models::{MarginSummary, OrderStatus, Position, Recommendation};
    use chrono::{Duration, Utc};

    fn temp_store() -> (tempfile::TempDir, SqliteEventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn payload(address: &str, size: f64) -> TraderPositionsPayload {
        TraderPositionsPayload {
            address: address.to_string(),
            symbol: "BTC".to_string(),
            positions: vec![Position {
                coin: "BTC".to_string(),
                size,
                leverage: 10.0,
                entry_price: 96_000.0,
                margin: 0.0,
            }],
            margin_summary: MarginSummary::default(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_replay_is_idempotent() {
        let (_dir, store) = temp_store();
        let event = StandardEvent::new(
            "test",
            EventPayload::TraderPositions(payload("0xaa", 1.0)),
        );

        store.append_event(&event).await.unwrap();
        store.append_event(&event).await.unwrap();
        assert_eq!(store.event_count("trader_positions").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_current_state_and_history_projections() {
        let (_dir, store) = temp_store();
        let mut p = payload("0xaa", 1.0);

        store.insert_snapshot(&p).await.unwrap();
        store.upsert_current_state(&p).await.unwrap();

        p.timestamp = p.timestamp + Duration::seconds(1);
        p.positions[0].size = 2.0;
        store.insert_snapshot(&p).await.unwrap();
        store.upsert_current_state(&p).await.unwrap();

        let current = store.current_state("0xaa").await.unwrap().unwrap();
        assert!((current.positions[0].size - 2.0).abs() < 1e-9);

        let history = store.position_history("0xaa", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!((history[0].positions[0].size - 2.0).abs() < 1e-9);
        assert!((history[1].positions[0].size - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_signal_upsert_and_latest() {
        let (_dir, store) = temp_store();
        let base = Utc::now();
        for i in 0..3i64 {
            let signal = Signal {
                symbol: "BTC".to_string(),
                long_bias: 0.6,
                short_bias: 0.4,
                net_exposure: i as f64,
                traders_long: 2,
                traders_short: 1,
                traders_flat: 0,
                recommendation: Recommendation::Buy,
                confidence: 0.6,
                price: 97_000.0,
                timestamp: base + Duration::seconds(i),
            };
            store.upsert_signal(&signal).await.unwrap();
            // Replaying the same key must not duplicate
            store.upsert_signal(&signal).await.unwrap();
        }

        let latest = store.latest_signal("BTC").await.unwrap().unwrap();
        assert!((latest.net_exposure - 2.0).abs() < 1e-9);
        assert_eq!(store.signal_history("BTC", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_order_state_upsert() {
        let (_dir, store) = temp_store();
        let order = OrderState {
            oid: 9,
            coin: "BTC".to_string(),
            side: "B".to_string(),
            limit_price: 95_000.0,
            size: 1.0,
            orig_size: 1.0,
            status: OrderStatus::Open,
            timestamp: Utc::now(),
        };
        store.upsert_order_state("0xaa", &[order.clone()]).await.unwrap();

        let closed = OrderState {
            size: 0.0,
            status: OrderStatus::Closed,
            ..order
        };
        store.upsert_order_state("0xaa", &[closed]).await.unwrap();

        // One row per (address, oid); the close overwrote the open
        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM order_states", [], |r| r.get(0))
            .unwrap();
        let status: String = conn
            .query_row(
                "SELECT status FROM order_states WHERE address = '0xaa' AND oid = 9",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(status, "closed");
    }
}
