//! Frame router and de-duplication.
//!
//! Inbound frames land in a mutex-guarded buffer; a periodic flusher (or a
//! full buffer) drains it outside the lock. Each webData2 frame is filtered
//! to live target-symbol positions and emitted only when the normalized
//! position tuple changed or the max-save-interval elapsed. Open orders are
//! diffed into lifecycle transitions. Storage savings come entirely from
//! this event-driven gate.

pub mod orders;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::RouterConfig;
use crate::events::{EventPayload, StandardEvent, TraderOrdersPayload, TraderPositionsPayload};
use crate::models::{normalize_address, Position};
use crate::pool::wire::{Envelope, InboundMessage, WebData2};
use orders::OrderTracker;

const SOURCE: &str = "frame_router";

/// Sorted `coin:size` tuple at 8 decimal places; the de-dup key.
pub fn normalize_positions(positions: &[Position]) -> String {
    let mut parts: Vec<(String, f64)> = positions
        .iter()
        .map(|p| (p.coin.clone(), p.size))
        .collect();
    parts.sort_by(|a, b| a.0.cmp(&b.0));
    parts
        .iter()
        .map(|(coin, size)| format!("{coin}:{size:.8}"))
        .collect::<Vec<_>>()
        .join("|")
}

struct LastSaved {
    normalized: String,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    pub messages_received: u64,
    pub positions_saved: u64,
    pub positions_skipped: u64,
    pub order_events: u64,
    pub parse_errors: u64,
    pub buffer_size: usize,
    pub tracked_orders: usize,
}

pub struct FrameRouter {
    config: RouterConfig,
    target_symbol: String,
    target_only: bool,
    bus: Arc<EventBus>,
    buffer: Mutex<Vec<Envelope>>,
    last_positions: Mutex<HashMap<String, LastSaved>>,
    orders: Mutex<OrderTracker>,
    messages_received: AtomicU64,
    positions_saved: AtomicU64,
    positions_skipped: AtomicU64,
    order_events: AtomicU64,
    parse_errors: AtomicU64,
}

impl FrameRouter {
    pub fn new(
        config: RouterConfig,
        target_symbol: String,
        target_only: bool,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            target_symbol,
            target_only,
            bus,
            buffer: Mutex::new(Vec::new()),
            last_positions: Mutex::new(HashMap::new()),
            orders: Mutex::new(OrderTracker::new()),
            messages_received: AtomicU64::new(0),
            positions_saved: AtomicU64::new(0),
            positions_skipped: AtomicU64::new(0),
            order_events: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
        }
    }

    /// Buffer one frame. Returns true when the buffer hit its cap and the
    /// caller should flush immediately (outside this call, outside the lock).
    pub fn handle_frame(&self, envelope: Envelope) -> bool {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        let mut buffer = self.buffer.lock();
        buffer.push(envelope);
        if buffer.len() >= self.config.buffer_max_size {
            debug!(size = buffer.len(), "frame buffer full, requesting flush");
            return true;
        }
        false
    }

    /// Drain the buffer and publish the resulting events.
    pub async fn flush(&self) {
        self.flush_at(Utc::now()).await;
    }

    async fn flush_at(&self, now: DateTime<Utc>) {
        let frames: Vec<Envelope> = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let mut events = Vec::new();
        for envelope in frames {
            match envelope.into_message() {
                Ok(InboundMessage::WebData2(data)) => {
                    self.process_webdata2(*data, now, &mut events);
                }
                Ok(InboundMessage::SubscriptionAck) | Ok(InboundMessage::Pong) => {}
                Ok(InboundMessage::Unknown(channel)) => {
                    debug!(channel, "ignoring frame on unhandled channel");
                }
                Err(e) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "dropping unparseable frame");
                }
            }
        }

        if !events.is_empty() {
            let count = events.len();
            self.bus.publish_bulk(events).await;
            debug!(events = count, "flush published events");
        }
    }

    fn process_webdata2(&self, data: WebData2, now: DateTime<Utc>, events: &mut Vec<StandardEvent>) {
        let Some(address) = normalize_address(&data.user) else {
            warn!(user = %data.user, "frame with invalid address dropped");
            return;
        };

        // Orders diff runs on every refresh, independent of position de-dup.
        let transitions = self
            .orders
            .lock()
            .diff(&address, &data.open_orders, now);
        if !transitions.is_empty() {
            self.order_events
                .fetch_add(transitions.len() as u64, Ordering::Relaxed);
            events.push(StandardEvent::new(
                SOURCE,
                EventPayload::TraderOrders(TraderOrdersPayload {
                    address: address.clone(),
                    orders: transitions,
                }),
            ));
        }

        let active: Vec<Position> = data
            .clearinghouse_state
            .asset_positions
            .into_iter()
            .map(|ap| Position::from(ap.position))
            .filter(|p| p.size != 0.0)
            .collect();
        if active.is_empty() {
            return;
        }

        let filtered: Vec<Position> = if self.target_only {
            active
                .into_iter()
                .filter(|p| p.coin == self.target_symbol)
                .collect()
        } else {
            active
        };
        if filtered.is_empty() {
            self.positions_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !self.should_save(&address, &filtered, now) {
            self.positions_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.positions_saved.fetch_add(1, Ordering::Relaxed);
        self.last_positions.lock().insert(
            address.clone(),
            LastSaved {
                normalized: normalize_positions(&filtered),
                saved_at: now,
            },
        );

        events.push(StandardEvent::new(
            SOURCE,
            EventPayload::TraderPositions(TraderPositionsPayload {
                address,
                symbol: self.target_symbol.clone(),
                positions: filtered,
                margin_summary: data.clearinghouse_state.margin_summary.into(),
                timestamp: now,
            }),
        ));
    }

    fn should_save(&self, address: &str, positions: &[Position], now: DateTime<Utc>) -> bool {
        let last_positions = self.last_positions.lock();
        let Some(last) = last_positions.get(address) else {
            return true;
        };
        let max_interval = Duration::seconds(self.config.position_max_save_interval_secs as i64);
        if now - last.saved_at >= max_interval {
            return true;
        }
        last.normalized != normalize_positions(positions)
    }

    /// Drop all per-address state for a trader (eviction, corruption purge).
    pub fn purge_address(&self, address: &str) {
        self.last_positions.lock().remove(address);
        self.orders.lock().purge_address(address);
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            positions_saved: self.positions_saved.load(Ordering::Relaxed),
            positions_skipped: self.positions_skipped.load(Ordering::Relaxed),
            order_events: self.order_events.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            buffer_size: self.buffer.lock().len(),
            tracked_orders: self.orders.lock().tracked_count(),
        }
    }
}
