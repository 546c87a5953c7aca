//! Per-address open-order tracking.
//!
//! Each webData2 refresh carries the complete set of resting orders, so the
//! tracker diffs the refresh against its last view: unseen oid = new order,
//! changed fields = update, vanished oid = cancelled or filled (a synthetic
//! zero-size entry marks the close).

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};

use crate::models::{OrderState, OrderStatus};
use crate::pool::wire::OpenOrderWire;

const CHANGE_EPSILON: f64 = 1e-6;

#[derive(Default)]
pub struct OrderTracker {
    states: HashMap<String, HashMap<u64, OrderState>>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff one refresh against tracked state and return the transitions.
    pub fn diff(
        &mut self,
        address: &str,
        open_orders: &[OpenOrderWire],
        now: DateTime<Utc>,
    ) -> Vec<OrderState> {
        let tracked = self.states.entry(address.to_string()).or_default();
        let mut transitions = Vec::new();
        let mut current_oids = HashSet::with_capacity(open_orders.len());

        for order in open_orders {
            current_oids.insert(order.oid);
            let timestamp = Utc
                .timestamp_millis_opt(order.timestamp)
                .single()
                .unwrap_or(now);

            match tracked.entry(order.oid) {
                Entry::Vacant(slot) => {
                    let state = OrderState {
                        oid: order.oid,
                        coin: order.coin.clone(),
                        side: order.side.clone(),
                        limit_price: order.limit_px,
                        size: order.sz,
                        orig_size: order.orig_sz,
                        status: OrderStatus::Open,
                        timestamp,
                    };
                    transitions.push(state.clone());
                    slot.insert(state);
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    let changed = existing.coin != order.coin
                        || existing.side != order.side
                        || (existing.limit_price - order.limit_px).abs() > CHANGE_EPSILON
                        || (existing.size - order.sz).abs() > CHANGE_EPSILON;
                    if changed {
                        existing.coin = order.coin.clone();
                        existing.side = order.side.clone();
                        existing.limit_price = order.limit_px;
                        existing.size = order.sz;
                        existing.orig_size = order.orig_sz;
                        existing.status = OrderStatus::Updated;
                        existing.timestamp = timestamp;
                        transitions.push(existing.clone());
                    }
                }
            }
        }

        // Orders that disappeared from the refresh were cancelled or filled.
        let vanished: Vec<u64> = tracked
            .keys()
            .filter(|oid| !current_oids.contains(oid))
            .copied()
            .collect();
        for oid in vanished {
            if let Some(state) = tracked.remove(&oid) {
                transitions.push(OrderState {
                    orig_size: state.size,
                    size: 0.0,
                    status: OrderStatus::Closed,
                    timestamp: now,
                    ..state
                });
            }
        }

        transitions
    }

    pub fn tracked_count(&self) -> usize {
        self.states.values().map(|orders| orders.len()).sum()
    }

    pub fn purge_address(&mut self, address: &str) {
        self.states.remove(address);
    }
}
