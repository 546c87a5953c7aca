//! Persistent WebSocket connection pool.
//!
//! N independent clients, each owning a disjoint trader batch. Client-level
//! reconnection lives in [`client`]; the pool supervises clients that have
//! exhausted their reconnect budget and replaces them wholesale.

pub mod client;
pub mod wire;

pub use client::TraderWsClient;
pub use wire::Envelope;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::{ExchangeConfig, PoolConfig};
use crate::models::normalize_address;

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub running: bool,
    pub total_clients: usize,
    pub connected_clients: usize,
    pub tracked_traders: usize,
}

/// Slice of the roster assigned to one client slot
fn slot_batch(roster: &[String], client_id: usize, batch_size: usize) -> Vec<String> {
    let start = client_id * batch_size;
    if start >= roster.len() {
        return Vec::new();
    }
    let end = (start + batch_size).min(roster.len());
    roster[start..end].to_vec()
}

pub struct ConnectionPool {
    exchange: ExchangeConfig,
    config: PoolConfig,
    clients: RwLock<Vec<Option<Arc<TraderWsClient>>>>,
    tracked: RwLock<Vec<String>>,
    frame_tx: mpsc::UnboundedSender<Envelope>,
    disconnect_tx: mpsc::UnboundedSender<usize>,
    disconnect_rx: Mutex<Option<mpsc::UnboundedReceiver<usize>>>,
    running: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        exchange: ExchangeConfig,
        config: PoolConfig,
        frame_tx: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        Self {
            exchange,
            config,
            clients: RwLock::new(Vec::new()),
            tracked: RwLock::new(Vec::new()),
            frame_tx,
            disconnect_tx,
            disconnect_rx: Mutex::new(Some(disconnect_rx)),
            running: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        }
    }

    fn make_client(&self, client_id: usize, batch: Vec<String>) -> Arc<TraderWsClient> {
        Arc::new(TraderWsClient::new(
            client_id,
            batch,
            self.exchange.clone(),
            self.config.clone(),
            self.frame_tx.clone(),
            self.disconnect_tx.clone(),
        ))
    }

    /// Split the roster into batches, start one client per batch, and spawn
    /// the replacement supervisor.
    pub async fn start(self: Arc<Self>, traders: Vec<String>) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("connection pool already running");
            return;
        }

        let roster: Vec<String> = traders
            .iter()
            .filter_map(|raw| {
                let normalized = normalize_address(raw);
                if normalized.is_none() {
                    warn!(address = %raw, "dropping invalid trader address");
                }
                normalized
            })
            .collect();
        *self.tracked.write() = roster.clone();

        info!(
            traders = roster.len(),
            num_clients = self.config.num_clients,
            batch_size = self.config.batch_size,
            "starting connection pool"
        );

        let mut clients = Vec::with_capacity(self.config.num_clients);
        for client_id in 0..self.config.num_clients {
            let batch = slot_batch(&roster, client_id, self.config.batch_size);
            if batch.is_empty() {
                clients.push(None);
            } else {
                clients.push(Some(self.make_client(client_id, batch)));
            }
        }
        *self.clients.write() = clients;

        let to_start: Vec<Arc<TraderWsClient>> = self
            .clients
            .read()
            .iter()
            .flatten()
            .map(Arc::clone)
            .collect();
        let results = join_all(to_start.iter().map(|c| c.start())).await;
        let successful = results.iter().filter(|ok| **ok).count();
        info!(successful, total = to_start.len(), "pool clients started");

        // Supervisor: replaces clients that exhausted their reconnect budget.
        if let Some(mut disconnect_rx) = self.disconnect_rx.lock().take() {
            let pool = Arc::clone(&self);
            let task = tokio::spawn(async move {
                while let Some(client_id) = disconnect_rx.recv().await {
                    if !pool.running.load(Ordering::Acquire) {
                        break;
                    }
                    pool.replace_client(client_id).await;
                }
            });
            *self.supervisor.lock() = Some(task);
        }
    }

    /// Replacement protocol: stop the dead client, cool down, rebuild the
    /// batch from the current roster, and restart a same-id client with a
    /// bounded number of attempts.
    async fn replace_client(&self, client_id: usize) {
        warn!(client_id, "client disconnected, scheduling replacement");

        let old = {
            let mut clients = self.clients.write();
            clients.get_mut(client_id).and_then(|slot| slot.take())
        };
        if let Some(old) = old {
            old.stop();
        }

        sleep(Duration::from_secs(self.config.replace_cooldown_secs)).await;
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        let batch = slot_batch(&self.tracked.read(), client_id, self.config.batch_size);
        if batch.is_empty() {
            warn!(client_id, "no traders for slot, leaving it empty");
            return;
        }

        let replacement = self.make_client(client_id, batch.clone());
        for attempt in 1..=self.config.replace_max_attempts {
            if replacement.start().await {
                info!(client_id, traders = batch.len(), "client replaced");
                if let Some(slot) = self.clients.write().get_mut(client_id) {
                    *slot = Some(replacement);
                }
                return;
            }
            warn!(client_id, attempt, "client restart attempt failed");
            sleep(Duration::from_secs(10 * attempt as u64)).await;
            if !self.running.load(Ordering::Acquire) {
                return;
            }
        }

        error!(
            client_id,
            attempts = self.config.replace_max_attempts,
            "client replacement exhausted, slot left empty"
        );
    }

    /// Track a new trader: joins the roster and the first client with room,
    /// or a fresh client when all existing ones are full.
    pub async fn add_trader(&self, raw: &str) {
        let Some(address) = normalize_address(raw) else {
            warn!(address = %raw, "invalid trader address");
            return;
        };

        {
            let mut tracked = self.tracked.write();
            if tracked.iter().any(|a| *a == address) {
                return;
            }
            tracked.push(address.clone());
        }

        let existing = self
            .clients
            .read()
            .iter()
            .flatten()
            .find(|c| c.trader_count() < self.config.batch_size)
            .map(Arc::clone);
        if let Some(client) = existing {
            client.subscribe(&address);
            return;
        }

        // All live clients are full; claim the first empty slot.
        let empty_slot = self
            .clients
            .read()
            .iter()
            .position(|slot| slot.is_none());
        if let Some(client_id) = empty_slot {
            let client = self.make_client(client_id, vec![address]);
            client.start().await;
            if let Some(slot) = self.clients.write().get_mut(client_id) {
                *slot = Some(client);
            }
        } else {
            warn!(address = %address, "pool at capacity, trader queued in roster only");
        }
    }

    pub fn remove_trader(&self, raw: &str) {
        let Some(address) = normalize_address(raw) else {
            return;
        };
        self.tracked.write().retain(|a| *a != address);
        for client in self.clients.read().iter().flatten() {
            if client.traders().iter().any(|a| *a == address) {
                client.unsubscribe(&address);
            }
        }
    }

    pub fn tracked_traders(&self) -> Vec<String> {
        self.tracked.read().clone()
    }

    pub fn stats(&self) -> PoolStats {
        let clients = self.clients.read();
        PoolStats {
            running: self.running.load(Ordering::Acquire),
            total_clients: clients.iter().flatten().count(),
            connected_clients: clients
                .iter()
                .flatten()
                .filter(|c| c.is_connected())
                .count(),
            tracked_traders: self.tracked.read().len(),
        }
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping connection pool");
        for client in self.clients.read().iter().flatten() {
            client.stop();
        }
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
    }
}
