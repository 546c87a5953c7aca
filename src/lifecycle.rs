//! Core context: owns every component and its lifecycle.
//!
//! Startup order: event bus, storage projector (`*`), processors (their
//! topics), mark-price poller, connection pool, periodic tasks. Shutdown
//! runs in reverse, each step wrapped so one failing teardown never blocks
//! the rest. There are no global singletons; the Core is built in `main`
//! and handed to whoever needs it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{BusStats, EventBus};
use crate::config::CoreConfig;
use crate::events::{EventPayload, ScoredTradersPayload, StandardEvent};
use crate::exchange::{spawn_mark_price_collector, InfoClient};
use crate::models::{Candle, PositionSnapshot, ScoredTrader, Signal, WhaleAlert};
use crate::pool::{ConnectionPool, Envelope, PoolStats};
use crate::processors::{
    CandleProcessor, CandleStats, SignalGenerator, SignalStats, WhaleDetector, WhaleStats,
};
use crate::router::{FrameRouter, RouterStats};
use crate::storage::projector::ProjectorStats;
use crate::storage::{EventStore, SqliteEventStore, StorageProjector};

#[derive(Debug, Clone, Default)]
pub struct CoreStats {
    pub pool: PoolStats,
    pub router: RouterStats,
    pub signal: SignalStats,
    pub whale: WhaleStats,
    pub candles: CandleStats,
    pub projector: ProjectorStats,
    pub bus: BusStats,
}

/// Read-only surface consumed by the public API collaborator. Transport
/// (HTTP, RPC) is the collaborator's choice.
#[async_trait]
pub trait CoreApi: Send + Sync {
    async fn latest_signal(&self, symbol: &str) -> Result<Option<Signal>>;
    async fn signal_history(&self, symbol: &str, limit: usize) -> Result<Vec<Signal>>;
    fn active_alerts(&self) -> Vec<WhaleAlert>;
    fn recent_alerts(&self, limit: usize) -> Vec<WhaleAlert>;
    async fn trader_state(&self, address: &str) -> Result<Option<PositionSnapshot>>;
    async fn position_history(&self, address: &str, limit: usize)
        -> Result<Vec<PositionSnapshot>>;
    async fn candle_history(
        &self,
        symbol: &str,
        interval_minutes: i64,
        limit: usize,
    ) -> Result<Vec<Candle>>;
    async fn stats(&self) -> CoreStats;
}

pub struct Core {
    config: CoreConfig,
    bus: Arc<EventBus>,
    store: Arc<dyn EventStore>,
    projector: Arc<StorageProjector>,
    router: Arc<FrameRouter>,
    pool: Arc<ConnectionPool>,
    signal: Arc<SignalGenerator>,
    whale: Arc<WhaleDetector>,
    candles: Arc<CandleProcessor>,
    info: Arc<InfoClient>,
    frame_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Core {
    pub fn new(config: CoreConfig) -> Result<Arc<Self>> {
        let store: Arc<dyn EventStore> =
            Arc::new(SqliteEventStore::open(&config.storage.db_path)?);
        Self::with_store(config, store)
    }

    pub fn with_store(config: CoreConfig, store: Arc<dyn EventStore>) -> Result<Arc<Self>> {
        let bus = Arc::new(EventBus::new());
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let router = Arc::new(FrameRouter::new(
            config.router.clone(),
            config.exchange.target_symbol.clone(),
            config.exchange.target_only,
            Arc::clone(&bus),
        ));
        let pool = Arc::new(ConnectionPool::new(
            config.exchange.clone(),
            config.pool.clone(),
            frame_tx,
        ));
        let signal = Arc::new(SignalGenerator::new(
            config.signal.clone(),
            config.exchange.target_symbol.clone(),
        ));
        let whale = Arc::new(WhaleDetector::new(config.whale.clone()));
        let candles = Arc::new(CandleProcessor::new(
            config.exchange.target_symbol.clone(),
            config.exchange.candle_timeframes.clone(),
        ));
        let projector = Arc::new(StorageProjector::new(
            Arc::clone(&store),
            config.storage.skip_topics.clone(),
        ));
        let info = Arc::new(InfoClient::new(&config.exchange)?);

        Ok(Arc::new(Self {
            config,
            bus,
            store,
            projector,
            router,
            pool,
            signal,
            whale,
            candles,
            info,
            frame_rx: Mutex::new(Some(frame_rx)),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }

    pub async fn start(&self, traders: Vec<String>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("core already started");
            return Ok(());
        }
        info!(
            symbol = %self.config.exchange.target_symbol,
            traders = traders.len(),
            "core starting"
        );

        // Storage first so it observes everything the processors emit.
        Arc::clone(&self.projector).register(&self.bus).await;
        self.register_processors().await;

        // Frame drain: pool clients feed this channel; a full buffer flushes
        // immediately, outside the buffer lock.
        if let Some(mut frame_rx) = self.frame_rx.lock().take() {
            let router = Arc::clone(&self.router);
            self.spawn_task(async move {
                while let Some(envelope) = frame_rx.recv().await {
                    if router.handle_frame(envelope) {
                        router.flush().await;
                    }
                }
            });
        }

        // Periodic flusher
        let router = Arc::clone(&self.router);
        let flush_interval = self.config.router.flush_interval_secs.max(1);
        self.spawn_task(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(flush_interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                router.flush().await;
            }
        });

        // Health tick
        let pool = Arc::clone(&self.pool);
        let router = Arc::clone(&self.router);
        let signal = Arc::clone(&self.signal);
        let whale = Arc::clone(&self.whale);
        let projector = Arc::clone(&self.projector);
        self.spawn_task(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pool_stats = pool.stats();
                let router_stats = router.stats();
                info!(
                    connected_clients = pool_stats.connected_clients,
                    total_clients = pool_stats.total_clients,
                    tracked_traders = pool_stats.tracked_traders,
                    buffered_frames = router_stats.buffer_size,
                    positions_saved = router_stats.positions_saved,
                    positions_skipped = router_stats.positions_skipped,
                    signals_generated = signal.stats().signals_generated,
                    active_alerts = whale.stats().active_alerts,
                    events_stored = projector.stats().events_stored,
                    "health"
                );
            }
        });

        // Mark-price poller (interval 0 disables it; tests use that)
        if self.config.exchange.mark_price_interval_secs > 0 {
            let task = spawn_mark_price_collector(
                Arc::clone(&self.info),
                Arc::clone(&self.bus),
                self.config.exchange.target_symbol.clone(),
                self.config.exchange.mark_price_interval_secs,
            );
            self.tasks.lock().push(task);
        }

        // Pool last: frames only start flowing once everyone listens.
        Arc::clone(&self.pool).start(traders).await;

        info!("core started");
        Ok(())
    }

    async fn register_processors(&self) {
        for topic in [
            crate::events::topics::TRADER_POSITIONS,
            crate::events::topics::SCORED_TRADERS,
            crate::events::topics::MARK_PRICE,
            crate::events::topics::MARKET_REGIME,
        ] {
            let signal = Arc::clone(&self.signal);
            let bus = Arc::clone(&self.bus);
            self.bus
                .subscribe(topic, "signal_generator", move |event| {
                    let signal = Arc::clone(&signal);
                    let bus = Arc::clone(&bus);
                    async move {
                        if let Some(out) = signal.handle_event(&event) {
                            bus.publish(out).await;
                        }
                        Ok(())
                    }
                })
                .await;
        }

        for topic in [
            crate::events::topics::TRADER_POSITIONS,
            crate::events::topics::SCORED_TRADERS,
        ] {
            let whale = Arc::clone(&self.whale);
            let bus = Arc::clone(&self.bus);
            self.bus
                .subscribe(topic, "whale_detector", move |event| {
                    let whale = Arc::clone(&whale);
                    let bus = Arc::clone(&bus);
                    async move {
                        if let Some(out) = whale.handle_event(&event) {
                            bus.publish(out).await;
                        }
                        Ok(())
                    }
                })
                .await;
        }

        let candles = Arc::clone(&self.candles);
        let bus = Arc::clone(&self.bus);
        self.bus
            .subscribe(
                crate::events::topics::MARK_PRICE,
                "candle_processor",
                move |event| {
                    let candles = Arc::clone(&candles);
                    let bus = Arc::clone(&bus);
                    async move {
                        let completed = candles.handle_event(&event);
                        if !completed.is_empty() {
                            bus.publish_bulk(completed).await;
                        }
                        Ok(())
                    }
                },
            )
            .await;
    }

    fn spawn_task(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.lock().push(tokio::spawn(future));
    }

    /// Reverse of startup; every step is independent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("core stopping");

        self.pool.stop();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        // One last flush so buffered frames reach storage.
        self.router.flush().await;
        self.bus.close().await;

        info!("core stopped");
    }

    /// Entry point for the leaderboard collaborator: publish a scored batch
    /// and optionally grow the tracked roster from it.
    pub async fn publish_scored_traders(&self, traders: Vec<ScoredTrader>, track: bool) {
        if track {
            for trader in &traders {
                self.pool.add_trader(&trader.address).await;
            }
        }
        self.bus
            .publish(StandardEvent::new(
                "leaderboard",
                EventPayload::ScoredTraders(ScoredTradersPayload { traders }),
            ))
            .await;
    }

    /// Invariant-violation recovery: drop every trace of one address and
    /// keep processing.
    pub fn purge_trader(&self, address: &str) {
        warn!(address, "purging trader state");
        self.router.purge_address(address);
        self.signal.purge_address(address);
        self.whale.purge_address(address);
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn info_client(&self) -> Arc<InfoClient> {
        Arc::clone(&self.info)
    }
}

#[async_trait]
impl CoreApi for Core {
    async fn latest_signal(&self, symbol: &str) -> Result<Option<Signal>> {
        if symbol == self.config.exchange.target_symbol {
            if let Some(signal) = self.signal.last_signal() {
                return Ok(Some(signal));
            }
        }
        self.store.latest_signal(symbol).await
    }

    async fn signal_history(&self, symbol: &str, limit: usize) -> Result<Vec<Signal>> {
        self.store.signal_history(symbol, limit).await
    }

    fn active_alerts(&self) -> Vec<WhaleAlert> {
        self.whale.active_alerts()
    }

    fn recent_alerts(&self, limit: usize) -> Vec<WhaleAlert> {
        self.whale.recent_alerts(limit)
    }

    async fn trader_state(&self, address: &str) -> Result<Option<PositionSnapshot>> {
        self.store.current_state(address).await
    }

    async fn position_history(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<PositionSnapshot>> {
        self.store.position_history(address, limit).await
    }

    async fn candle_history(
        &self,
        symbol: &str,
        interval_minutes: i64,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.store.candle_history(symbol, interval_minutes, limit).await
    }

    async fn stats(&self) -> CoreStats {
        CoreStats {
            pool: self.pool.stats(),
            router: self.router.stats(),
            signal: self.signal.stats(),
            whale: self.whale.stats(),
            candles: self.candles.stats(),
            projector: self.projector.stats(),
            bus: self.bus.stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TraderPositionsPayload;
    use crate::models::{MarginSummary, Position, Recommendation};
    use crate::storage::MemoryEventStore;
    use chrono::Utc;

    fn test_config() -> CoreConfig {
        let mut config = CoreConfig::default();
        // No network in tests: no mark-price poller, no pool clients.
        config.exchange.mark_price_interval_secs = 0;
        config
    }

    fn positions_event(address: &str, size: f64, account_value: f64) -> StandardEvent {
        StandardEvent::new(
            "test",
            EventPayload::TraderPositions(TraderPositionsPayload {
                address: address.to_string(),
                symbol: "BTC".to_string(),
                positions: vec![Position {
                    coin: "BTC".to_string(),
                    size,
                    leverage: 10.0,
                    entry_price: 96_000.0,
                    margin: 0.0,
                }],
                margin_summary: MarginSummary {
                    account_value,
                    total_ntl_pos: 0.0,
                    total_margin_used: 0.0,
                },
                timestamp: Utc::now(),
            }),
        )
    }

    #[tokio::test]
    async fn test_full_event_flow_through_core() {
        let store = Arc::new(MemoryEventStore::new());
        let core = Core::with_store(test_config(), Arc::clone(&store) as Arc<dyn EventStore>)
            .unwrap();
        core.start(Vec::new()).await.unwrap();

        let trader = "0x00000000000000000000000000000000000000aa";
        core.publish_scored_traders(
            vec![ScoredTrader {
                address: trader.to_string(),
                score: 100.0,
                account_value: 25_000_000.0,
                display_name: None,
            }],
            false,
        )
        .await;

        core.bus().publish(positions_event(trader, 100.0, 25_000_000.0)).await;

        // Signal generated, re-published, and projected
        let signal = core.latest_signal("BTC").await.unwrap().unwrap();
        assert_eq!(signal.recommendation, Recommendation::Buy);
        assert!((signal.long_bias - 1.0).abs() < 1e-9);

        // Whale alert raised for the alpha-whale entry
        let alerts = core.active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].priority, crate::models::AlertPriority::Critical);

        // Storage saw the raw event, the derived signal, and the alert
        assert_eq!(store.event_count("trader_positions").await.unwrap(), 1);
        assert_eq!(store.event_count("trading_signal").await.unwrap(), 1);
        assert_eq!(store.event_count("whale_alert").await.unwrap(), 1);
        assert!(core.trader_state(trader).await.unwrap().is_some());

        core.stop().await;
        // Stop is idempotent
        core.stop().await;
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let store = Arc::new(MemoryEventStore::new());
        let core = Core::with_store(test_config(), store as Arc<dyn EventStore>).unwrap();
        core.start(Vec::new()).await.unwrap();

        let stats = core.stats().await;
        assert_eq!(stats.pool.tracked_traders, 0);
        assert_eq!(stats.signal.signals_generated, 0);
        // projector + signal (4 topics) + whale (2 topics) + candles
        assert_eq!(stats.bus.subscribers, 8);

        core.stop().await;
    }
}
