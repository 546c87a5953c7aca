//! End-to-end event flow: router -> bus -> processors -> derived events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::bus::EventBus;
use crate::config::{RouterConfig, SignalConfig, WhaleConfig};
use crate::events::{EventPayload, ScoredTradersPayload, StandardEvent};
use crate::models::{AlertPriority, Recommendation, ScoredTrader, Signal};
use crate::pool::wire::Envelope;
use crate::processors::{SignalGenerator, WhaleDetector};
use crate::router::FrameRouter;

fn addr(n: u8) -> String {
    format!("0x{:040x}", n as u128)
}

fn webdata2_frame(user: &str, szi: f64, account_value: f64) -> Envelope {
    let text = format!(
        r#"{{
            "channel": "webData2",
            "data": {{
                "user": "{user}",
                "clearinghouseState": {{
                    "assetPositions": [
                        {{"type": "oneWay", "position": {{"coin": "BTC", "szi": "{szi}", "leverage": {{"value": 10}}, "entryPx": "96000", "marginUsed": "1000"}}}}
                    ],
                    "marginSummary": {{"accountValue": "{account_value}", "totalNtlPos": "0", "totalMarginUsed": "0"}}
                }},
                "openOrders": []
            }}
        }}"#
    );
    Envelope::parse(&text).unwrap()
}

struct Harness {
    bus: Arc<EventBus>,
    router: Arc<FrameRouter>,
    signal: Arc<SignalGenerator>,
    whale: Arc<WhaleDetector>,
    signals: Arc<Mutex<Vec<Signal>>>,
    alerts_seen: Arc<AtomicUsize>,
}

/// Wire the processors onto the bus the way the core does.
async fn harness() -> Harness {
    let bus = Arc::new(EventBus::new());
    let router = Arc::new(FrameRouter::new(
        RouterConfig::default(),
        "BTC".to_string(),
        true,
        Arc::clone(&bus),
    ));
    let signal = Arc::new(SignalGenerator::new(
        SignalConfig::default(),
        "BTC".to_string(),
    ));
    let whale = Arc::new(WhaleDetector::new(WhaleConfig::default()));

    for topic in ["trader_positions", "scored_traders", "mark_price"] {
        let signal = Arc::clone(&signal);
        let bus_inner = Arc::clone(&bus);
        bus.subscribe(topic, "signal_generator", move |event| {
            let signal = Arc::clone(&signal);
            let bus_inner = Arc::clone(&bus_inner);
            async move {
                if let Some(out) = signal.handle_event(&event) {
                    bus_inner.publish(out).await;
                }
                Ok(())
            }
        })
        .await;
    }
    for topic in ["trader_positions", "scored_traders"] {
        let whale = Arc::clone(&whale);
        let bus_inner = Arc::clone(&bus);
        bus.subscribe(topic, "whale_detector", move |event| {
            let whale = Arc::clone(&whale);
            let bus_inner = Arc::clone(&bus_inner);
            async move {
                if let Some(out) = whale.handle_event(&event) {
                    bus_inner.publish(out).await;
                }
                Ok(())
            }
        })
        .await;
    }

    let signals = Arc::new(Mutex::new(Vec::new()));
    {
        let signals = Arc::clone(&signals);
        bus.subscribe("trading_signal", "signal_sink", move |event| {
            let signals = Arc::clone(&signals);
            async move {
                if let EventPayload::TradingSignal(signal) = event.payload {
                    signals.lock().push(signal);
                }
                Ok(())
            }
        })
        .await;
    }

    let alerts_seen = Arc::new(AtomicUsize::new(0));
    {
        let alerts_seen = Arc::clone(&alerts_seen);
        bus.subscribe("whale_alert", "alert_sink", move |_| {
            let alerts_seen = Arc::clone(&alerts_seen);
            async move {
                alerts_seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
    }

    Harness {
        bus,
        router,
        signal,
        whale,
        signals,
        alerts_seen,
    }
}

async fn publish_scores(bus: &EventBus, entries: &[(String, f64, f64)]) {
    bus.publish(StandardEvent::new(
        "leaderboard",
        EventPayload::ScoredTraders(ScoredTradersPayload {
            traders: entries
                .iter()
                .map(|(address, score, account_value)| ScoredTrader {
                    address: address.clone(),
                    score: *score,
                    account_value: *account_value,
                    display_name: None,
                })
                .collect(),
        }),
    ))
    .await;
}

#[tokio::test]
async fn test_frames_to_buy_signal() {
    let h = harness().await;
    publish_scores(&h.bus, &[(addr(1), 100.0, 5_000_000.0)]).await;

    h.router.handle_frame(webdata2_frame(&addr(1), 10.0, 5_000_000.0));
    h.router.flush().await;

    let signals = h.signals.lock();
    assert_eq!(signals.len(), 1);
    let signal = &signals[0];
    assert_eq!(signal.recommendation, Recommendation::Buy);
    assert_eq!(signal.traders_long, 1);
    assert_eq!(signal.traders_short, 0);
    assert!((signal.long_bias - 1.0).abs() < 1e-9);
    assert!((signal.net_exposure - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_balanced_opposition_resolves_neutral() {
    let h = harness().await;
    publish_scores(
        &h.bus,
        &[(addr(1), 70.0, 1_000_000.0), (addr(2), 70.0, 1_000_000.0)],
    )
    .await;

    h.router.handle_frame(webdata2_frame(&addr(1), 10.0, 1_000_000.0));
    h.router.handle_frame(webdata2_frame(&addr(2), -10.0, 1_000_000.0));
    h.router.flush().await;

    let signals = h.signals.lock();
    let last = signals.last().expect("neutral flip must emit");
    assert_eq!(last.recommendation, Recommendation::Neutral);
    assert!((last.long_bias - 0.5).abs() < 1e-9);
    assert!((last.short_bias - 0.5).abs() < 1e-9);
    assert_eq!(last.traders_long, 1);
    assert_eq!(last.traders_short, 1);
    assert!((last.long_bias + last.short_bias - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_duplicate_frames_deduplicated_end_to_end() {
    let h = harness().await;
    publish_scores(&h.bus, &[(addr(1), 80.0, 1_000_000.0)]).await;

    h.router.handle_frame(webdata2_frame(&addr(1), 10.0, 1_000_000.0));
    h.router.flush().await;
    h.router.handle_frame(webdata2_frame(&addr(1), 10.0, 1_000_000.0));
    h.router.flush().await;

    // Exactly one snapshot emitted; the duplicate was skipped at the router
    assert_eq!(h.router.stats().positions_saved, 1);
    assert_eq!(h.router.stats().positions_skipped, 1);
    assert_eq!(h.signal.stats().signals_generated, 1);
}

#[tokio::test]
async fn test_alpha_whale_frame_raises_critical_alert() {
    let h = harness().await;

    h.router.handle_frame(webdata2_frame(&addr(9), 100.0, 25_000_000.0));
    h.router.flush().await;

    assert_eq!(h.alerts_seen.load(Ordering::SeqCst), 1);
    let alerts = h.whale.active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].priority, AlertPriority::Critical);
    assert!((alerts[0].signal_impact.confidence_boost - 0.30).abs() < 1e-9);
    // Alert consumers may boost confidence, clamped to 1.0
    let boosted = (h.signals.lock()[0].confidence + alerts[0].signal_impact.confidence_boost)
        .min(1.0);
    assert!(boosted <= 1.0);
}

#[tokio::test]
async fn test_two_whales_escalate_to_high() {
    let h = harness().await;

    h.router.handle_frame(webdata2_frame(&addr(1), 10.0, 12_000_000.0));
    h.router.flush().await;
    h.router.handle_frame(webdata2_frame(&addr(2), -20.0, 15_000_000.0));
    h.router.flush().await;

    let alerts = h.whale.recent_alerts(10);
    assert_eq!(alerts.len(), 2);
    // Most recent first
    assert_eq!(alerts[0].priority, AlertPriority::High);
    assert_eq!(alerts[1].priority, AlertPriority::Low);
}

#[tokio::test]
async fn test_mark_price_flows_into_signal() {
    let h = harness().await;
    publish_scores(&h.bus, &[(addr(1), 100.0, 1_000_000.0)]).await;

    h.bus
        .publish(StandardEvent::new(
            "mark_price_collector",
            EventPayload::MarkPrice(crate::events::MarkPricePayload {
                symbol: "BTC".to_string(),
                mark_price: 97_500.0,
                timestamp: Utc::now(),
            }),
        ))
        .await;

    h.router.handle_frame(webdata2_frame(&addr(1), 5.0, 1_000_000.0));
    h.router.flush().await;

    let signals = h.signals.lock();
    assert!((signals[0].price - 97_500.0).abs() < 1e-9);
}
