//! Weighted-aggregation signal generator.
//!
//! Keeps one position payload per fresh trader, weights each trader by its
//! externally-supplied score, and distills the set into a long/short bias
//! with a recommendation and confidence. Emission is event-driven and gated
//! so consumers only see meaningful transitions.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::SignalConfig;
use crate::events::{EventPayload, StandardEvent, TraderPositionsPayload};
use crate::models::{normalize_address, Recommendation, Signal};

const SOURCE: &str = "signal_generator";
const DEFAULT_SCORE: f64 = 50.0;

pub fn calculate_confidence(
    long_bias: f64,
    short_bias: f64,
    total_weight: f64,
    traders_involved: u32,
) -> f64 {
    let agreement = (long_bias - short_bias).abs();
    let participation = (traders_involved as f64 / 100.0).min(1.0);
    let weight_factor = (total_weight / 100.0).min(1.0);
    (agreement * 0.5 + participation * 0.3 + weight_factor * 0.2).min(1.0)
}

struct TraderState {
    payload: TraderPositionsPayload,
    last_access: DateTime<Utc>,
}

struct GeneratorState {
    positions: HashMap<String, TraderState>,
    scores: HashMap<String, f64>,
    current_price: f64,
    regime: Option<String>,
    last_signal: Option<Signal>,
    signals_generated: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SignalStats {
    pub signals_generated: u64,
    pub tracked_traders: usize,
    pub scored_traders: usize,
    pub current_price: f64,
    pub regime: Option<String>,
}

pub struct SignalGenerator {
    config: SignalConfig,
    symbol: String,
    state: Mutex<GeneratorState>,
}

impl SignalGenerator {
    pub fn new(config: SignalConfig, symbol: String) -> Self {
        Self {
            config,
            symbol,
            state: Mutex::new(GeneratorState {
                positions: HashMap::new(),
                scores: HashMap::new(),
                current_price: 0.0,
                regime: None,
                last_signal: None,
                signals_generated: 0,
            }),
        }
    }

    /// Bus entry point. Returns a trading_signal event when the emission
    /// gate passes.
    pub fn handle_event(&self, event: &StandardEvent) -> Option<StandardEvent> {
        self.handle_at(event, Utc::now())
    }

    fn handle_at(&self, event: &StandardEvent, now: DateTime<Utc>) -> Option<StandardEvent> {
        let mut state = self.state.lock();

        match &event.payload {
            EventPayload::TraderPositions(payload) => {
                let address = normalize_address(&payload.address)?;
                state.positions.insert(
                    address,
                    TraderState {
                        payload: payload.clone(),
                        last_access: now,
                    },
                );
                self.evict_stale(&mut state, now);
            }
            EventPayload::ScoredTraders(payload) => {
                for trader in &payload.traders {
                    if let Some(address) = normalize_address(&trader.address) {
                        state.scores.insert(address, trader.score);
                    }
                }
            }
            EventPayload::MarkPrice(payload) => {
                state.current_price = payload.mark_price;
            }
            EventPayload::MarketRegime(payload) => {
                // Stored for observability only; never enters the math.
                state.regime = Some(payload.label.clone());
                return None;
            }
            _ => return None,
        }

        let signal = self.generate(&mut state, now)?;
        state.last_signal = Some(signal.clone());
        state.signals_generated += 1;
        Some(StandardEvent::new(
            SOURCE,
            EventPayload::TradingSignal(signal),
        ))
    }

    /// TTL pass then LRU pass, run on every position update.
    fn evict_stale(&self, state: &mut GeneratorState, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(self.config.trader_ttl_secs as i64);
        let stale: Vec<String> = state
            .positions
            .iter()
            .filter(|(_, ts)| ts.last_access < cutoff)
            .map(|(addr, _)| addr.clone())
            .collect();
        for address in &stale {
            state.positions.remove(address);
            state.scores.remove(address);
        }
        if !stale.is_empty() {
            debug!(
                removed = stale.len(),
                remaining = state.positions.len(),
                "stale traders evicted"
            );
        }

        if state.positions.len() > self.config.max_traders {
            let mut by_age: Vec<(String, DateTime<Utc>)> = state
                .positions
                .iter()
                .map(|(addr, ts)| (addr.clone(), ts.last_access))
                .collect();
            by_age.sort_by_key(|(_, last_access)| *last_access);
            let excess = state.positions.len() - self.config.max_traders;
            for (address, _) in by_age.into_iter().take(excess) {
                state.positions.remove(&address);
                state.scores.remove(&address);
            }
        }
    }

    fn generate(&self, state: &mut GeneratorState, now: DateTime<Utc>) -> Option<Signal> {
        if state.positions.is_empty() {
            return None;
        }

        let mut long_score = 0.0;
        let mut short_score = 0.0;
        let mut total_weight = 0.0;
        let mut net_exposure = 0.0;
        let mut traders_long = 0u32;
        let mut traders_short = 0u32;
        let mut traders_flat = 0u32;

        for (address, trader) in &state.positions {
            let score = state.scores.get(address).copied().unwrap_or(DEFAULT_SCORE);
            let weight = score / 100.0;

            let target = trader
                .payload
                .positions
                .iter()
                .find(|p| p.coin == self.symbol);

            match target {
                Some(position) => {
                    net_exposure += position.size * weight;
                    if position.size > 0.0 {
                        long_score += weight;
                        traders_long += 1;
                    } else if position.size < 0.0 {
                        short_score += weight;
                        traders_short += 1;
                    } else {
                        traders_flat += 1;
                    }
                }
                None => traders_flat += 1,
            }
            total_weight += weight;
        }

        if total_weight <= 0.0 {
            return None;
        }

        let long_bias = long_score / total_weight;
        let short_bias = short_score / total_weight;
        let recommendation = Recommendation::from_net_bias(long_bias - short_bias);
        let confidence = calculate_confidence(
            long_bias,
            short_bias,
            total_weight,
            traders_long + traders_short,
        );

        let signal = Signal {
            symbol: self.symbol.clone(),
            long_bias,
            short_bias,
            net_exposure,
            traders_long,
            traders_short,
            traders_flat,
            recommendation,
            confidence,
            price: state.current_price,
            timestamp: now,
        };

        if self.should_emit(&signal, state.last_signal.as_ref()) {
            Some(signal)
        } else {
            None
        }
    }

    /// Emit on: first signal, recommendation change, >=0.1 long-bias move,
    /// or high confidence.
    fn should_emit(&self, signal: &Signal, last: Option<&Signal>) -> bool {
        let Some(last) = last else {
            return true;
        };
        if signal.recommendation != last.recommendation {
            return true;
        }
        if (signal.long_bias - last.long_bias).abs() >= 0.1 {
            return true;
        }
        signal.confidence >= 0.7
    }

    pub fn last_signal(&self) -> Option<Signal> {
        self.state.lock().last_signal.clone()
    }

    pub fn tracked_trader_count(&self) -> usize {
        self.state.lock().positions.len()
    }

    pub fn stats(&self) -> SignalStats {
        let state = self.state.lock();
        SignalStats {
            signals_generated: state.signals_generated,
            tracked_traders: state.positions.len(),
            scored_traders: state.scores.len(),
            current_price: state.current_price,
            regime: state.regime.clone(),
        }
    }

    /// Purge one trader outright (invariant-violation recovery path).
    pub fn purge_address(&self, address: &str) {
        let mut state = self.state.lock();
        state.positions.remove(address);
        state.scores.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ScoredTradersPayload;
    use crate::models::{MarginSummary, Position, ScoredTrader};

    fn addr(n: u8) -> String {
        format!("0x{:040x}", n as u128)
    }

    fn positions_event(address: &str, coin: &str, size: f64) -> StandardEvent {
        StandardEvent::new(
            "test",
            EventPayload::TraderPositions(TraderPositionsPayload {
                address: address.to_string(),
                symbol: "BTC".to_string(),
                positions: vec![Position {
                    coin: coin.to_string(),
                    size,
                    leverage: 10.0,
                    entry_price: 96_000.0,
                    margin: 1_000.0,
                }],
                margin_summary: MarginSummary::default(),
                timestamp: Utc::now(),
            }),
        )
    }

    fn scores_event(entries: &[(String, f64)]) -> StandardEvent {
        StandardEvent::new(
            "test",
            EventPayload::ScoredTraders(ScoredTradersPayload {
                traders: entries
                    .iter()
                    .map(|(address, score)| ScoredTrader {
                        address: address.clone(),
                        score: *score,
                        account_value: 0.0,
                        display_name: None,
                    })
                    .collect(),
            }),
        )
    }

    fn generator() -> SignalGenerator {
        SignalGenerator::new(SignalConfig::default(), "BTC".to_string())
    }

    #[test]
    fn test_single_trader_buy() {
        let generator = generator();
        let now = Utc::now();

        generator.handle_at(&scores_event(&[(addr(1), 100.0)]), now);
        let emitted = generator
            .handle_at(&positions_event(&addr(1), "BTC", 10.0), now)
            .expect("first qualifying update emits");

        let EventPayload::TradingSignal(signal) = emitted.payload else {
            panic!("expected trading signal");
        };
        assert_eq!(signal.traders_long, 1);
        assert_eq!(signal.traders_short, 0);
        assert_eq!(signal.traders_flat, 0);
        assert!((signal.long_bias - 1.0).abs() < 1e-9);
        assert!((signal.short_bias).abs() < 1e-9);
        assert!((signal.net_exposure - 10.0).abs() < 1e-9);
        assert_eq!(signal.recommendation, Recommendation::Buy);
        // 0.5 * 1.0 + 0.3 * (1/100) + 0.2 * (1/100)
        assert!((signal.confidence - 0.505).abs() < 1e-9);
    }

    #[test]
    fn test_balanced_opposition_is_neutral() {
        let generator = generator();
        let now = Utc::now();

        generator.handle_at(&scores_event(&[(addr(1), 70.0), (addr(2), 70.0)]), now);
        generator.handle_at(&positions_event(&addr(1), "BTC", 10.0), now);
        let emitted = generator
            .handle_at(&positions_event(&addr(2), "BTC", -10.0), now)
            .expect("recommendation change emits");

        let EventPayload::TradingSignal(signal) = emitted.payload else {
            panic!("expected trading signal");
        };
        assert_eq!(signal.traders_long, 1);
        assert_eq!(signal.traders_short, 1);
        assert!((signal.long_bias - 0.5).abs() < 1e-9);
        assert!((signal.short_bias - 0.5).abs() < 1e-9);
        assert_eq!(signal.recommendation, Recommendation::Neutral);
        assert!((signal.long_bias + signal.short_bias - 1.0).abs() < 1e-6);
        assert!(signal.net_exposure.abs() < 1e-9);
    }

    #[test]
    fn test_bias_sum_identity_with_flat_traders() {
        let generator = generator();
        let now = Utc::now();

        generator.handle_at(&positions_event(&addr(1), "BTC", 5.0), now);
        generator.handle_at(&positions_event(&addr(2), "ETH", 3.0), now);
        let emitted = generator.handle_at(&positions_event(&addr(3), "BTC", -2.0), now);

        let EventPayload::TradingSignal(signal) = emitted.unwrap().payload else {
            panic!("expected trading signal");
        };
        assert_eq!(
            signal.traders_long + signal.traders_short + signal.traders_flat,
            3
        );
        let flat_share = 1.0 - signal.long_bias - signal.short_bias;
        assert!(flat_share >= -1e-9);
    }

    #[test]
    fn test_no_traders_no_signal() {
        let generator = generator();
        let now = Utc::now();
        // Score and price updates alone never emit with zero fresh traders
        assert!(generator
            .handle_at(&scores_event(&[(addr(1), 90.0)]), now)
            .is_none());
    }

    #[test]
    fn test_emission_gate_suppresses_noise() {
        let generator = generator();
        let now = Utc::now();

        // Two longs with modest scores: BUY, confidence well under 0.7
        generator.handle_at(&scores_event(&[(addr(1), 60.0), (addr(2), 60.0)]), now);
        assert!(generator
            .handle_at(&positions_event(&addr(1), "BTC", 1.0), now)
            .is_some());

        // Same recommendation, same bias (1.0), low confidence: suppressed
        assert!(generator
            .handle_at(&positions_event(&addr(2), "BTC", 1.0), now)
            .is_none());

        // Position size change alone does not move bias; still suppressed
        assert!(generator
            .handle_at(&positions_event(&addr(2), "BTC", 2.0), now)
            .is_none());
    }

    #[test]
    fn test_ttl_eviction() {
        let generator = SignalGenerator::new(
            SignalConfig {
                trader_ttl_secs: 3600,
                max_traders: 100,
            },
            "BTC".to_string(),
        );
        let t0 = Utc::now();

        generator.handle_at(&positions_event(&addr(1), "BTC", 1.0), t0);
        generator.handle_at(&positions_event(&addr(2), "BTC", 2.0), t0);
        assert_eq!(generator.tracked_trader_count(), 2);

        // A fresh update two hours later evicts both stale entries
        let t1 = t0 + Duration::seconds(7200);
        generator.handle_at(&positions_event(&addr(3), "BTC", 3.0), t1);
        assert_eq!(generator.tracked_trader_count(), 1);
        assert_eq!(generator.stats().scored_traders, 0);
    }

    #[test]
    fn test_lru_eviction_caps_tracked_traders() {
        let generator = SignalGenerator::new(
            SignalConfig {
                trader_ttl_secs: 86_400,
                max_traders: 3,
            },
            "BTC".to_string(),
        );
        let t0 = Utc::now();

        for i in 1..=5u8 {
            let now = t0 + Duration::seconds(i as i64);
            generator.handle_at(&positions_event(&addr(i), "BTC", i as f64), now);
        }

        assert_eq!(generator.tracked_trader_count(), 3);
        // Oldest entries went first
        let state = generator.state.lock();
        assert!(!state.positions.contains_key(&addr(1)));
        assert!(!state.positions.contains_key(&addr(2)));
        assert!(state.positions.contains_key(&addr(5)));
    }

    #[test]
    fn test_mark_price_attached_to_signal() {
        let generator = generator();
        let now = Utc::now();

        generator.handle_at(
            &StandardEvent::new(
                "test",
                EventPayload::MarkPrice(crate::events::MarkPricePayload {
                    symbol: "BTC".to_string(),
                    mark_price: 97_123.0,
                    timestamp: now,
                }),
            ),
            now,
        );
        let emitted = generator
            .handle_at(&positions_event(&addr(1), "BTC", 4.0), now)
            .unwrap();
        let EventPayload::TradingSignal(signal) = emitted.payload else {
            panic!("expected trading signal");
        };
        assert!((signal.price - 97_123.0).abs() < 1e-9);
    }

    #[test]
    fn test_regime_label_tracked_but_not_emitting() {
        let generator = generator();
        let now = Utc::now();
        let event = StandardEvent::new(
            "test",
            EventPayload::MarketRegime(crate::events::MarketRegimePayload {
                label: "mean_reverting".to_string(),
                confidence: Some(0.8),
            }),
        );
        assert!(generator.handle_at(&event, now).is_none());
        assert_eq!(generator.stats().regime.as_deref(), Some("mean_reverting"));
    }
}
