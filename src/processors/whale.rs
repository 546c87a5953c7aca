//! Whale position-change detector.
//!
//! Tracks per-address per-coin sizes for whale-tier traders, records
//! material changes into a bounded ring, and classifies the sliding window
//! into priority-tiered alerts. The detector suggests a signal impact but
//! never mutates signals itself.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::WhaleConfig;
use crate::events::{EventPayload, StandardEvent};
use crate::models::{
    normalize_address, AlertPriority, PositionChange, Tier, WhaleAlert,
};

const SOURCE: &str = "whale_detector";
/// Relative size delta that makes a change material
const MATERIAL_CHANGE_PCT: f64 = 0.1;
/// Net-direction flip magnitude for a MEDIUM alert
const BIAS_FLIP_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone)]
struct TraderInfo {
    account_value: f64,
    tier: Tier,
}

struct DetectorState {
    trader_info: HashMap<String, TraderInfo>,
    /// address -> coin -> (size, observed_at)
    position_history: HashMap<String, HashMap<String, (f64, DateTime<Utc>)>>,
    recent_changes: VecDeque<PositionChange>,
    alerts: VecDeque<WhaleAlert>,
    /// Net direction computed on the previous alert attempt's window
    last_window_net: f64,
}

#[derive(Debug, Clone, Default)]
pub struct WhaleStats {
    pub tracked_traders: usize,
    pub whale_count: usize,
    pub alpha_whale_count: usize,
    pub recent_changes: usize,
    pub total_alerts: usize,
    pub active_alerts: usize,
}

pub struct WhaleDetector {
    config: WhaleConfig,
    state: Mutex<DetectorState>,
}

impl WhaleDetector {
    pub fn new(config: WhaleConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState {
                trader_info: HashMap::new(),
                position_history: HashMap::new(),
                recent_changes: VecDeque::new(),
                alerts: VecDeque::new(),
                last_window_net: 0.0,
            }),
        }
    }

    /// Bus entry point. Returns a whale_alert event when the window
    /// classifies into an alert.
    pub fn handle_event(&self, event: &StandardEvent) -> Option<StandardEvent> {
        self.handle_at(event, Utc::now())
            .map(|alert| StandardEvent::new(SOURCE, EventPayload::WhaleAlert(alert)))
    }

    fn handle_at(&self, event: &StandardEvent, now: DateTime<Utc>) -> Option<WhaleAlert> {
        let mut state = self.state.lock();

        match &event.payload {
            EventPayload::ScoredTraders(payload) => {
                for trader in &payload.traders {
                    if let Some(address) = normalize_address(&trader.address) {
                        if trader.account_value > 0.0 {
                            state.trader_info.insert(
                                address,
                                TraderInfo {
                                    account_value: trader.account_value,
                                    tier: Tier::from_account_value(trader.account_value),
                                },
                            );
                        }
                    }
                }
                None
            }
            EventPayload::TraderPositions(payload) => {
                let address = normalize_address(&payload.address)?;

                let account_value = payload.margin_summary.account_value;
                if account_value > 0.0 {
                    state.trader_info.insert(
                        address.clone(),
                        TraderInfo {
                            account_value,
                            tier: Tier::from_account_value(account_value),
                        },
                    );
                }

                self.cleanup(&mut state, now);

                let mut detected = false;
                for position in &payload.positions {
                    if self.detect_change(&mut state, &address, &position.coin, position.size, now)
                    {
                        detected = true;
                    }
                }

                if detected {
                    self.generate_alert(&mut state, now)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Record the new size and report whether the change was material:
    /// a transition from flat, or a relative delta of at least 10%.
    fn detect_change(
        &self,
        state: &mut DetectorState,
        address: &str,
        coin: &str,
        current_size: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(info) = state.trader_info.get(address).cloned() else {
            return false;
        };
        // Only whales and above are worth the ring space
        if info.account_value < self.config.whale_threshold {
            return false;
        }

        let previous_size = state
            .position_history
            .get(address)
            .and_then(|coins| coins.get(coin))
            .map(|(size, _)| *size)
            .unwrap_or(0.0);

        let change_pct = if previous_size == 0.0 {
            if current_size != 0.0 {
                1.0
            } else {
                0.0
            }
        } else {
            (current_size - previous_size).abs() / previous_size.abs()
        };

        state
            .position_history
            .entry(address.to_string())
            .or_default()
            .insert(coin.to_string(), (current_size, now));

        let new_position = previous_size == 0.0 && current_size != 0.0;
        if change_pct < MATERIAL_CHANGE_PCT && !new_position {
            return false;
        }

        let change = PositionChange {
            address: address.to_string(),
            tier: info.tier,
            coin: coin.to_string(),
            previous_size,
            current_size,
            change_pct,
            account_value: info.account_value,
            detected_at: now,
        };
        debug!(
            address = %change.address,
            coin = %change.coin,
            previous = previous_size,
            current = current_size,
            change_pct,
            "material whale change"
        );

        if state.recent_changes.len() >= self.config.max_recent_changes {
            state.recent_changes.pop_front();
        }
        state.recent_changes.push_back(change);

        self.cleanup(state, now);
        true
    }

    /// Drop window-expired changes and TTL-expired position history.
    fn cleanup(&self, state: &mut DetectorState, now: DateTime<Utc>) {
        let window_cutoff = now - Duration::minutes(self.config.aggregation_window_minutes);
        while let Some(front) = state.recent_changes.front() {
            if front.detected_at > window_cutoff {
                break;
            }
            state.recent_changes.pop_front();
        }

        let ttl_cutoff = now - Duration::seconds(self.config.position_history_ttl_secs as i64);
        state.position_history.retain(|_, coins| {
            coins.retain(|_, (_, observed_at)| *observed_at >= ttl_cutoff);
            !coins.is_empty()
        });
    }

    /// Classify the current window, first match wins:
    /// CRITICAL alpha-whale change, HIGH multi-whale, MEDIUM net flip,
    /// LOW single whale change.
    fn generate_alert(&self, state: &mut DetectorState, now: DateTime<Utc>) -> Option<WhaleAlert> {
        self.cleanup(state, now);

        let changes: Vec<PositionChange> = state.recent_changes.iter().cloned().collect();
        let window_net = self.aggregate_net_direction(&changes);
        let previous_net = state.last_window_net;
        state.last_window_net = window_net;

        if changes.is_empty() {
            return None;
        }

        let alpha_changes: Vec<PositionChange> = changes
            .iter()
            .filter(|c| c.account_value >= self.config.alpha_whale_threshold)
            .cloned()
            .collect();

        let alert = if !alpha_changes.is_empty() {
            Some(self.critical_alert(alpha_changes, now))
        } else {
            let distinct_whales: HashSet<&str> =
                changes.iter().map(|c| c.address.as_str()).collect();
            if distinct_whales.len() >= 2 {
                Some(self.high_alert(changes, now))
            } else if previous_net * window_net < 0.0
                && (window_net - previous_net).abs() >= BIAS_FLIP_THRESHOLD
            {
                Some(self.medium_alert(changes, window_net, now))
            } else {
                Some(self.low_alert(changes, now))
            }
        };

        if let Some(alert) = &alert {
            info!(
                priority = alert.priority.as_str(),
                title = %alert.title,
                changes = alert.changes.len(),
                "whale alert"
            );
            if state.alerts.len() >= self.config.max_alerts {
                state.alerts.pop_front();
            }
            state.alerts.push_back(alert.clone());
        }

        alert
    }

    /// Size-weighted net direction of the window: (L - S) / (L + S)
    fn aggregate_net_direction(&self, changes: &[PositionChange]) -> f64 {
        let mut long_delta = 0.0;
        let mut short_delta = 0.0;
        for change in changes {
            let delta = change.current_size - change.previous_size;
            let weight = (change.account_value / self.config.whale_threshold).min(3.0);
            if delta > 0.0 {
                long_delta += weight;
            } else {
                short_delta += weight;
            }
        }
        let total = long_delta + short_delta;
        if total == 0.0 {
            return 0.0;
        }
        (long_delta - short_delta) / total
    }

    fn direction_label(change: &PositionChange) -> String {
        let direction = if change.current_size > change.previous_size {
            "LONG"
        } else {
            "SHORT"
        };
        if change.previous_size * change.current_size < 0.0 {
            format!("FLIP to {direction}")
        } else {
            direction.to_string()
        }
    }

    fn build_alert(
        priority: AlertPriority,
        title: String,
        description: String,
        changes: Vec<PositionChange>,
        now: DateTime<Utc>,
    ) -> WhaleAlert {
        WhaleAlert {
            signal_impact: priority.signal_impact(),
            expires_at: now + priority.ttl(),
            priority,
            title,
            description,
            changes,
            detected_at: now,
        }
    }

    fn critical_alert(&self, changes: Vec<PositionChange>, now: DateTime<Utc>) -> WhaleAlert {
        let lead = &changes[0];
        Self::build_alert(
            AlertPriority::Critical,
            format!("Alpha Whale {}", Self::direction_label(lead)),
            format!(
                "Alpha whale (${:.1}M) changed {} position",
                lead.account_value / 1e6,
                lead.coin
            ),
            changes,
            now,
        )
    }

    fn high_alert(&self, changes: Vec<PositionChange>, now: DateTime<Utc>) -> WhaleAlert {
        let long_count = changes
            .iter()
            .filter(|c| c.current_size > c.previous_size)
            .count();
        let bias = if long_count * 2 > changes.len() {
            "BULLISH"
        } else {
            "BEARISH"
        };
        Self::build_alert(
            AlertPriority::High,
            format!("Multiple Whales {bias}"),
            format!(
                "{} whale changes in last {} min",
                changes.len(),
                self.config.aggregation_window_minutes
            ),
            changes,
            now,
        )
    }

    fn medium_alert(
        &self,
        changes: Vec<PositionChange>,
        window_net: f64,
        now: DateTime<Utc>,
    ) -> WhaleAlert {
        let direction = if window_net > 0.0 { "BULLISH" } else { "BEARISH" };
        Self::build_alert(
            AlertPriority::Medium,
            format!("Whale Bias Flip {direction}"),
            format!(
                "Aggregate whale bias shifted {:.0}% {}",
                window_net.abs() * 100.0,
                direction.to_lowercase()
            ),
            changes,
            now,
        )
    }

    fn low_alert(&self, changes: Vec<PositionChange>, now: DateTime<Utc>) -> WhaleAlert {
        let lead = &changes[0];
        let direction = if lead.current_size.abs() > lead.previous_size.abs() {
            "increased"
        } else {
            "decreased"
        };
        Self::build_alert(
            AlertPriority::Low,
            format!("Whale {} {}", lead.coin, direction),
            format!(
                "Whale (${:.1}M) {} {} position",
                lead.account_value / 1e6,
                direction,
                lead.coin
            ),
            changes,
            now,
        )
    }

    pub fn active_alerts(&self) -> Vec<WhaleAlert> {
        self.active_alerts_at(Utc::now())
    }

    fn active_alerts_at(&self, now: DateTime<Utc>) -> Vec<WhaleAlert> {
        self.state
            .lock()
            .alerts
            .iter()
            .filter(|alert| alert.is_active(now))
            .cloned()
            .collect()
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<WhaleAlert> {
        let state = self.state.lock();
        state
            .alerts
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn purge_address(&self, address: &str) {
        let mut state = self.state.lock();
        state.trader_info.remove(address);
        state.position_history.remove(address);
    }

    pub fn stats(&self) -> WhaleStats {
        let now = Utc::now();
        let state = self.state.lock();
        WhaleStats {
            tracked_traders: state.trader_info.len(),
            whale_count: state
                .trader_info
                .values()
                .filter(|info| info.account_value >= self.config.whale_threshold)
                .count(),
            alpha_whale_count: state
                .trader_info
                .values()
                .filter(|info| info.account_value >= self.config.alpha_whale_threshold)
                .count(),
            recent_changes: state.recent_changes.len(),
            total_alerts: state.alerts.len(),
            active_alerts: state
                .alerts
                .iter()
                .filter(|alert| alert.is_active(now))
                .count(),
        }
    }
}
