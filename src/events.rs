//! Event envelope shared by every component on the bus.
//!
//! Exchange frames are parsed at the router boundary into these typed
//! payloads; everything downstream of the router stays typed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    Candle, MarginSummary, OrderState, Position, ScoredTrader, Signal, WhaleAlert,
};

/// Topic names used on the event bus and as event-log keys
pub mod topics {
    pub const TRADER_POSITIONS: &str = "trader_positions";
    pub const TRADER_ORDERS: &str = "trader_orders";
    pub const SCORED_TRADERS: &str = "scored_traders";
    pub const MARK_PRICE: &str = "mark_price";
    pub const TRADING_SIGNAL: &str = "trading_signal";
    pub const WHALE_ALERT: &str = "whale_alert";
    pub const MARKET_REGIME: &str = "market_regime";
    pub const CANDLES: &str = "candles";
}

/// Filtered position state for one trader, emitted by the frame router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderPositionsPayload {
    pub address: String,
    pub symbol: String,
    pub positions: Vec<Position>,
    pub margin_summary: MarginSummary,
    pub timestamp: DateTime<Utc>,
}

/// Order lifecycle transitions for one trader, emitted by the frame router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderOrdersPayload {
    pub address: String,
    pub orders: Vec<OrderState>,
}

/// Batch of externally scored traders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredTradersPayload {
    pub traders: Vec<ScoredTrader>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPricePayload {
    pub symbol: String,
    pub mark_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Regime label supplied by an external detector; consumed, never computed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegimePayload {
    pub label: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    TraderPositions(TraderPositionsPayload),
    TraderOrders(TraderOrdersPayload),
    ScoredTraders(ScoredTradersPayload),
    MarkPrice(MarkPricePayload),
    TradingSignal(Signal),
    WhaleAlert(WhaleAlert),
    MarketRegime(MarketRegimePayload),
    Candles(Candle),
}

impl EventPayload {
    pub fn topic(&self) -> &'static str {
        match self {
            EventPayload::TraderPositions(_) => topics::TRADER_POSITIONS,
            EventPayload::TraderOrders(_) => topics::TRADER_ORDERS,
            EventPayload::ScoredTraders(_) => topics::SCORED_TRADERS,
            EventPayload::MarkPrice(_) => topics::MARK_PRICE,
            EventPayload::TradingSignal(_) => topics::TRADING_SIGNAL,
            EventPayload::WhaleAlert(_) => topics::WHALE_ALERT,
            EventPayload::MarketRegime(_) => topics::MARKET_REGIME,
            EventPayload::Candles(_) => topics::CANDLES,
        }
    }
}

/// Envelope carried end to end: bus delivery, event log, projections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardEvent {
    pub event_id: Uuid,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StandardEvent {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn topic(&self) -> &'static str {
        self.payload.topic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_mapping() {
        let event = StandardEvent::new(
            "test",
            EventPayload::MarkPrice(MarkPricePayload {
                symbol: "BTC".to_string(),
                mark_price: 97_000.5,
                timestamp: Utc::now(),
            }),
        );
        assert_eq!(event.topic(), "mark_price");
    }

    #[test]
    fn test_envelope_serialization() {
        let event = StandardEvent::new(
            "frame_router",
            EventPayload::TraderPositions(TraderPositionsPayload {
                address: "0x6031b6eed1c97e853c6e0f03ad3ce3529351f96d".to_string(),
                symbol: "BTC".to_string(),
                positions: vec![],
                margin_summary: Default::default(),
                timestamp: Utc::now(),
            }),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"trader_positions\""));
        assert!(json.contains("\"source\":\"frame_router\""));

        let back: StandardEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.topic(), "trader_positions");
    }

    #[test]
    fn test_scored_traders_payload_defaults() {
        let json = r#"{"traders":[{"address":"0x6031b6eed1c97e853c6e0f03ad3ce3529351f96d","score":87.5}]}"#;
        let payload: ScoredTradersPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.traders.len(), 1);
        assert_eq!(payload.traders[0].account_value, 0.0);
        assert!(payload.traders[0].display_name.is_none());
    }
}
