//! Exchange WebSocket wire types.
//!
//! Outbound control frames and the inbound `{channel, data}` envelope.
//! The exchange sends most numerics as JSON strings, so every numeric field
//! goes through a string-or-number deserializer. Frames parse-or-drop here;
//! everything past this module is typed.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{MarginSummary, Position};

/// Subscribe / unsubscribe control frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub method: String,
    pub subscription: SubscriptionSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub user: String,
}

impl ControlRequest {
    pub fn subscribe_user(address: &str) -> Self {
        Self {
            method: "subscribe".to_string(),
            subscription: SubscriptionSpec {
                kind: "webData2".to_string(),
                user: address.to_string(),
            },
        }
    }

    pub fn unsubscribe_user(address: &str) -> Self {
        Self {
            method: "unsubscribe".to_string(),
            subscription: SubscriptionSpec {
                kind: "webData2".to_string(),
                user: address.to_string(),
            },
        }
    }
}

/// Application-level heartbeat frame
pub fn ping_frame() -> &'static str {
    r#"{"method":"ping"}"#
}

/// Inbound frame envelope: `{"channel": <str>, "data": <object|array>}`
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub channel: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Typed view of an inbound frame
#[derive(Debug)]
pub enum InboundMessage {
    WebData2(Box<WebData2>),
    SubscriptionAck,
    Pong,
    Unknown(String),
}

impl Envelope {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn into_message(self) -> anyhow::Result<InboundMessage> {
        match self.channel.as_str() {
            "webData2" => {
                let payload: WebData2 = serde_json::from_value(self.data)?;
                Ok(InboundMessage::WebData2(Box::new(payload)))
            }
            "subscriptionResponse" => Ok(InboundMessage::SubscriptionAck),
            "pong" => Ok(InboundMessage::Pong),
            other => Ok(InboundMessage::Unknown(other.to_string())),
        }
    }
}

/// webData2 payload: full per-trader state push
#[derive(Debug, Clone, Deserialize)]
pub struct WebData2 {
    pub user: String,
    #[serde(rename = "clearinghouseState", default)]
    pub clearinghouse_state: ClearinghouseState,
    #[serde(rename = "openOrders", default)]
    pub open_orders: Vec<OpenOrderWire>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClearinghouseState {
    #[serde(rename = "assetPositions", default)]
    pub asset_positions: Vec<AssetPosition>,
    #[serde(rename = "marginSummary", default)]
    pub margin_summary: MarginSummaryWire,
}

/// Positions arrive wrapped: `{"type": "oneWay", "position": {...}}`
#[derive(Debug, Clone, Deserialize)]
pub struct AssetPosition {
    pub position: PositionWire,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionWire {
    pub coin: String,
    #[serde(default, deserialize_with = "f64_from_any")]
    pub szi: f64,
    #[serde(default)]
    pub leverage: LeverageWire,
    #[serde(rename = "entryPx", default, deserialize_with = "f64_from_any")]
    pub entry_px: f64,
    #[serde(rename = "marginUsed", default, deserialize_with = "f64_from_any")]
    pub margin_used: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeverageWire {
    #[serde(default, deserialize_with = "f64_from_any")]
    pub value: f64,
}

impl From<PositionWire> for Position {
    fn from(wire: PositionWire) -> Self {
        Position {
            coin: wire.coin,
            size: wire.szi,
            leverage: wire.leverage.value,
            entry_price: wire.entry_px,
            margin: wire.margin_used,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarginSummaryWire {
    #[serde(rename = "accountValue", default, deserialize_with = "f64_from_any")]
    pub account_value: f64,
    #[serde(rename = "totalNtlPos", default, deserialize_with = "f64_from_any")]
    pub total_ntl_pos: f64,
    #[serde(rename = "totalMarginUsed", default, deserialize_with = "f64_from_any")]
    pub total_margin_used: f64,
}

impl From<MarginSummaryWire> for MarginSummary {
    fn from(wire: MarginSummaryWire) -> Self {
        MarginSummary {
            account_value: wire.account_value,
            total_ntl_pos: wire.total_ntl_pos,
            total_margin_used: wire.total_margin_used,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrderWire {
    pub oid: u64,
    pub coin: String,
    #[serde(default)]
    pub side: String,
    #[serde(rename = "limitPx", default, deserialize_with = "f64_from_any")]
    pub limit_px: f64,
    #[serde(default, deserialize_with = "f64_from_any")]
    pub sz: f64,
    #[serde(rename = "origSz", default, deserialize_with = "f64_from_any")]
    pub orig_sz: f64,
    /// Milliseconds since epoch
    #[serde(default)]
    pub timestamp: i64,
}

/// Accept a float encoded as a JSON number, a string, or null.
pub fn f64_from_any<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    struct AnyF64;

    impl<'de> Visitor<'de> for AnyF64 {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a number, a numeric string, or null")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            v.parse().map_err(|_| E::custom(format!("bad float: {v:?}")))
        }

        fn visit_unit<E: de::Error>(self) -> Result<f64, E> {
            Ok(0.0)
        }

        fn visit_none<E: de::Error>(self) -> Result<f64, E> {
            Ok(0.0)
        }
    }

    deserializer.deserialize_any(AnyF64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame_serialization() {
        let frame = ControlRequest::subscribe_user("0x6031b6eed1c97e853c6e0f03ad3ce3529351f96d");
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""method":"subscribe""#));
        assert!(json.contains(r#""type":"webData2""#));
        assert!(json.contains(r#""user":"0x6031b6eed1c97e853c6e0f03ad3ce3529351f96d""#));

        let unsub = ControlRequest::unsubscribe_user("0xabc0000000000000000000000000000000000def");
        assert!(serde_json::to_string(&unsub)
            .unwrap()
            .contains(r#""method":"unsubscribe""#));
    }

    #[test]
    fn test_webdata2_deserialization() {
        let text = r#"{
            "channel": "webData2",
            "data": {
                "user": "0x6031b6eed1c97e853c6e0f03ad3ce3529351f96d",
                "clearinghouseState": {
                    "assetPositions": [
                        {
                            "type": "oneWay",
                            "position": {
                                "coin": "BTC",
                                "szi": "10.5",
                                "leverage": {"type": "cross", "value": 20},
                                "entryPx": "96750.0",
                                "marginUsed": "50793.75"
                            }
                        }
                    ],
                    "marginSummary": {
                        "accountValue": "25000000.0",
                        "totalNtlPos": "1015875.0",
                        "totalMarginUsed": "50793.75"
                    }
                },
                "openOrders": [
                    {"oid": 77001, "coin": "BTC", "side": "B", "limitPx": "96000.0", "sz": "1.25", "origSz": "2.0", "timestamp": 1738000000000}
                ]
            }
        }"#;

        let envelope = Envelope::parse(text).unwrap();
        let msg = envelope.into_message().unwrap();
        let data = match msg {
            InboundMessage::WebData2(d) => d,
            other => panic!("expected webData2, got {other:?}"),
        };

        assert_eq!(data.user, "0x6031b6eed1c97e853c6e0f03ad3ce3529351f96d");
        assert_eq!(data.clearinghouse_state.asset_positions.len(), 1);

        let pos: Position = data.clearinghouse_state.asset_positions[0]
            .position
            .clone()
            .into();
        assert_eq!(pos.coin, "BTC");
        assert!((pos.size - 10.5).abs() < 1e-9);
        assert!((pos.leverage - 20.0).abs() < 1e-9);

        let margin: MarginSummary = data.clearinghouse_state.margin_summary.clone().into();
        assert!((margin.account_value - 25_000_000.0).abs() < 1e-6);

        assert_eq!(data.open_orders.len(), 1);
        assert_eq!(data.open_orders[0].oid, 77001);
        assert!((data.open_orders[0].limit_px - 96_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_subscription_ack_and_unknown_channels() {
        let ack = Envelope::parse(r#"{"channel":"subscriptionResponse","data":{}}"#)
            .unwrap()
            .into_message()
            .unwrap();
        assert!(matches!(ack, InboundMessage::SubscriptionAck));

        let unknown = Envelope::parse(r#"{"channel":"l2Book","data":[]}"#)
            .unwrap()
            .into_message()
            .unwrap();
        match unknown {
            InboundMessage::Unknown(channel) => assert_eq!(channel, "l2Book"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_frame_is_error() {
        assert!(Envelope::parse("not json").is_err());

        // Valid envelope, invalid payload shape
        let envelope = Envelope::parse(r#"{"channel":"webData2","data":{"nope":1}}"#).unwrap();
        assert!(envelope.into_message().is_err());
    }
}
