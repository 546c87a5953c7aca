use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Trader tier derived from account value bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    AlphaWhale,
    Whale,
    Large,
    Medium,
    Standard,
    Small,
}

impl Tier {
    pub fn from_account_value(account_value: f64) -> Self {
        if account_value >= 20_000_000.0 {
            Tier::AlphaWhale
        } else if account_value >= 10_000_000.0 {
            Tier::Whale
        } else if account_value >= 5_000_000.0 {
            Tier::Large
        } else if account_value >= 1_000_000.0 {
            Tier::Medium
        } else if account_value >= 100_000.0 {
            Tier::Standard
        } else {
            Tier::Small
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::AlphaWhale => "alpha_whale",
            Tier::Whale => "whale",
            Tier::Large => "large",
            Tier::Medium => "medium",
            Tier::Standard => "standard",
            Tier::Small => "small",
        }
    }
}

/// Validate and lowercase a trader address (20-byte hex, optional 0x prefix).
pub fn normalize_address(raw: &str) -> Option<String> {
    let stripped = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))?;
    if stripped.len() != 40 {
        return None;
    }
    if hex::decode(stripped).is_err() {
        return None;
    }
    Some(format!("0x{}", stripped.to_ascii_lowercase()))
}

/// A single perp position held by one trader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub coin: String,
    /// Signed size: positive = long, negative = short, zero = closed
    pub size: f64,
    pub leverage: f64,
    pub entry_price: f64,
    pub margin: f64,
}

/// Margin summary reported alongside positions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarginSummary {
    pub account_value: f64,
    pub total_ntl_pos: f64,
    pub total_margin_used: f64,
}

/// One observed position snapshot for a trader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub address: String,
    pub positions: Vec<Position>,
    pub margin_summary: MarginSummary,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub observed_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Updated,
    Closed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Updated => "updated",
            OrderStatus::Closed => "closed",
        }
    }
}

/// Tracked state of one resting order, keyed by oid per address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub oid: u64,
    pub coin: String,
    pub side: String,
    pub limit_price: f64,
    pub size: f64,
    pub orig_size: f64,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

/// Externally-supplied trader score plus derived tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderScore {
    pub address: String,
    pub score: f64,
    pub tier: Tier,
    #[serde(default)]
    pub tags: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// One entry of a scored-traders batch from the leaderboard collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredTrader {
    pub address: String,
    pub score: f64,
    #[serde(default)]
    pub account_value: f64,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// OHLC candle aggregated from mark-price samples
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval_minutes: i64,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Number of price samples folded into this candle
    pub samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Buy,
    Sell,
    Neutral,
}

impl Recommendation {
    /// BUY above +0.2 net bias, SELL below -0.2, NEUTRAL between
    pub fn from_net_bias(net_bias: f64) -> Self {
        if net_bias > 0.2 {
            Recommendation::Buy
        } else if net_bias < -0.2 {
            Recommendation::Sell
        } else {
            Recommendation::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Buy => "BUY",
            Recommendation::Sell => "SELL",
            Recommendation::Neutral => "NEUTRAL",
        }
    }
}

/// Aggregated directional signal for the target instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub long_bias: f64,
    pub short_bias: f64,
    pub net_exposure: f64,
    pub traders_long: u32,
    pub traders_short: u32,
    pub traders_flat: u32,
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl AlertPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertPriority::Critical => "CRITICAL",
            AlertPriority::High => "HIGH",
            AlertPriority::Medium => "MEDIUM",
            AlertPriority::Low => "LOW",
        }
    }

    /// How long an alert of this priority stays active
    pub fn ttl(&self) -> Duration {
        match self {
            AlertPriority::Critical => Duration::hours(1),
            AlertPriority::High => Duration::minutes(30),
            AlertPriority::Medium => Duration::minutes(15),
            AlertPriority::Low => Duration::minutes(10),
        }
    }

    pub fn signal_impact(&self) -> SignalImpact {
        match self {
            AlertPriority::Critical => SignalImpact {
                confidence_boost: 0.30,
                priority: 1.5,
            },
            AlertPriority::High => SignalImpact {
                confidence_boost: 0.20,
                priority: 1.3,
            },
            AlertPriority::Medium => SignalImpact {
                confidence_boost: 0.15,
                priority: 1.1,
            },
            AlertPriority::Low => SignalImpact {
                confidence_boost: 0.05,
                priority: 1.0,
            },
        }
    }
}

/// Suggested effect of an alert on signal consumers.
/// Consumers may add `confidence_boost` to a signal's confidence (clamped
/// to 1.0); the detector itself never mutates signals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalImpact {
    pub confidence_boost: f64,
    pub priority: f64,
}

/// A material per-coin position change by a tracked whale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionChange {
    pub address: String,
    pub tier: Tier,
    pub coin: String,
    pub previous_size: f64,
    pub current_size: f64,
    pub change_pct: f64,
    pub account_value: f64,
    pub detected_at: DateTime<Utc>,
}

/// Priority-tiered whale rotation alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleAlert {
    pub priority: AlertPriority,
    pub title: String,
    pub description: String,
    pub changes: Vec<PositionChange>,
    pub signal_impact: SignalImpact,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WhaleAlert {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
