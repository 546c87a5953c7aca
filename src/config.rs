//! Runtime configuration.
//!
//! Every knob has a documented default and can be overridden through the
//! environment (`WW_*` keys, loaded after dotenv). Unknown keys are ignored
//! by construction.

use std::env;
use std::str::FromStr;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Exchange endpoints and target instrument
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub ws_url: String,
    pub info_url: String,
    pub target_symbol: String,
    /// Restrict router output to the target symbol only
    pub target_only: bool,
    pub heartbeat_interval_secs: u64,
    /// Mark-price poll interval; 0 disables the poller
    pub mark_price_interval_secs: u64,
    /// Concurrent info-endpoint requests
    pub info_concurrency: usize,
    /// Candle timeframes in minutes
    pub candle_timeframes: Vec<i64>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.hyperliquid.xyz/ws".to_string(),
            info_url: "https://api.hyperliquid.xyz/info".to_string(),
            target_symbol: "BTC".to_string(),
            target_only: true,
            heartbeat_interval_secs: 30,
            mark_price_interval_secs: 60,
            info_concurrency: 30,
            candle_timeframes: vec![1, 5, 15],
        }
    }
}

impl ExchangeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.ws_url = env_string("WW_WS_URL", &config.ws_url);
        config.info_url = env_string("WW_INFO_URL", &config.info_url);
        config.target_symbol = env_string("WW_TARGET_SYMBOL", &config.target_symbol);
        config.target_only = env_parse("WW_TARGET_ONLY", config.target_only);
        config.heartbeat_interval_secs =
            env_parse("WW_HEARTBEAT_INTERVAL", config.heartbeat_interval_secs);
        config.mark_price_interval_secs =
            env_parse("WW_MARK_PRICE_INTERVAL", config.mark_price_interval_secs);
        config.info_concurrency = env_parse("WW_INFO_CONCURRENCY", config.info_concurrency);
        if let Ok(raw) = env::var("WW_CANDLE_TIMEFRAMES") {
            let timeframes: Vec<i64> = raw
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .filter(|minutes| *minutes > 0)
                .collect();
            if !timeframes.is_empty() {
                config.candle_timeframes = timeframes;
            }
        }
        config
    }
}

/// Connection pool sizing and recovery
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub num_clients: usize,
    /// Traders per client
    pub batch_size: usize,
    pub reconnect_base_delay_secs: f64,
    pub reconnect_max_delay_secs: f64,
    pub max_reconnect_attempts: u32,
    /// Pause between subscribe frames on connect
    pub subscribe_pacing_ms: u64,
    /// Cool-down before replacing a dead client
    pub replace_cooldown_secs: u64,
    pub replace_max_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_clients: 5,
            batch_size: 100,
            reconnect_base_delay_secs: 1.0,
            reconnect_max_delay_secs: 60.0,
            max_reconnect_attempts: 10,
            subscribe_pacing_ms: 10,
            replace_cooldown_secs: 5,
            replace_max_attempts: 5,
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.num_clients = env_parse("WW_NUM_CLIENTS", config.num_clients);
        config.batch_size = env_parse("WW_BATCH_SIZE", config.batch_size);
        config.reconnect_base_delay_secs =
            env_parse("WW_RECONNECT_BASE_DELAY", config.reconnect_base_delay_secs);
        config.reconnect_max_delay_secs =
            env_parse("WW_RECONNECT_MAX_DELAY", config.reconnect_max_delay_secs);
        config.max_reconnect_attempts =
            env_parse("WW_MAX_RECONNECT_ATTEMPTS", config.max_reconnect_attempts);
        config.subscribe_pacing_ms = env_parse("WW_SUBSCRIBE_PACING_MS", config.subscribe_pacing_ms);
        config.replace_cooldown_secs =
            env_parse("WW_REPLACE_COOLDOWN", config.replace_cooldown_secs);
        config.replace_max_attempts =
            env_parse("WW_REPLACE_MAX_ATTEMPTS", config.replace_max_attempts);
        config
    }
}

/// Frame buffer and de-duplication
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub flush_interval_secs: u64,
    pub buffer_max_size: usize,
    /// Force a save for an unchanged position after this long
    pub position_max_save_interval_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 5,
            buffer_max_size: 1000,
            position_max_save_interval_secs: 600,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.flush_interval_secs = env_parse("WW_FLUSH_INTERVAL", config.flush_interval_secs);
        config.buffer_max_size = env_parse("WW_BUFFER_MAX_SIZE", config.buffer_max_size);
        config.position_max_save_interval_secs = env_parse(
            "WW_POSITION_MAX_SAVE_INTERVAL",
            config.position_max_save_interval_secs,
        );
        config
    }
}

/// Signal generator state bounds
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub trader_ttl_secs: u64,
    pub max_traders: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            trader_ttl_secs: 86_400,
            max_traders: 10_000,
        }
    }
}

impl SignalConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.trader_ttl_secs = env_parse("WW_TRADER_TTL", config.trader_ttl_secs);
        config.max_traders = env_parse("WW_MAX_TRADERS", config.max_traders);
        config
    }
}

/// Whale detector thresholds and windows
#[derive(Debug, Clone)]
pub struct WhaleConfig {
    pub alpha_whale_threshold: f64,
    pub whale_threshold: f64,
    pub aggregation_window_minutes: i64,
    pub position_history_ttl_secs: u64,
    pub max_recent_changes: usize,
    pub max_alerts: usize,
}

impl Default for WhaleConfig {
    fn default() -> Self {
        Self {
            alpha_whale_threshold: 20_000_000.0,
            whale_threshold: 10_000_000.0,
            aggregation_window_minutes: 5,
            position_history_ttl_secs: 604_800,
            max_recent_changes: 1000,
            max_alerts: 500,
        }
    }
}

impl WhaleConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.alpha_whale_threshold =
            env_parse("WW_ALPHA_WHALE_THRESHOLD", config.alpha_whale_threshold);
        config.whale_threshold = env_parse("WW_WHALE_THRESHOLD", config.whale_threshold);
        config.aggregation_window_minutes =
            env_parse("WW_AGGREGATION_WINDOW", config.aggregation_window_minutes);
        config.position_history_ttl_secs =
            env_parse("WW_POSITION_HISTORY_TTL", config.position_history_ttl_secs);
        config.max_recent_changes = env_parse("WW_MAX_RECENT_CHANGES", config.max_recent_changes);
        config.max_alerts = env_parse("WW_MAX_ALERTS", config.max_alerts);
        config
    }
}

/// Event store location and skip rules
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: String,
    /// Topics excluded from the event log (oversize payloads)
    pub skip_topics: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "whalewire.db".to_string(),
            skip_topics: vec!["leaderboard".to_string()],
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.db_path = env_string("WW_DB_PATH", &config.db_path);
        if let Ok(raw) = env::var("WW_SKIP_TOPICS") {
            config.skip_topics = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        config
    }
}

/// Top-level configuration passed to the Core context
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub exchange: ExchangeConfig,
    pub pool: PoolConfig,
    pub router: RouterConfig,
    pub signal: SignalConfig,
    pub whale: WhaleConfig,
    pub storage: StorageConfig,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self {
            exchange: ExchangeConfig::from_env(),
            pool: PoolConfig::from_env(),
            router: RouterConfig::from_env(),
            signal: SignalConfig::from_env(),
            whale: WhaleConfig::from_env(),
            storage: StorageConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.pool.num_clients, 5);
        assert_eq!(config.pool.batch_size, 100);
        assert_eq!(config.pool.max_reconnect_attempts, 10);
        assert_eq!(config.router.flush_interval_secs, 5);
        assert_eq!(config.router.buffer_max_size, 1000);
        assert_eq!(config.router.position_max_save_interval_secs, 600);
        assert_eq!(config.signal.trader_ttl_secs, 86_400);
        assert_eq!(config.whale.position_history_ttl_secs, 604_800);
        assert_eq!(config.whale.max_alerts, 500);
        assert_eq!(config.exchange.target_symbol, "BTC");
    }

    #[test]
    fn test_env_override() {
        env::set_var("WW_BATCH_SIZE", "40");
        env::set_var("WW_SKIP_TOPICS", "leaderboard, candles");
        let pool = PoolConfig::from_env();
        let storage = StorageConfig::from_env();
        env::remove_var("WW_BATCH_SIZE");
        env::remove_var("WW_SKIP_TOPICS");

        assert_eq!(pool.batch_size, 40);
        assert_eq!(storage.skip_topics, vec!["leaderboard", "candles"]);
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        env::set_var("WW_MAX_TRADERS", "not-a-number");
        let signal = SignalConfig::from_env();
        env::remove_var("WW_MAX_TRADERS");
        assert_eq!(signal.max_traders, 10_000);
    }
}
