//! Exchange info-endpoint client and the mark-price poller.
//!
//! One POST endpoint, typed by the `type` field of the request body.
//! Requests are bounded by a semaphore and retried with exponential
//! backoff on transport failures and 5xx/429 responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::ExchangeConfig;
use crate::events::{EventPayload, MarkPricePayload, StandardEvent};

const MAX_RETRIES: u32 = 5;
const BACKOFF_CAP: Duration = Duration::from_secs(16);

pub struct InfoClient {
    http: reqwest::Client,
    info_url: String,
    semaphore: Arc<Semaphore>,
}

impl InfoClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build info http client")?;
        Ok(Self {
            http,
            info_url: config.info_url.clone(),
            semaphore: Arc::new(Semaphore::new(config.info_concurrency.max(1))),
        })
    }

    async fn post_info(&self, payload: serde_json::Value) -> Result<serde_json::Value> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("info semaphore closed")?;

        let mut backoff = Duration::from_millis(500);
        for attempt in 1..=MAX_RETRIES {
            match self.http.post(&self.info_url).json(&payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json().await.context("decode info response");
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%status, attempt, "info endpoint busy, backing off");
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        bail!("info endpoint error {status}: {body}");
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "info request failed");
                    if attempt == MAX_RETRIES {
                        return Err(e.into());
                    }
                }
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }

        bail!("info endpoint retries exhausted for {}", self.info_url)
    }

    /// Mid prices for every listed coin: `{"BTC": "97000.5", ...}`
    pub async fn all_mids(&self) -> Result<HashMap<String, f64>> {
        let value = self.post_info(json!({"type": "allMids"})).await?;
        Ok(parse_mids(&value))
    }

    pub async fn mark_price(&self, symbol: &str) -> Result<Option<f64>> {
        Ok(self.all_mids().await?.get(symbol).copied())
    }
}

fn parse_mids(value: &serde_json::Value) -> HashMap<String, f64> {
    let Some(object) = value.as_object() else {
        return HashMap::new();
    };
    object
        .iter()
        .filter_map(|(coin, raw)| {
            let price = match raw {
                serde_json::Value::String(s) => s.parse().ok(),
                serde_json::Value::Number(n) => n.as_f64(),
                _ => None,
            }?;
            Some((coin.clone(), price))
        })
        .collect()
}

/// Poll allMids on an interval and publish mark_price for the target symbol.
pub fn spawn_mark_price_collector(
    client: Arc<InfoClient>,
    bus: Arc<EventBus>,
    symbol: String,
    interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match client.mark_price(&symbol).await {
                Ok(Some(mark_price)) => {
                    debug!(symbol = %symbol, mark_price, "mark price refreshed");
                    bus.publish(StandardEvent::new(
                        "mark_price_collector",
                        EventPayload::MarkPrice(MarkPricePayload {
                            symbol: symbol.clone(),
                            mark_price,
                            timestamp: Utc::now(),
                        }),
                    ))
                    .await;
                }
                Ok(None) => warn!(symbol = %symbol, "symbol missing from allMids"),
                Err(e) => warn!(error = %e, "mark price poll failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mids_mixed_types() {
        let value = json!({
            "BTC": "97000.5",
            "ETH": 3200.25,
            "BAD": true,
            "WORSE": "not-a-number"
        });
        let mids = parse_mids(&value);
        assert_eq!(mids.len(), 2);
        assert!((mids["BTC"] - 97_000.5).abs() < 1e-9);
        assert!((mids["ETH"] - 3_200.25).abs() < 1e-9);
    }

    #[test]
    fn test_parse_mids_non_object() {
        assert!(parse_mids(&json!([1, 2, 3])).is_empty());
    }

    #[tokio::test]
    #[ignore] // Only run against the live endpoint
    async fn test_all_mids_real() {
        let client = InfoClient::new(&ExchangeConfig::default()).unwrap();
        let mids = client.all_mids().await.unwrap();
        assert!(mids.contains_key("BTC"));
    }
}
