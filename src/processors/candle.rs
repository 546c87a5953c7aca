//! Candle aggregation over mark-price samples.
//!
//! One building candle per timeframe; a sample landing past the current
//! bucket boundary completes the previous candle and emits it. Completed
//! candles flow through the bus into the per-symbol candle collection.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::events::{EventPayload, StandardEvent};
use crate::models::Candle;

const SOURCE: &str = "candle_processor";

/// Floor a timestamp to its timeframe bucket boundary.
fn bucket_open(ts: DateTime<Utc>, interval_minutes: i64) -> DateTime<Utc> {
    let interval_secs = interval_minutes * 60;
    let floored = ts.timestamp() - ts.timestamp().rem_euclid(interval_secs);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
}

struct BuildingCandle {
    open_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    samples: u32,
}

impl BuildingCandle {
    fn start(open_time: DateTime<Utc>, price: f64) -> Self {
        Self {
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            samples: 1,
        }
    }

    fn fold(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.samples += 1;
    }

    fn finish(&self, symbol: &str, interval_minutes: i64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval_minutes,
            open_time: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            samples: self.samples,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandleStats {
    pub candles_completed: u64,
    pub open_candles: usize,
}

pub struct CandleProcessor {
    symbol: String,
    timeframes: Vec<i64>,
    /// timeframe -> candle currently being built
    building: Mutex<HashMap<i64, BuildingCandle>>,
    completed: Mutex<u64>,
}

impl CandleProcessor {
    pub fn new(symbol: String, timeframes: Vec<i64>) -> Self {
        Self {
            symbol,
            timeframes,
            building: Mutex::new(HashMap::new()),
            completed: Mutex::new(0),
        }
    }

    /// Bus entry point: fold a mark-price sample, return completed candles.
    pub fn handle_event(&self, event: &StandardEvent) -> Vec<StandardEvent> {
        let EventPayload::MarkPrice(payload) = &event.payload else {
            return Vec::new();
        };
        if payload.symbol != self.symbol {
            return Vec::new();
        }
        self.fold_sample(payload.mark_price, payload.timestamp)
            .into_iter()
            .map(|candle| StandardEvent::new(SOURCE, EventPayload::Candles(candle)))
            .collect()
    }

    fn fold_sample(&self, price: f64, ts: DateTime<Utc>) -> Vec<Candle> {
        if !price.is_finite() || price <= 0.0 {
            return Vec::new();
        }

        let mut completed = Vec::new();
        let mut building = self.building.lock();

        for &interval in &self.timeframes {
            let open_time = bucket_open(ts, interval);
            match building.remove(&interval) {
                None => {
                    building.insert(interval, BuildingCandle::start(open_time, price));
                }
                Some(mut candle) if candle.open_time == open_time => {
                    candle.fold(price);
                    building.insert(interval, candle);
                }
                Some(candle) if open_time > candle.open_time => {
                    completed.push(candle.finish(&self.symbol, interval));
                    building.insert(interval, BuildingCandle::start(open_time, price));
                }
                // Out-of-order sample from before the current bucket; drop it
                Some(candle) => {
                    debug!(interval, "stale mark price sample ignored");
                    building.insert(interval, candle);
                }
            }
        }

        if !completed.is_empty() {
            *self.completed.lock() += completed.len() as u64;
        }
        completed
    }

    pub fn stats(&self) -> CandleStats {
        CandleStats {
            candles_completed: *self.completed.lock(),
            open_candles: self.building.lock().len(),
        }
    }
}
