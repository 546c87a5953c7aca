//! Event-driven processors: each subscribes its topics on the bus and may
//! publish derived events back onto it.

pub mod candle;
pub mod signal;
pub mod whale;

#[cfg(test)]
mod event_flow_test;

pub use candle::{CandleProcessor, CandleStats};
pub use signal::{SignalGenerator, SignalStats};
pub use whale::{WhaleDetector, WhaleStats};
