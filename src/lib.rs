//! whalewire - smart-money position tracking and signal core.
//!
//! Ingests per-trader position pushes over a pooled WebSocket connection,
//! de-duplicates them into events, and distills the tracked trader set into
//! a directional signal plus priority-tiered whale alerts.

pub mod bus;
pub mod config;
pub mod events;
pub mod exchange;
pub mod lifecycle;
pub mod models;
pub mod pool;
pub mod processors;
pub mod router;
pub mod storage;

pub use bus::EventBus;
pub use config::CoreConfig;
pub use lifecycle::{Core, CoreApi, CoreStats};
pub use models::{Recommendation, Signal, Tier, WhaleAlert};
