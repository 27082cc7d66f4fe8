//! Matching Engine
//!
//! Price-time priority matching with partial fills and market orders.

mod book;
mod engine;

pub use book::{BookOrder, OrderBook, PriceKey, RawMatch};
pub use engine::{EngineStats, MatchingEngine};
