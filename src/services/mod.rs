//! Core Services
//!
//! Each service owns a slice of state: the matching engine owns books and
//! orders, the portfolio store owns cash and holdings, the price engine owns
//! quotes, the analytics recorder owns the trade log, the event bus owns
//! nothing and carries everything.

pub mod analytics;
pub mod events;
pub mod market;
pub mod matching;
pub mod portfolio;
pub mod price;
pub mod settlement;
pub mod webhooks;
