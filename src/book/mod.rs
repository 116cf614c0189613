//! Order book module - price-time priority matching
//!
//! The engine holds limit orders per side, matches incoming orders, and
//! produces the snapshot payloads used for checkpointing and fork
//! recovery.

mod engine;
mod order;

pub use engine::OrderBookEngine;
pub use order::{
    size_to_value, value_to_size, MakerFill, MatchResult, Order, OrderBookSnapshot, Side,
};
