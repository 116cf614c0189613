//! Order model and fill accounting for the matching engine

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::ChainId;

/// Book side. Inbound transfers on the base chain become bids, inbound
/// transfers on the quote chain become asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

/// An open trading intent held by the book
///
/// Bids are denominated in base currency (`value` / `value_remaining`),
/// asks in quote currency (`size` / `size_remaining`). Price converts
/// between the two: `value = size * price`, floored. Market orders carry
/// no price and never rest in the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub side: Side,
    pub source_chain: ChainId,
    pub source_wallet: String,
    pub target_chain: ChainId,
    pub target_wallet: String,
    /// Admission height on the source chain
    pub height: u64,
    pub expiry_height: u64,
    /// Source block timestamp
    pub timestamp: u64,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub value: u64,
    #[serde(default)]
    pub value_remaining: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub size_remaining: u64,
    /// Arrival sequence assigned by the engine, the time-priority tie-break
    #[serde(default)]
    pub arrival: u64,
}

impl Order {
    pub fn is_limit(&self) -> bool {
        self.price.is_some()
    }

    /// Remaining amount in the order's own denomination
    pub fn remaining(&self) -> u64 {
        match self.side {
            Side::Bid => self.value_remaining,
            Side::Ask => self.size_remaining,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.remaining() == 0
    }
}

/// One maker touched during a single `add_order` call
///
/// `size_taken` / `value_taken` cover only the slices taken from this
/// maker during that call; successive calls report fresh records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MakerFill {
    pub order: Order,
    pub size_taken: u64,
    pub value_taken: u64,
}

/// Outcome of matching one incoming order
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// The taker after all fills; residuals remain in its `*_remaining`
    pub taker: Order,
    pub makers: Vec<MakerFill>,
    /// Total quote units exchanged
    pub take_size: u64,
    /// Total base units exchanged
    pub take_value: u64,
}

/// Serialized book state: bids price-descending then time-ascending,
/// asks price-ascending then time-ascending
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub bid_limit_orders: Vec<Order>,
    pub ask_limit_orders: Vec<Order>,
}

/// Quote units bought by `value` base units at `price`, floored
pub fn value_to_size(value: u64, price: Decimal) -> u64 {
    if price <= Decimal::ZERO {
        return 0;
    }
    (Decimal::from(value) / price).floor().to_u64().unwrap_or(0)
}

/// Base-currency worth of `size` quote units at `price`, floored
pub fn size_to_value(size: u64, price: Decimal) -> u64 {
    // Caller guarantees price fits; a failed conversion floors to zero and
    // the resulting payout is dropped as an underflow.
    (Decimal::from(size) * price).floor().to_u64().unwrap_or(0)
}
