//! Intent parsing - decodes inbound transfer memos into typed order intents
//!
//! The memo is comma-separated UTF-8: `<targetChain>,<operation>,...`.
//! Classification walks a fixed decision table, first match winning, so a
//! transfer is always classified exactly one way no matter how malformed
//! its memo is.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

use crate::book::{size_to_value, value_to_size, OrderBookEngine};
use crate::ledger::{ChainId, Transfer};

/// Largest representable amount; anything above is refunded as oversized
pub const MAX_SAFE_AMOUNT: u64 = (1 << 53) - 1;

pub const REASON_INVALID_TARGET_CHAIN: &str = "Invalid target chain";
pub const REASON_INVALID_PRICE: &str = "Invalid price";
pub const REASON_INVALID_WALLET: &str = "Invalid wallet address";
pub const REASON_TOO_SMALL: &str = "Too small to convert";
pub const REASON_INVALID_CLOSE: &str = "Invalid order to close";
pub const REASON_INVALID_OPERATION: &str = "Invalid operation";

/// Classified form of one inbound transfer
#[derive(Debug, Clone, PartialEq)]
pub enum IntentKind {
    Limit {
        price: Decimal,
        target_wallet: String,
    },
    Market {
        target_wallet: String,
    },
    Close {
        order_id: String,
    },
    Invalid {
        reason: &'static str,
    },
    Oversized,
    Undersized,
    Moved {
        to_address: String,
    },
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Intent {
    pub kind: IntentKind,
    pub transfer_id: String,
    pub source_chain: ChainId,
    pub source_wallet: String,
    pub amount: u64,
    pub height: u64,
    pub timestamp: u64,
}

impl Intent {
    /// Rejections are refunded rather than admitted to the book
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind,
            IntentKind::Invalid { .. }
                | IntentKind::Oversized
                | IntentKind::Undersized
                | IntentKind::Moved { .. }
                | IntentKind::Disabled
        )
    }
}

/// Per-chain parameters the parser consults
#[derive(Debug, Clone)]
pub struct ParserChainParams {
    pub min_order_amount: u64,
    pub exchange_fee_base: u64,
    pub dex_disabled_from_height: Option<u64>,
    pub dex_moved_to_address: Option<String>,
}

pub struct IntentParser {
    base: ChainId,
    quote: ChainId,
    params: HashMap<ChainId, ParserChainParams>,
}

impl IntentParser {
    pub fn new(base: ChainId, quote: ChainId, params: HashMap<ChainId, ParserChainParams>) -> Self {
        Self {
            base,
            quote,
            params,
        }
    }

    /// Classify one inbound transfer
    pub fn parse(&self, transfer: &Transfer, source: &ChainId, book: &OrderBookEngine) -> Intent {
        let kind = self.classify(transfer, source, book);
        Intent {
            kind,
            transfer_id: transfer.id.clone(),
            source_chain: source.clone(),
            source_wallet: transfer.sender.clone(),
            amount: transfer.amount,
            height: transfer.height,
            timestamp: transfer.timestamp,
        }
    }

    fn classify(&self, transfer: &Transfer, source: &ChainId, book: &OrderBookEngine) -> IntentKind {
        let params = &self.params[source];

        if transfer.amount > MAX_SAFE_AMOUNT {
            return IntentKind::Oversized;
        }

        if let Some(disabled_from) = params.dex_disabled_from_height {
            if transfer.height >= disabled_from {
                return match &params.dex_moved_to_address {
                    Some(addr) => IntentKind::Moved {
                        to_address: addr.clone(),
                    },
                    None => IntentKind::Disabled,
                };
            }
        }

        let fields: Vec<&str> = transfer.memo.split(',').collect();
        let counter = if source == &self.base {
            &self.quote
        } else {
            &self.base
        };
        if fields.first().copied().unwrap_or("") != counter.as_str() {
            return IntentKind::Invalid {
                reason: REASON_INVALID_TARGET_CHAIN,
            };
        }

        let operation = fields.get(1).copied().unwrap_or("");
        if matches!(operation, "limit" | "market") && transfer.amount < params.min_order_amount {
            return IntentKind::Undersized;
        }

        match operation {
            "limit" => {
                let price = fields.get(2).and_then(|s| Decimal::from_str(s).ok());
                let price = match price {
                    Some(p) if p > Decimal::ZERO => p,
                    _ => {
                        return IntentKind::Invalid {
                            reason: REASON_INVALID_PRICE,
                        }
                    }
                };
                let wallet = fields.get(3).copied().unwrap_or("");
                if wallet.is_empty() {
                    return IntentKind::Invalid {
                        reason: REASON_INVALID_WALLET,
                    };
                }
                if self.converts_to_dust(transfer.amount, price, source) {
                    return IntentKind::Invalid {
                        reason: REASON_TOO_SMALL,
                    };
                }
                IntentKind::Limit {
                    price,
                    target_wallet: wallet.to_string(),
                }
            }
            "market" => {
                let wallet = fields.get(2).copied().unwrap_or("");
                if wallet.is_empty() {
                    return IntentKind::Invalid {
                        reason: REASON_INVALID_WALLET,
                    };
                }
                // Convertibility probes the opposite book's best price.
                let best = if source == &self.base {
                    book.best_ask_price()
                } else {
                    book.best_bid_price()
                };
                let Some(best) = best else {
                    return IntentKind::Invalid {
                        reason: REASON_TOO_SMALL,
                    };
                };
                if self.converts_to_dust(transfer.amount, best, source) {
                    return IntentKind::Invalid {
                        reason: REASON_TOO_SMALL,
                    };
                }
                IntentKind::Market {
                    target_wallet: wallet.to_string(),
                }
            }
            "close" => {
                let order_id = fields.get(2).copied().unwrap_or("");
                if order_id.is_empty() {
                    return IntentKind::Invalid {
                        reason: REASON_INVALID_CLOSE,
                    };
                }
                match book.get_order(order_id) {
                    Some(order)
                        if order.source_chain == *source
                            && order.source_wallet == transfer.sender =>
                    {
                        IntentKind::Close {
                            order_id: order_id.to_string(),
                        }
                    }
                    _ => IntentKind::Invalid {
                        reason: REASON_INVALID_CLOSE,
                    },
                }
            }
            _ => IntentKind::Invalid {
                reason: REASON_INVALID_OPERATION,
            },
        }
    }

    /// An order whose converted value cannot clear the counter chain's base
    /// fee would settle to nothing
    fn converts_to_dust(&self, amount: u64, price: Decimal, source: &ChainId) -> bool {
        if source == &self.base {
            let quote_fee_base = self.params[&self.quote].exchange_fee_base;
            value_to_size(amount, price) <= quote_fee_base
        } else {
            let base_fee_base = self.params[&self.base].exchange_fee_base;
            size_to_value(amount, price) <= base_fee_base
        }
    }
}
