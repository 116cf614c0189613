//! Price-time limit order book engine
//!
//! Two sides of price levels with FIFO queues per level: bids match best
//! (highest) price first, asks match best (lowest) price first, arrival
//! order breaking ties within a level. An id index supports closes and an
//! expiry index per side supports height-driven expiration in
//! deterministic id order.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::order::{
    size_to_value, value_to_size, MakerFill, MatchResult, Order, OrderBookSnapshot, Side,
};
use crate::error::{NodeError, NodeResult};

#[derive(Debug, Default)]
pub struct OrderBookEngine {
    bids: BTreeMap<Decimal, VecDeque<Order>>,
    asks: BTreeMap<Decimal, VecDeque<Order>>,
    /// id -> (side, level price)
    index: HashMap<String, (Side, Decimal)>,
    bid_expiry: BTreeMap<u64, BTreeSet<String>>,
    ask_expiry: BTreeMap<u64, BTreeSet<String>>,
    arrival_seq: u64,
}

impl OrderBookEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match an incoming order against the opposite side
    ///
    /// Limit takers match while prices cross and rest in their own side's
    /// book with any residual; market takers match until their remaining
    /// is exhausted or the opposite side is empty, surfacing the residual
    /// on the returned taker. Every maker touched in the call gets exactly
    /// one `MakerFill` record covering this call's slices only.
    pub fn add_order(&mut self, mut taker: Order) -> NodeResult<MatchResult> {
        if let Some(price) = taker.price {
            if price <= Decimal::ZERO {
                return Err(NodeError::Internal(format!(
                    "order {} has a non-positive price",
                    taker.id
                )));
            }
        }
        if self.index.contains_key(&taker.id) {
            return Err(NodeError::Internal(format!(
                "order {} is already open",
                taker.id
            )));
        }

        let mut makers: Vec<MakerFill> = Vec::new();
        let mut take_size = 0u64;
        let mut take_value = 0u64;

        while taker.remaining() > 0 {
            let level_price = match taker.side {
                Side::Bid => self.asks.keys().next().copied(),
                Side::Ask => self.bids.keys().next_back().copied(),
            };
            let Some(level_price) = level_price else {
                break;
            };

            if let Some(limit) = taker.price {
                let crosses = match taker.side {
                    Side::Bid => level_price <= limit,
                    Side::Ask => level_price >= limit,
                };
                if !crosses {
                    break;
                }
            }

            let mut level_filled: Vec<Order> = Vec::new();
            let mut stop = false;
            let level_empty;
            {
                let queue = match taker.side {
                    Side::Bid => self.asks.get_mut(&level_price),
                    Side::Ask => self.bids.get_mut(&level_price),
                }
                .expect("level price came from this side's key set");

                while let Some(maker) = queue.front_mut() {
                    if taker.remaining() == 0 {
                        break;
                    }

                    // Fill size in quote units, capped by what the paying
                    // side can still afford at the maker's price.
                    let fill_size = match taker.side {
                        Side::Bid => {
                            let affordable = value_to_size(taker.value_remaining, level_price);
                            affordable.min(maker.size_remaining)
                        }
                        Side::Ask => {
                            let capacity = value_to_size(maker.value_remaining, level_price);
                            taker.size_remaining.min(capacity)
                        }
                    };
                    if fill_size == 0 {
                        stop = true;
                        break;
                    }
                    let fill_value = size_to_value(fill_size, level_price);

                    match taker.side {
                        Side::Bid => {
                            taker.value_remaining -= fill_value;
                            maker.size_remaining -= fill_size;
                        }
                        Side::Ask => {
                            taker.size_remaining -= fill_size;
                            maker.value_remaining -= fill_value;
                        }
                    }
                    take_size += fill_size;
                    take_value += fill_value;
                    record_fill(&mut makers, maker, fill_size, fill_value);

                    if maker.is_filled() {
                        level_filled.push(queue.pop_front().expect("front maker exists"));
                    }
                }
                level_empty = queue.is_empty();
            }

            for maker in &level_filled {
                self.index.remove(&maker.id);
                self.remove_from_expiry(maker.side, maker.expiry_height, &maker.id);
            }
            if level_empty {
                match taker.side {
                    Side::Bid => self.asks.remove(&level_price),
                    Side::Ask => self.bids.remove(&level_price),
                };
            }
            if stop {
                break;
            }
        }

        if taker.remaining() > 0 && taker.is_limit() {
            self.insert(taker.clone());
        }

        Ok(MatchResult {
            taker,
            makers,
            take_size,
            take_value,
        })
    }

    /// Remove an open order and return its remaining state
    pub fn close_order(&mut self, id: &str) -> NodeResult<Order> {
        let order = self
            .detach(id)
            .ok_or_else(|| NodeError::OrderNotFound(id.to_string()))?;
        self.remove_from_expiry(order.side, order.expiry_height, &order.id);
        Ok(order)
    }

    /// Remove and return all bids with `expiry_height <= height`
    pub fn expire_bid_orders(&mut self, height: u64) -> Vec<Order> {
        self.expire_side(Side::Bid, height)
    }

    /// Remove and return all asks with `expiry_height <= height`
    pub fn expire_ask_orders(&mut self, height: u64) -> Vec<Order> {
        self.expire_side(Side::Ask, height)
    }

    fn expire_side(&mut self, side: Side, height: u64) -> Vec<Order> {
        let expiry = match side {
            Side::Bid => &mut self.bid_expiry,
            Side::Ask => &mut self.ask_expiry,
        };
        let keep = expiry.split_off(&(height.saturating_add(1)));
        let drained = std::mem::replace(expiry, keep);

        let mut expired = Vec::new();
        for (_, ids) in drained {
            for id in ids {
                if let Some(order) = self.detach(&id) {
                    expired.push(order);
                }
            }
        }
        expired
    }

    pub fn get_order(&self, id: &str) -> Option<&Order> {
        let (side, price) = self.index.get(id)?;
        let queue = match side {
            Side::Bid => self.bids.get(price),
            Side::Ask => self.asks.get(price),
        }?;
        queue.iter().find(|o| o.id == id)
    }

    /// Bids in priority order: price descending, then arrival ascending
    pub fn bid_orders(&self) -> impl Iterator<Item = &Order> {
        self.bids.iter().rev().flat_map(|(_, q)| q.iter())
    }

    /// Asks in priority order: price ascending, then arrival ascending
    pub fn ask_orders(&self) -> impl Iterator<Item = &Order> {
        self.asks.iter().flat_map(|(_, q)| q.iter())
    }

    /// All open orders, bids first
    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.bid_orders().chain(self.ask_orders())
    }

    pub fn peek_bid(&self) -> Option<&Order> {
        self.bid_orders().next()
    }

    pub fn peek_ask(&self) -> Option<&Order> {
        self.ask_orders().next()
    }

    pub fn best_bid_price(&self) -> Option<Decimal> {
        self.peek_bid().and_then(|order| order.price)
    }

    pub fn best_ask_price(&self) -> Option<Decimal> {
        self.peek_ask().and_then(|order| order.price)
    }

    pub fn bid_count(&self) -> usize {
        self.bids.values().map(|q| q.len()).sum()
    }

    pub fn ask_count(&self) -> usize {
        self.asks.values().map(|q| q.len()).sum()
    }

    pub fn get_snapshot(&self) -> OrderBookSnapshot {
        OrderBookSnapshot {
            bid_limit_orders: self.bid_orders().cloned().collect(),
            ask_limit_orders: self.ask_orders().cloned().collect(),
        }
    }

    /// Replace the book's contents with a snapshot, reassigning arrival
    /// sequence in the snapshot's serialization order
    pub fn set_snapshot(&mut self, snapshot: OrderBookSnapshot) {
        self.clear();
        for order in snapshot.bid_limit_orders {
            self.insert(order);
        }
        for order in snapshot.ask_limit_orders {
            self.insert(order);
        }
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.index.clear();
        self.bid_expiry.clear();
        self.ask_expiry.clear();
    }

    fn insert(&mut self, mut order: Order) {
        let price = order.price.expect("only limit orders rest in the book");
        self.arrival_seq += 1;
        order.arrival = self.arrival_seq;

        let expiry = match order.side {
            Side::Bid => &mut self.bid_expiry,
            Side::Ask => &mut self.ask_expiry,
        };
        expiry
            .entry(order.expiry_height)
            .or_default()
            .insert(order.id.clone());
        self.index.insert(order.id.clone(), (order.side, price));

        let book = match order.side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        book.entry(price).or_default().push_back(order);
    }

    /// Remove an order from its level queue and the id index, leaving the
    /// expiry index to the caller
    fn detach(&mut self, id: &str) -> Option<Order> {
        let (side, price) = self.index.remove(id)?;
        let book = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        let queue = book.get_mut(&price)?;
        let pos = queue.iter().position(|o| o.id == id)?;
        let order = queue.remove(pos);
        if queue.is_empty() {
            book.remove(&price);
        }
        order
    }

    fn remove_from_expiry(&mut self, side: Side, expiry_height: u64, id: &str) {
        let expiry = match side {
            Side::Bid => &mut self.bid_expiry,
            Side::Ask => &mut self.ask_expiry,
        };
        if let Some(ids) = expiry.get_mut(&expiry_height) {
            ids.remove(id);
            if ids.is_empty() {
                expiry.remove(&expiry_height);
            }
        }
    }
}

fn record_fill(makers: &mut Vec<MakerFill>, maker: &Order, fill_size: u64, fill_value: u64) {
    if let Some(entry) = makers.iter_mut().find(|f| f.order.id == maker.id) {
        entry.order = maker.clone();
        entry.size_taken += fill_size;
        entry.value_taken += fill_value;
    } else {
        makers.push(MakerFill {
            order: maker.clone(),
            size_taken: fill_size,
            value_taken: fill_value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ChainId;
    use rust_decimal_macros::dec;

    fn base() -> ChainId {
        ChainId::new("alpha")
    }

    fn quote() -> ChainId {
        ChainId::new("beta")
    }

    fn bid(id: &str, value: u64, price: Option<Decimal>, height: u64) -> Order {
        Order {
            id: id.to_string(),
            side: Side::Bid,
            source_chain: base(),
            source_wallet: format!("{id}-wallet"),
            target_chain: quote(),
            target_wallet: format!("{id}-target"),
            height,
            expiry_height: height + 100,
            timestamp: height * 10,
            price,
            value,
            value_remaining: value,
            size: 0,
            size_remaining: 0,
            arrival: 0,
        }
    }

    fn ask(id: &str, size: u64, price: Option<Decimal>, height: u64) -> Order {
        Order {
            id: id.to_string(),
            side: Side::Ask,
            source_chain: quote(),
            source_wallet: format!("{id}-wallet"),
            target_chain: base(),
            target_wallet: format!("{id}-target"),
            height,
            expiry_height: height + 100,
            timestamp: height * 10,
            price,
            value: 0,
            value_remaining: 0,
            size,
            size_remaining: size,
            arrival: 0,
        }
    }

    #[test]
    fn test_full_cross_empties_book() {
        let mut book = OrderBookEngine::new();
        book.add_order(ask("ask1", 100, Some(dec!(2)), 1)).unwrap();

        let result = book.add_order(bid("bid1", 200, Some(dec!(2)), 2)).unwrap();
        assert_eq!(result.take_size, 100);
        assert_eq!(result.take_value, 200);
        assert!(result.taker.is_filled());
        assert_eq!(result.makers.len(), 1);
        assert_eq!(result.makers[0].size_taken, 100);
        assert_eq!(result.makers[0].value_taken, 200);
        assert_eq!(book.bid_count() + book.ask_count(), 0);
    }

    #[test]
    fn test_market_taker_residual_not_rested() {
        let mut book = OrderBookEngine::new();
        book.add_order(ask("ask1", 100, Some(dec!(2)), 1)).unwrap();

        let result = book.add_order(bid("mkt1", 300, None, 2)).unwrap();
        assert_eq!(result.take_size, 100);
        assert_eq!(result.take_value, 200);
        assert_eq!(result.taker.value_remaining, 100);
        assert_eq!(book.bid_count(), 0);
        assert_eq!(book.ask_count(), 0);
    }

    #[test]
    fn test_limit_residual_rests_on_own_side() {
        let mut book = OrderBookEngine::new();
        book.add_order(ask("ask1", 50, Some(dec!(2)), 1)).unwrap();

        let result = book.add_order(bid("bid1", 300, Some(dec!(2)), 2)).unwrap();
        assert_eq!(result.take_size, 50);
        assert_eq!(result.taker.value_remaining, 200);
        assert_eq!(book.bid_count(), 1);
        assert_eq!(book.get_order("bid1").unwrap().value_remaining, 200);
    }

    #[test]
    fn test_no_cross_when_prices_apart() {
        let mut book = OrderBookEngine::new();
        book.add_order(ask("ask1", 100, Some(dec!(3)), 1)).unwrap();
        let result = book.add_order(bid("bid1", 200, Some(dec!(2)), 2)).unwrap();
        assert_eq!(result.take_size, 0);
        assert_eq!(book.bid_count(), 1);
        assert_eq!(book.ask_count(), 1);
    }

    #[test]
    fn test_fills_at_maker_price_in_time_priority() {
        let mut book = OrderBookEngine::new();
        book.add_order(ask("ask1", 10, Some(dec!(2)), 1)).unwrap();
        book.add_order(ask("ask2", 10, Some(dec!(2)), 2)).unwrap();
        book.add_order(ask("ask3", 10, Some(dec!(1)), 3)).unwrap();

        // Crosses the cheap ask first, then the older of the 2-priced asks.
        let result = book.add_order(bid("bid1", 25, Some(dec!(2)), 4)).unwrap();
        assert_eq!(result.makers[0].order.id, "ask3");
        assert_eq!(result.makers[0].value_taken, 10);
        assert_eq!(result.makers[1].order.id, "ask1");
        // 15 base remaining at price 2 buys 7 quote units.
        assert_eq!(result.makers[1].size_taken, 7);
        assert_eq!(result.taker.value_remaining, 1);
    }

    #[test]
    fn test_maker_record_covers_single_call_only() {
        let mut book = OrderBookEngine::new();
        book.add_order(ask("ask1", 100, Some(dec!(1)), 1)).unwrap();

        let first = book.add_order(bid("bid1", 30, Some(dec!(1)), 2)).unwrap();
        assert_eq!(first.makers[0].size_taken, 30);

        let second = book.add_order(bid("bid2", 20, Some(dec!(1)), 3)).unwrap();
        assert_eq!(second.makers[0].size_taken, 20);
        assert_eq!(second.makers[0].order.size_remaining, 50);
    }

    #[test]
    fn test_close_order() {
        let mut book = OrderBookEngine::new();
        book.add_order(bid("bid1", 200, Some(dec!(2)), 1)).unwrap();

        let closed = book.close_order("bid1").unwrap();
        assert_eq!(closed.value_remaining, 200);
        assert!(book.get_order("bid1").is_none());
        assert!(matches!(
            book.close_order("bid1"),
            Err(NodeError::OrderNotFound(_))
        ));
        // Closing must also clear the expiry index.
        assert!(book.expire_bid_orders(u64::MAX - 1).is_empty());
    }

    #[test]
    fn test_expiry_removes_prefix_in_id_order() {
        let mut book = OrderBookEngine::new();
        let mut early_b = bid("b-early", 10, Some(dec!(1)), 1);
        early_b.expiry_height = 5;
        let mut early_a = bid("a-early", 10, Some(dec!(1)), 2);
        early_a.expiry_height = 5;
        let mut late = bid("c-late", 10, Some(dec!(1)), 3);
        late.expiry_height = 9;
        book.add_order(early_b).unwrap();
        book.add_order(early_a).unwrap();
        book.add_order(late).unwrap();

        let expired = book.expire_bid_orders(5);
        let ids: Vec<_> = expired.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["a-early", "b-early"]);
        assert_eq!(book.bid_count(), 1);

        let rest = book.expire_bid_orders(9);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "c-late");
    }

    #[test]
    fn test_snapshot_round_trip_is_identity() {
        let mut book = OrderBookEngine::new();
        book.add_order(bid("bid1", 200, Some(dec!(2)), 1)).unwrap();
        book.add_order(bid("bid2", 100, Some(dec!(3)), 2)).unwrap();
        book.add_order(ask("ask1", 50, Some(dec!(5)), 3)).unwrap();

        let snapshot = book.get_snapshot();
        assert_eq!(snapshot.bid_limit_orders[0].id, "bid2");

        let mut restored = OrderBookEngine::new();
        restored.set_snapshot(snapshot);
        let ids = |b: &OrderBookEngine| {
            b.open_orders()
                .map(|o| (o.id.clone(), o.remaining()))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&book), ids(&restored));
        assert_eq!(restored.best_bid_price(), Some(dec!(3)));
        assert_eq!(restored.best_ask_price(), Some(dec!(5)));
    }

    #[test]
    fn test_remainders_stay_within_bounds() {
        let mut book = OrderBookEngine::new();
        book.add_order(ask("ask1", 7, Some(dec!(1.5)), 1)).unwrap();
        let result = book.add_order(bid("bid1", 10, Some(dec!(2)), 2)).unwrap();

        // 10 base at price 1.5 affords 6 quote units worth 9 base.
        assert_eq!(result.take_size, 6);
        assert_eq!(result.take_value, 9);
        let taker = &result.taker;
        assert!(taker.value_remaining <= taker.value);
        let maker = &result.makers[0].order;
        assert!(maker.size_remaining <= maker.size);
        assert_eq!(maker.size_remaining, 1);
    }
}
