//! Order Book
//!
//! Per-symbol price-time priority book. Each side holds a price ladder
//! (`BTreeMap` of FIFO queues) plus a separate FIFO for market orders,
//! which outrank every limit price while keeping arrival order among
//! themselves. All access is serialized by the owning engine.

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use crate::models::order::{DepthLevel, Side};

/// Price level key with 8 decimal digits of precision for exact ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PriceKey(i64);

const PRICE_SCALE: i64 = 100_000_000;

impl PriceKey {
    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = price * Decimal::from(PRICE_SCALE);
        let truncated = scaled.trunc();
        let value = truncated.mantissa() / 10i128.pow(truncated.scale());
        PriceKey(value as i64)
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(PRICE_SCALE)
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An order resting in the book
#[derive(Debug, Clone)]
pub struct BookOrder {
    pub id: Uuid,
    pub investor: Uuid,
    pub side: Side,
    pub qty: i64,
    pub filled: i64,
    /// Zero marks a market order
    pub limit_price: Decimal,
    /// Arrival sequence, for time priority and aggressor selection
    pub seq: u64,
}

impl BookOrder {
    pub fn remaining(&self) -> i64 {
        self.qty - self.filled
    }

    pub fn is_market(&self) -> bool {
        self.limit_price.is_zero()
    }
}

/// One crossing produced by the match loop
#[derive(Debug, Clone)]
pub struct RawMatch {
    pub buy_order_id: Uuid,
    pub buy_investor: Uuid,
    pub sell_order_id: Uuid,
    pub sell_investor: Uuid,
    pub qty: i64,
    pub price: Decimal,
    pub aggressor: Side,
}

/// Which queue a resting order lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Market,
    Limit(PriceKey),
}

pub struct OrderBook {
    symbol: String,
    bids: BTreeMap<PriceKey, VecDeque<BookOrder>>,
    asks: BTreeMap<PriceKey, VecDeque<BookOrder>>,
    market_bids: VecDeque<BookOrder>,
    market_asks: VecDeque<BookOrder>,
    index: HashMap<Uuid, (Side, Slot)>,
}

impl OrderBook {
    pub fn new(symbol: String) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            market_bids: VecDeque::new(),
            market_asks: VecDeque::new(),
            index: HashMap::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn contains(&self, order_id: &Uuid) -> bool {
        self.index.contains_key(order_id)
    }

    pub fn resting_count(&self) -> usize {
        self.index.len()
    }

    /// Insert a live order on its side
    pub fn insert(&mut self, order: BookOrder) {
        let side = order.side;
        let slot = if order.is_market() {
            Slot::Market
        } else {
            Slot::Limit(PriceKey::from_decimal(order.limit_price))
        };

        self.index.insert(order.id, (side, slot));

        match (side, slot) {
            (Side::Buy, Slot::Market) => self.market_bids.push_back(order),
            (Side::Sell, Slot::Market) => self.market_asks.push_back(order),
            (Side::Buy, Slot::Limit(key)) => {
                self.bids.entry(key).or_default().push_back(order)
            }
            (Side::Sell, Slot::Limit(key)) => {
                self.asks.entry(key).or_default().push_back(order)
            }
        }
    }

    /// Remove an order, wherever it rests
    pub fn remove(&mut self, order_id: &Uuid) -> Option<BookOrder> {
        let (side, slot) = self.index.remove(order_id)?;

        let queue = match (side, slot) {
            (Side::Buy, Slot::Market) => &mut self.market_bids,
            (Side::Sell, Slot::Market) => &mut self.market_asks,
            (Side::Buy, Slot::Limit(key)) => self.bids.get_mut(&key)?,
            (Side::Sell, Slot::Limit(key)) => self.asks.get_mut(&key)?,
        };

        let pos = queue.iter().position(|o| o.id == *order_id)?;
        let removed = queue.remove(pos);

        if let Slot::Limit(key) = slot {
            let empty = match side {
                Side::Buy => self.bids.get(&key).map_or(false, |q| q.is_empty()),
                Side::Sell => self.asks.get(&key).map_or(false, |q| q.is_empty()),
            };
            if empty {
                match side {
                    Side::Buy => self.bids.remove(&key),
                    Side::Sell => self.asks.remove(&key),
                };
            }
        }

        removed
    }

    /// Best limit bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().map(|k| k.to_decimal())
    }

    /// Best limit ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().map(|k| k.to_decimal())
    }

    /// Attempt one crossing at the top of the book.
    ///
    /// Price rule: a market order takes the opposite limit price; two limits
    /// trade at the resting ask price. Two market orders never trade with
    /// each other (no price can form) — the older of the two executes first
    /// against the opposite side's limit ladder.
    pub fn cross_once(&mut self) -> Option<RawMatch> {
        let bid_market_seq = self.market_bids.front().map(|o| o.seq);
        let ask_market_seq = self.market_asks.front().map(|o| o.seq);

        let (bid_from_market, ask_from_market) = match (bid_market_seq, ask_market_seq) {
            (Some(b), Some(a)) => {
                if b <= a {
                    (true, false)
                } else {
                    (false, true)
                }
            }
            (b, a) => (b.is_some(), a.is_some()),
        };

        let (bid_id, bid_price, bid_seq, bid_remaining) = {
            let bid = if bid_from_market {
                self.market_bids.front()
            } else {
                self.bids.values().next_back().and_then(|q| q.front())
            }?;
            (bid.id, bid.limit_price, bid.seq, bid.remaining())
        };
        let (ask_id, ask_price, ask_seq, ask_remaining) = {
            let ask = if ask_from_market {
                self.market_asks.front()
            } else {
                self.asks.values().next().and_then(|q| q.front())
            }?;
            (ask.id, ask.limit_price, ask.seq, ask.remaining())
        };

        let bid_is_market = bid_from_market;
        let ask_is_market = ask_from_market;

        // Execution price: market takes the opposite limit; otherwise the
        // resting liquidity provider's (ask) price wins the tie.
        let price = if bid_is_market {
            ask_price
        } else if ask_is_market {
            bid_price
        } else if bid_price >= ask_price {
            ask_price
        } else {
            return None;
        };

        let qty = bid_remaining.min(ask_remaining);
        if qty <= 0 {
            return None;
        }

        let aggressor = if bid_is_market {
            Side::Buy
        } else if ask_is_market {
            Side::Sell
        } else if bid_seq > ask_seq {
            Side::Buy
        } else {
            Side::Sell
        };

        let buy_investor = self.fill_entry(Side::Buy, bid_id, qty);
        let sell_investor = self.fill_entry(Side::Sell, ask_id, qty);

        Some(RawMatch {
            buy_order_id: bid_id,
            buy_investor,
            sell_order_id: ask_id,
            sell_investor,
            qty,
            price,
            aggressor,
        })
    }

    /// Apply a fill to a resting entry; pop it once fully filled
    fn fill_entry(&mut self, side: Side, order_id: Uuid, qty: i64) -> Uuid {
        let slot = self
            .index
            .get(&order_id)
            .map(|(_, slot)| *slot)
            .expect("filled order must be indexed");

        let queue = match (side, slot) {
            (Side::Buy, Slot::Market) => &mut self.market_bids,
            (Side::Sell, Slot::Market) => &mut self.market_asks,
            (Side::Buy, Slot::Limit(key)) => {
                self.bids.get_mut(&key).expect("indexed level must exist")
            }
            (Side::Sell, Slot::Limit(key)) => {
                self.asks.get_mut(&key).expect("indexed level must exist")
            }
        };

        let entry = queue
            .front_mut()
            .expect("filled order must be at the front of its queue");
        debug_assert_eq!(entry.id, order_id);
        entry.filled += qty;
        let investor = entry.investor;

        if entry.remaining() <= 0 {
            queue.pop_front();
            self.index.remove(&order_id);
            if let Slot::Limit(key) = slot {
                let empty = match side {
                    Side::Buy => self.bids.get(&key).map_or(false, |q| q.is_empty()),
                    Side::Sell => self.asks.get(&key).map_or(false, |q| q.is_empty()),
                };
                if empty {
                    match side {
                        Side::Buy => self.bids.remove(&key),
                        Side::Sell => self.asks.remove(&key),
                    };
                }
            }
        }

        investor
    }

    /// Price-aggregated depth, bids descending and asks ascending. Market
    /// orders carry no price level and do not appear here.
    pub fn depth(&self) -> (Vec<DepthLevel>, Vec<DepthLevel>) {
        let bids = self
            .bids
            .iter()
            .rev()
            .map(|(key, queue)| DepthLevel {
                price: key.to_decimal(),
                qty: queue.iter().map(|o| o.remaining()).sum(),
                count: queue.len(),
            })
            .collect();

        let asks = self
            .asks
            .iter()
            .map(|(key, queue)| DepthLevel {
                price: key.to_decimal(),
                qty: queue.iter().map(|o| o.remaining()).sum(),
                count: queue.len(),
            })
            .collect();

        (bids, asks)
    }

    /// Total resting quantity on one side, market orders included
    pub fn side_depth(&self, side: Side) -> i64 {
        let (ladder, market) = match side {
            Side::Buy => (&self.bids, &self.market_bids),
            Side::Sell => (&self.asks, &self.market_asks),
        };
        let limit: i64 = ladder
            .values()
            .flat_map(|q| q.iter())
            .map(|o| o.remaining())
            .sum();
        let market: i64 = market.iter().map(|o| o.remaining()).sum();
        limit + market
    }
}
