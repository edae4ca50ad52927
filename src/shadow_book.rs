//! C1 — in-memory replica of one market's top-of-book.
//!
//! Mirrors `examples/original_source/poly_market_maker/simulation/shadow_book.py`:
//! snapshot/delta application, a best-bid/best-ask cache invalidated only
//! when the cached level is removed or beaten, and probabilistic desync
//! detection against server-reported best bid/ask.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use rand::Rng;

use crate::constants::{DESYNC_SAMPLE_RATE, EPSILON};

/// Wraps an `f64` price so it can key a `BTreeMap`. Prices arriving from the
/// exchange are always finite, so a total order via `partial_cmp` is safe.
#[derive(Clone, Copy, Debug, PartialEq)]
struct PriceKey(f64);

impl Eq for PriceKey {}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// One side of the local book: price -> aggregate size. Zero-size levels
/// are never stored.
#[derive(Clone, Debug, Default)]
pub struct LocalBookSide {
    levels: BTreeMap<PriceKey, f64>,
    best_cache: Option<f64>,
    /// `true` for bids (best = max), `false` for asks (best = min).
    is_bid: bool,
}

impl LocalBookSide {
    fn new(is_bid: bool) -> Self {
        Self { levels: BTreeMap::new(), best_cache: None, is_bid }
    }

    fn replace(&mut self, entries: impl IntoIterator<Item = (f64, f64)>) {
        self.levels.clear();
        self.best_cache = None;
        for (price, size) in entries {
            if size > 0.0 {
                self.levels.insert(PriceKey(price), size);
            }
        }
    }

    /// Apply a single `(price, size)` update. `size == 0` removes the level.
    fn apply(&mut self, price: f64, size: f64) {
        if size == 0.0 {
            self.levels.remove(&PriceKey(price));
            if self.best_cache == Some(price) {
                self.best_cache = None;
            }
        } else {
            self.levels.insert(PriceKey(price), size);
            let improves = match self.best_cache {
                None => false,
                Some(cached) => {
                    if self.is_bid {
                        price > cached
                    } else {
                        price < cached
                    }
                }
            };
            if improves {
                self.best_cache = Some(price);
            }
        }
    }

    pub fn best(&mut self) -> Option<f64> {
        if let Some(cached) = self.best_cache {
            return Some(cached);
        }
        if self.levels.is_empty() {
            return None;
        }
        let best = if self.is_bid {
            *self.levels.keys().next_back().unwrap()
        } else {
            *self.levels.keys().next().unwrap()
        };
        self.best_cache = Some(best.0);
        Some(best.0)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn size_at(&self, price: f64) -> f64 {
        self.levels.get(&PriceKey(price)).copied().unwrap_or(0.0)
    }
}

pub struct Snapshot {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaSide {
    Buy,
    Sell,
}

/// One `price_changes[]` entry from a `price_change` frame.
pub struct Delta {
    pub side: DeltaSide,
    pub price: f64,
    pub size: f64,
    /// Server-reported best bid/ask for this side, used for desync sampling.
    pub server_best: Option<f64>,
}

pub struct ShadowBook {
    pub bids: LocalBookSide,
    pub asks: LocalBookSide,
    pub last_trade_price: Option<f64>,
    pub last_update_time: Option<Instant>,
    pub asset_id: String,
}

impl ShadowBook {
    pub fn new(asset_id: String) -> Self {
        Self {
            bids: LocalBookSide::new(true),
            asks: LocalBookSide::new(false),
            last_trade_price: None,
            last_update_time: None,
            asset_id,
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        self.bids.replace(snapshot.bids);
        self.asks.replace(snapshot.asks);
        self.last_update_time = Some(Instant::now());
    }

    /// Returns `true` if a desync against the server's reported best was
    /// detected on this delta (sampled with probability `DESYNC_SAMPLE_RATE`).
    pub fn apply_delta(&mut self, delta: Delta) -> bool {
        let side = match delta.side {
            DeltaSide::Buy => &mut self.bids,
            DeltaSide::Sell => &mut self.asks,
        };
        side.apply(delta.price, delta.size);

        let mut desynced = false;
        if let Some(server_best) = delta.server_best {
            if rand::thread_rng().gen::<f64>() < DESYNC_SAMPLE_RATE {
                let local_best = side.best();
                desynced = match local_best {
                    None => true,
                    Some(b) => (b - server_best).abs() > EPSILON,
                };
            }
        }

        self.last_update_time = Some(Instant::now());
        desynced
    }

    pub fn get_best_bid(&mut self) -> Option<f64> {
        self.bids.best()
    }

    pub fn get_best_ask(&mut self) -> Option<f64> {
        self.asks.best()
    }

    pub fn get_mid_price(&mut self) -> Option<f64> {
        let bid = self.get_best_bid()?;
        let ask = self.get_best_ask()?;
        Some((bid + ask) / 2.0)
    }

    /// Tolerant parser for the wire's `last_trade_price` string: empty or
    /// non-numeric becomes `None` rather than an error.
    pub fn set_last_trade_price(&mut self, raw: &str) {
        self.last_trade_price = parse_safe_float(raw);
    }
}

pub fn parse_safe_float(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}
