//! Virtual price bands around a target price, and the orders they imply.
//!
//! Grounded directly in
//! `examples/original_source/poly_market_maker/strategies/bands.py`: the
//! margin/amount band shape, the vanilla-vs-arbitrage sell-price mirroring,
//! the first/last/middle-band cancellation sort order, and the
//! virtual-band avg-margin nudge when `buy_price <= 0`.

use std::fmt;

use serde::Deserialize;

use crate::constants::{round_dp, MAX_DECIMALS, MIN_SIZE, MIN_TICK};
use crate::order::{Order, Side};
use crate::token::Token;

#[derive(Debug, Clone, PartialEq)]
pub struct BandsError(pub String);

impl fmt::Display for BandsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BandsError {}

/// Raw per-band config as parsed from JSON, in original field order.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BandSpec {
    pub min_margin: f64,
    pub avg_margin: f64,
    pub max_margin: f64,
    pub min_amount: f64,
    pub avg_amount: f64,
    pub max_amount: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Band {
    pub min_margin: f64,
    pub avg_margin: f64,
    pub max_margin: f64,
    pub min_amount: f64,
    pub avg_amount: f64,
    pub max_amount: f64,
}

impl Band {
    pub fn new(spec: BandSpec) -> Result<Self, BandsError> {
        if !(spec.min_amount >= 0.0 && spec.avg_amount >= 0.0 && spec.max_amount >= 0.0) {
            return Err(BandsError("band amounts must be non-negative".to_string()));
        }
        if !(spec.min_amount <= spec.avg_amount && spec.avg_amount <= spec.max_amount) {
            return Err(BandsError("band amounts must be ordered min <= avg <= max".to_string()));
        }
        if !(spec.min_margin <= spec.avg_margin && spec.avg_margin <= spec.max_margin) {
            return Err(BandsError("band margins must be ordered min <= avg <= max".to_string()));
        }
        if !(spec.min_margin < spec.max_margin) {
            return Err(BandsError("band min_margin must be strictly less than max_margin".to_string()));
        }
        Ok(Self {
            min_margin: spec.min_margin,
            avg_margin: spec.avg_margin,
            max_margin: spec.max_margin,
            min_amount: spec.min_amount,
            avg_amount: spec.avg_amount,
            max_amount: spec.max_amount,
        })
    }

    fn apply_margin(price: f64, margin: f64) -> f64 {
        round_dp(price - margin, MAX_DECIMALS)
    }

    pub fn min_price(&self, target_price: f64) -> f64 {
        Self::apply_margin(target_price, self.max_margin)
    }

    pub fn buy_price(&self, target_price: f64) -> f64 {
        Self::apply_margin(target_price, self.avg_margin)
    }

    pub fn sell_price(&self, target_price: f64) -> f64 {
        Self::apply_margin(1.0 - target_price, -self.avg_margin)
    }

    pub fn max_price(&self, target_price: f64) -> f64 {
        Self::apply_margin(target_price, self.min_margin)
    }

    /// True if `order` belongs to this band at `target_price`, mirroring a
    /// sell order onto the buy side's price axis first.
    pub fn includes(&self, order: &Order, target_price: f64, vanilla_mode: bool) -> bool {
        let price = match order.side {
            Side::Buy => order.price,
            Side::Sell => {
                if vanilla_mode {
                    round_dp(2.0 * target_price - order.price, MAX_DECIMALS)
                } else {
                    round_dp(1.0 - order.price, MAX_DECIMALS)
                }
            }
        };
        price > self.min_price(target_price) && price < self.max_price(target_price)
    }

    /// Orders that must be cancelled to bring this band's total size back
    /// under `max_amount`.
    pub fn excessive_orders<'a>(
        &self,
        orders: &'a [Order],
        target_price: f64,
        is_first_band: bool,
        is_last_band: bool,
        vanilla_mode: bool,
    ) -> Vec<&'a Order> {
        let mut in_band: Vec<&Order> = orders
            .iter()
            .filter(|o| self.includes(o, target_price, vanilla_mode))
            .collect();

        if is_first_band {
            in_band.sort_by(|a, b| {
                let da = (a.price - target_price).abs();
                let db = (b.price - target_price).abs();
                db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
            });
        } else if is_last_band {
            in_band.sort_by(|a, b| {
                let da = (a.price - target_price).abs();
                let db = (b.price - target_price).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            });
        } else {
            in_band.sort_by(|a, b| a.size.partial_cmp(&b.size).unwrap_or(std::cmp::Ordering::Equal));
        }

        let mut band_amount: f64 = in_band.iter().map(|o| o.size).sum();
        let mut to_cancel = Vec::new();
        while band_amount > self.max_amount {
            match in_band.pop() {
                Some(order) => {
                    band_amount -= order.size;
                    to_cancel.push(order);
                }
                None => break,
            }
        }
        to_cancel
    }
}

/// The set of configured bands plus the operations that turn them, a
/// target price and live orders into cancel/place decisions.
#[derive(Debug, Clone)]
pub struct Bands {
    bands: Vec<Band>,
}

impl Bands {
    pub fn new(specs: Vec<BandSpec>) -> Result<Self, BandsError> {
        let bands = specs.into_iter().map(Band::new).collect::<Result<Vec<_>, _>>()?;
        if Self::bands_overlap(&bands) {
            return Err(BandsError("bands in the config overlap".to_string()));
        }
        Ok(Self { bands })
    }

    fn bands_overlap(bands: &[Band]) -> bool {
        let overlaps = |a: &Band, b: &Band| a.min_margin < b.max_margin && b.min_margin < a.max_margin;
        bands
            .iter()
            .any(|b1| bands.iter().filter(|b2: &&Band| overlaps(b1, *b2)).count() > 1)
    }

    /// Bands usable at this target price: bands whose `max_price` would be
    /// non-positive are dropped; bands whose `buy_price` would be
    /// non-positive have their `avg_margin` nudged so the buy price stays
    /// just above zero — this mutates the stored band in place, matching
    /// the original's accumulate-over-calls behavior.
    fn calculate_virtual_bands(&mut self, target_price: f64) -> Vec<Band> {
        if target_price <= 0.0 {
            return Vec::new();
        }
        let mut virtual_bands = Vec::new();
        for band in self.bands.iter_mut() {
            if band.max_price(target_price) > 0.0 {
                if band.buy_price(target_price) <= 0.0 {
                    band.avg_margin = target_price - MIN_TICK;
                }
                virtual_bands.push(*band);
            }
        }
        virtual_bands
    }

    fn excessive_orders<'a>(
        orders: &'a [Order],
        bands: &[Band],
        target_price: f64,
        vanilla_mode: bool,
    ) -> Vec<&'a Order> {
        let mut out = Vec::new();
        for (i, band) in bands.iter().enumerate() {
            let is_first = i == 0;
            let is_last = i == bands.len() - 1;
            out.extend(band.excessive_orders(orders, target_price, is_first, is_last, vanilla_mode));
        }
        out
    }

    fn outside_any_band_orders<'a>(
        orders: &'a [Order],
        bands: &[Band],
        target_price: f64,
        vanilla_mode: bool,
    ) -> Vec<&'a Order> {
        orders
            .iter()
            .filter(|o| !bands.iter().any(|b| b.includes(o, target_price, vanilla_mode)))
            .collect()
    }

    /// Orders to cancel: all of them if no target price is available,
    /// otherwise the union of excessive-band and outside-any-band orders.
    pub fn cancellable_orders(
        &mut self,
        orders: &[Order],
        target_price: Option<f64>,
        vanilla_mode: bool,
    ) -> Vec<Order> {
        let target_price = match target_price {
            None => return orders.to_vec(),
            Some(p) => p,
        };
        let virtual_bands = self.calculate_virtual_bands(target_price);
        let mut refs = Self::excessive_orders(orders, &virtual_bands, target_price, vanilla_mode);
        refs.extend(Self::outside_any_band_orders(orders, &virtual_bands, target_price, vanilla_mode));
        let mut seen_ids = std::collections::HashSet::new();
        refs.into_iter()
            .filter(|o| seen_ids.insert(order_identity(o)))
            .cloned()
            .collect()
    }

    /// New sell/buy orders implied by bands that are currently below
    /// `min_amount`, decrementing the running balances as it goes.
    pub fn new_orders(
        &mut self,
        orders: &[Order],
        mut collateral_balance: f64,
        mut token_balance: f64,
        target_price: f64,
        buy_token: Token,
        vanilla_mode: bool,
    ) -> Vec<Order> {
        let sell_token = if vanilla_mode { buy_token } else { buy_token.complement() };
        let mut new_orders = Vec::new();

        for band in self.calculate_virtual_bands(target_price) {
            let mut band_amount: f64 = orders
                .iter()
                .filter(|o| band.includes(o, target_price, vanilla_mode))
                .map(|o| o.size)
                .sum();

            if band_amount < band.min_amount {
                let sell_price = if vanilla_mode {
                    let spread = target_price - band.buy_price(target_price);
                    target_price + spread
                } else {
                    band.sell_price(target_price)
                };
                let sell_size = round_dp((band.avg_amount - band_amount).min(token_balance), MAX_DECIMALS);
                if let Some(order) = new_order(sell_price, sell_size, Side::Sell, sell_token) {
                    band_amount += sell_size;
                    token_balance -= sell_size;
                    new_orders.push(order);
                }

                if band_amount < band.avg_amount {
                    let buy_price = band.buy_price(target_price);
                    let buy_size = round_dp(
                        (band.avg_amount - band_amount).min(collateral_balance / buy_price),
                        MAX_DECIMALS,
                    );
                    if let Some(order) = new_order(buy_price, buy_size, Side::Buy, buy_token) {
                        collateral_balance -= buy_size * buy_price;
                        new_orders.push(order);
                    }
                }
            }
        }
        new_orders
    }
}

fn new_order(price: f64, size: f64, side: Side, token: Token) -> Option<Order> {
    let order = Order::new(side, token, price, size);
    if order.is_valid(MIN_SIZE) {
        Some(order)
    } else {
        None
    }
}

/// Cheap identity for order dedup in `cancellable_orders`: the exchange id
/// when present, falling back to the (side, token, price, size) tuple for
/// orders not yet acknowledged by the exchange.
pub(crate) fn order_identity(o: &Order) -> String {
    match &o.id {
        Some(id) => id.clone(),
        None => format!("{:?}-{:?}-{}-{}", o.side, o.token, o.price, o.size),
    }
}

/// Full bands configuration as loaded from JSON:
/// `{"bands": [...], "active_tokens": [...], "vanilla_mode": bool}`.
#[derive(Debug, Deserialize)]
struct RawBandsConfig {
    bands: Vec<BandSpec>,
    active_tokens: Vec<String>,
    vanilla_mode: bool,
}

pub struct BandsConfig {
    pub bands: Bands,
    pub active_tokens: Vec<String>,
    pub vanilla_mode: bool,
}

impl BandsConfig {
    pub fn from_json(json: &str) -> Result<BandsConfig, BandsError> {
        let raw: RawBandsConfig =
            serde_json::from_str(json).map_err(|e| BandsError(format!("invalid bands config: {}", e)))?;
        let bands = Bands::new(raw.bands)?;
        Ok(BandsConfig { bands, active_tokens: raw.active_tokens, vanilla_mode: raw.vanilla_mode })
    }
}
