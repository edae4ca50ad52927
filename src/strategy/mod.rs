//! C3 — the bands strategy: decides which resting orders to cancel and
//! which new orders to place for a given target price.
//!
//! `bands` implements the per-band/per-token mechanics (margins, inclusion,
//! excessive-order sort order, virtual-band nudging). This module adds the
//! top-level dispatch across `active_tokens` described in spec §4.3's
//! contract `(orders, balances, target_price, active_tokens, vanilla_mode)
//! -> (orders_to_cancel, orders_to_place)`, and the locked-balance pass
//! before placement sizing — grounded in
//! `examples/original_source/poly_market_maker/strategies/bands_strategy.py`'s
//! `get_orders` loop over `active_tokens` and its
//! `balance_locked_by_open_buys`/`balance_locked_by_open_sells` subtraction.

pub mod bands;

pub use bands::{Band, BandSpec, Bands, BandsConfig, BandsError};

use std::collections::HashSet;

use crate::order::{Order, Side};
use crate::token::{Balances, Token};

/// `{A: price_A, B: price_B}` as passed to the strategy per spec §4.5's
/// price-derivation step.
#[derive(Debug, Clone, Copy)]
pub struct TargetPrices {
    pub a: f64,
    pub b: f64,
}

impl TargetPrices {
    pub fn get(&self, token: Token) -> f64 {
        match token {
            Token::A => self.a,
            Token::B => self.b,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub to_cancel: Vec<Order>,
    pub to_place: Vec<Order>,
}

/// Pure function: given the keeper's current orders and balances, decide
/// what to cancel and what to place. `target_price = None` means the
/// ShadowBook mid is unavailable; per spec this cancels every order and
/// places nothing.
pub fn decide(
    config: &mut BandsConfig,
    orders: &[Order],
    balances: Balances,
    target_price: Option<TargetPrices>,
) -> Decision {
    let vanilla = config.vanilla_mode;

    let target_price = match target_price {
        None => return Decision { to_cancel: orders.to_vec(), to_place: Vec::new() },
        Some(t) => t,
    };

    let active_tokens: Vec<Token> = config
        .active_tokens
        .iter()
        .filter_map(|s| match s.as_str() {
            "A" => Some(Token::A),
            "B" => Some(Token::B),
            _ => None,
        })
        .collect();

    let mut to_cancel = Vec::new();
    let mut seen_cancel_ids: HashSet<String> = HashSet::new();

    for &buy_token in &active_tokens {
        let sell_token = if vanilla { buy_token } else { buy_token.complement() };
        let t = target_price.get(buy_token);

        // This token's relevant orders: BUYs on buy_token, SELLs on sell_token
        // (the complementary outcome in arbitrage mode, the same one in
        // vanilla mode) — spec §4.3 "for each tradable token".
        let relevant: Vec<Order> = orders
            .iter()
            .filter(|o| {
                (o.side == Side::Buy && o.token == buy_token)
                    || (o.side == Side::Sell && o.token == sell_token)
            })
            .cloned()
            .collect();

        for cancelled in config.bands.cancellable_orders(&relevant, Some(t), vanilla) {
            if seen_cancel_ids.insert(bands::order_identity(&cancelled)) {
                to_cancel.push(cancelled);
            }
        }
    }

    // Orders that remain resting (i.e. not in to_cancel) still lock funds on
    // the exchange: a resting BUY locks collateral, a resting SELL locks the
    // token it offers. `bands_strategy.py::get_orders` subtracts these
    // locked amounts from the raw balances before sizing new placements, so
    // this pass must run before the placement loop below -- otherwise
    // collateral/tokens already committed to a still-open order would be
    // counted as free and double-spent on a new order this tick.
    let open_orders: Vec<&Order> = orders
        .iter()
        .filter(|o| !seen_cancel_ids.contains(&bands::order_identity(o)))
        .collect();

    let locked_by_buys: f64 =
        open_orders.iter().filter(|o| o.side == Side::Buy).map(|o| o.size * o.price).sum();

    let mut free_collateral = balances.collateral.unwrap_or(0.0) - locked_by_buys;
    let mut free_token_a = balances.token_a.unwrap_or(0.0);
    let mut free_token_b = balances.token_b.unwrap_or(0.0);

    let mut to_place = Vec::new();

    for &buy_token in &active_tokens {
        let sell_token = if vanilla { buy_token } else { buy_token.complement() };
        let t = target_price.get(buy_token);

        let relevant: Vec<Order> = orders
            .iter()
            .filter(|o| {
                (o.side == Side::Buy && o.token == buy_token)
                    || (o.side == Side::Sell && o.token == sell_token)
            })
            .cloned()
            .collect();

        let locked_by_sells: f64 = open_orders
            .iter()
            .filter(|o| o.side == Side::Sell && o.token == sell_token)
            .map(|o| o.size)
            .sum();
        match sell_token {
            Token::A => free_token_a -= locked_by_sells,
            Token::B => free_token_b -= locked_by_sells,
        }

        let sell_token_balance = match sell_token {
            Token::A => free_token_a,
            Token::B => free_token_b,
        };
        let placements =
            config.bands.new_orders(&relevant, free_collateral, sell_token_balance, t, buy_token, vanilla);

        for order in &placements {
            match order.side {
                Side::Buy => free_collateral -= order.size * order.price,
                Side::Sell => match sell_token {
                    Token::A => free_token_a -= order.size,
                    Token::B => free_token_b -= order.size,
                },
            }
        }
        to_place.extend(placements);
    }

    Decision { to_cancel, to_place }
}
