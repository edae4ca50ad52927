//! C5 — the synchronization loop: one `synchronize()` call per debounced
//! market event, driving the cancel-tick / settle-tick / place-tick
//! discipline described in spec §4.5 and §5.
//!
//! Grounded in `examples/original_source/poly_market_maker/strategy.py`
//! (`synchronize`'s gate order: bootstrap, pending-cancel, order-book read,
//! price derivation) and teacher `engine/runner.rs` for the
//! `[TAG] message` logging idiom around a per-tick orchestration loop.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::constants::{round_dp, MAX_DECIMALS};
use crate::order_book_manager::OrderBookManager;
use crate::shadow_book::ShadowBook;
use crate::strategy::{self, BandsConfig, TargetPrices};

pub struct StrategyManager {
    shadow_book: Arc<std::sync::Mutex<ShadowBook>>,
    order_book_manager: Arc<OrderBookManager>,
    bands_config: Mutex<BandsConfig>,
}

impl StrategyManager {
    pub fn new(
        shadow_book: Arc<std::sync::Mutex<ShadowBook>>,
        order_book_manager: Arc<OrderBookManager>,
        bands_config: BandsConfig,
    ) -> Self {
        Self { shadow_book, order_book_manager, bands_config: Mutex::new(bands_config) }
    }

    /// Runs one synchronization tick. `price_override` lets callers (tests,
    /// or a future operator hook) force a target price instead of reading
    /// the ShadowBook mid.
    pub async fn synchronize(&self, price_override: Option<f64>) {
        // 1. Bootstrap gate: the market replica must have received at least
        //    one update before we act on it.
        {
            let book = self.shadow_book.lock().unwrap();
            if book.last_update_time.is_none() {
                return;
            }
        }

        // 2. Pending-cancel gate: funds locked by an order mid-cancellation
        //    must not be counted as free until the cancel is confirmed.
        if self.order_book_manager.has_pending_cancels().await {
            return;
        }

        // 3. Order-book read gate.
        let view = self.order_book_manager.get_order_book().await;
        if !view.balances.all_present() || view.balances.sum() == 0.0 {
            eprintln!("[SYNC] balances missing or zero, aborting tick");
            return;
        }

        // 4. Price derivation.
        let raw_price = match price_override {
            Some(p) => Some(p),
            None => self.shadow_book.lock().unwrap().get_mid_price(),
        };
        let price = match raw_price {
            Some(p) if p > 0.0 => p,
            Some(_) => {
                eprintln!("[SYNC] mid price <= 0, aborting tick");
                return;
            }
            None => {
                eprintln!("[SYNC] no mid price available yet, aborting tick");
                return;
            }
        };
        let price_a = round_dp(price, MAX_DECIMALS);
        let price_b = round_dp(1.0 - price_a, MAX_DECIMALS);
        let target = TargetPrices { a: price_a, b: price_b };

        let decision = {
            let mut config = self.bands_config.lock().await;
            strategy::decide(&mut config, &view.orders, view.balances, Some(target))
        };

        // Execution policy: cancel-then-place, never both on the same tick.
        if !decision.to_cancel.is_empty() {
            eprintln!("[SYNC] dispatching {} cancels", decision.to_cancel.len());
            self.order_book_manager.cancel_orders(decision.to_cancel).await;
            return;
        }
        if !decision.to_place.is_empty() {
            eprintln!("[SYNC] dispatching {} placements", decision.to_place.len());
            self.order_book_manager.place_orders(decision.to_place);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::DryRunExchange;
    use crate::metrics::NoopMetrics;
    use crate::order::{Order, Side};
    use crate::shadow_book::Snapshot;
    use crate::strategy::{Bands, BandSpec};
    use crate::token::{Balances, Token};
    use std::time::Duration;

    fn bands_config(tokens: &[&str]) -> BandsConfig {
        let bands = Bands::new(vec![BandSpec {
            min_margin: 0.0,
            avg_margin: 0.02,
            max_margin: 0.04,
            min_amount: 10.0,
            avg_amount: 50.0,
            max_amount: 100.0,
        }])
        .unwrap();
        BandsConfig { bands, active_tokens: tokens.iter().map(|s| s.to_string()).collect(), vanilla_mode: false }
    }

    fn manager_with_dryrun(balances: Balances) -> Arc<OrderBookManager> {
        OrderBookManager::new(
            Arc::new(DryRunExchange::new(balances)),
            5,
            Duration::from_secs(3600),
            Arc::new(NoopMetrics),
            None,
        )
    }

    /// Bootstrap gate: no ShadowBook update yet -> no dispatch at all.
    #[tokio::test]
    async fn bootstrap_gate_skips_tick_before_any_shadow_update() {
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-a".to_string())));
        let obm = manager_with_dryrun(Balances {
            collateral: Some(1_000.0),
            token_a: Some(0.0),
            token_b: Some(0.0),
        });
        let sm = StrategyManager::new(book, obm.clone(), bands_config(&["A"]));
        sm.synchronize(None).await;
        assert!(obm.get_order_book().await.orders.is_empty());
    }

    /// S4-style: a pending cancel must block the tick entirely.
    #[tokio::test]
    async fn pending_cancel_gate_skips_tick() {
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-a".to_string())));
        book.lock().unwrap().apply_snapshot(Snapshot {
            bids: vec![(0.48, 10.0)],
            asks: vec![(0.52, 10.0)],
        });
        let obm = manager_with_dryrun(Balances {
            collateral: Some(1_000.0),
            token_a: Some(1_000.0),
            token_b: Some(1_000.0),
        });
        let order = Order::new(Side::Sell, Token::B, 0.4, 10.0).with_id("o1".to_string());
        obm.cancel_orders(vec![order]).await;
        assert!(obm.has_pending_cancels().await);

        let sm = StrategyManager::new(book, obm.clone(), bands_config(&["A"]));
        sm.synchronize(None).await;
        // Nothing new should have been dispatched; the cancel above is the
        // only in-flight operation.
        assert!(obm.has_pending_cancels().await || obm.get_order_book().await.orders.is_empty());
    }

    /// Order-book read gate: zero-sum balances aborts the tick.
    #[tokio::test]
    async fn zero_balances_abort_tick() {
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-a".to_string())));
        book.lock().unwrap().apply_snapshot(Snapshot {
            bids: vec![(0.48, 10.0)],
            asks: vec![(0.52, 10.0)],
        });
        let obm =
            manager_with_dryrun(Balances { collateral: Some(0.0), token_a: Some(0.0), token_b: Some(0.0) });
        let sm = StrategyManager::new(book, obm.clone(), bands_config(&["A"]));
        sm.synchronize(None).await;
        assert!(obm.get_order_book().await.orders.is_empty());
    }

    /// A healthy tick with fresh balances and a usable mid price places
    /// orders (no existing resting orders, nothing to cancel).
    #[tokio::test]
    async fn healthy_tick_dispatches_placements() {
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-a".to_string())));
        book.lock().unwrap().apply_snapshot(Snapshot {
            bids: vec![(0.48, 10.0)],
            asks: vec![(0.52, 10.0)],
        });
        let obm = manager_with_dryrun(Balances {
            collateral: Some(1_000.0),
            token_a: Some(1_000.0),
            token_b: Some(1_000.0),
        });
        let sm = StrategyManager::new(book, obm.clone(), bands_config(&["A"]));
        sm.synchronize(None).await;

        for _ in 0..50 {
            if !obm.get_order_book().await.orders_being_placed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!obm.get_order_book().await.orders.is_empty());
    }

    /// A price override bypasses the ShadowBook mid entirely.
    #[tokio::test]
    async fn price_override_is_used_when_supplied() {
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-a".to_string())));
        book.lock().unwrap().apply_snapshot(Snapshot { bids: vec![(0.1, 10.0)], asks: vec![(0.9, 10.0)] });
        let obm = manager_with_dryrun(Balances {
            collateral: Some(1_000.0),
            token_a: Some(1_000.0),
            token_b: Some(1_000.0),
        });
        let sm = StrategyManager::new(book, obm.clone(), bands_config(&["A"]));
        // Mid would be 0.5 from the book; override to 0.5 explicitly too, but
        // the point is this path must not panic and must still dispatch.
        sm.synchronize(Some(0.5)).await;
        for _ in 0..50 {
            if !obm.get_order_book().await.orders_being_placed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!obm.get_order_book().await.orders.is_empty());
    }
}
