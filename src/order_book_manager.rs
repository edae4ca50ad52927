//! C4 — the keeper's local view of its own orders and balances, plus
//! asynchronous place/cancel dispatch and periodic anti-entropy reconcile.
//!
//! Grounded in `examples/original_source/poly_market_maker/orderbook.py`
//! (`OrderBookManager`: the `orders`/`balances` locked state, the
//! `ThreadPoolExecutor`-backed async place/cancel, the `_sync_loop` refresh
//! worker) and teacher `gateway/order.rs` for the bounded-worker-pool /
//! `tokio::spawn` idiom and `[GW]`-style log tags.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};

use crate::exchange::ExchangeOrders;
use crate::metrics::Metrics;
use crate::order::Order;
use crate::token::Balances;

/// Consistent, point-in-time read of the keeper's local order-book state,
/// per spec §4.4's `get_order_book()`.
#[derive(Clone, Debug, Default)]
pub struct OrderBookView {
    pub orders: Vec<Order>,
    pub balances: Balances,
    pub orders_being_placed: bool,
    pub orders_being_cancelled: bool,
}

struct Inner {
    orders: HashMap<String, Order>,
    balances: Balances,
    order_ids_cancelling: HashSet<String>,
}

/// `currently_placing_orders` lives outside the `Mutex` as its own atomic
/// since it is only ever incremented/decremented, never iterated alongside
/// the maps — mirrors the original's separate `AtomicInteger` field.
pub struct OrderBookManager {
    inner: Mutex<Inner>,
    currently_placing_orders: AtomicUsize,
    exchange: Arc<dyn ExchangeOrders>,
    worker_permits: Arc<Semaphore>,
    refresh_frequency: Duration,
    on_update: Option<Arc<dyn Fn() + Send + Sync>>,
    metrics: Arc<dyn Metrics>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl OrderBookManager {
    pub fn new(
        exchange: Arc<dyn ExchangeOrders>,
        max_workers: usize,
        refresh_frequency: Duration,
        metrics: Arc<dyn Metrics>,
        on_update: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                orders: HashMap::new(),
                balances: Balances::default(),
                order_ids_cancelling: HashSet::new(),
            }),
            currently_placing_orders: AtomicUsize::new(0),
            exchange,
            worker_permits: Arc::new(Semaphore::new(max_workers.max(1))),
            refresh_frequency,
            on_update,
            metrics,
            shutdown: Arc::new(tokio::sync::Notify::new()),
        })
    }

    fn fire_on_update(&self) {
        if let Some(cb) = &self.on_update {
            cb();
        }
    }

    pub async fn get_order_book(&self) -> OrderBookView {
        let inner = self.inner.lock().await;
        OrderBookView {
            orders: inner.orders.values().cloned().collect(),
            balances: inner.balances,
            orders_being_placed: self.currently_placing_orders.load(Ordering::SeqCst) > 0,
            orders_being_cancelled: !inner.order_ids_cancelling.is_empty(),
        }
    }

    pub async fn has_pending_cancels(&self) -> bool {
        !self.inner.lock().await.order_ids_cancelling.is_empty()
    }

    /// Dispatches one place task per order on the bounded worker pool.
    /// Returns immediately; does not wait for completion (spec §4.4
    /// "Placement does not block the caller").
    pub fn place_orders(self: &Arc<Self>, orders: Vec<Order>) {
        if orders.is_empty() {
            return;
        }
        self.currently_placing_orders.fetch_add(orders.len(), Ordering::SeqCst);
        self.fire_on_update();

        for order in orders {
            let manager = Arc::clone(self);
            let permits = Arc::clone(&manager.worker_permits);
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                match manager.exchange.place_order(order).await {
                    Ok(placed) => {
                        if let Some(id) = placed.id.clone() {
                            manager.inner.lock().await.orders.insert(id, placed.clone());
                            manager.metrics.inc_orders_placed(placed.token);
                        } else {
                            eprintln!("[OBM] place_order succeeded with no id, dropping");
                        }
                    }
                    Err(e) => {
                        eprintln!("[OBM] place_order failed: {}", e);
                    }
                }
                manager.currently_placing_orders.fetch_update(
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    |n| Some(n.saturating_sub(1)),
                ).ok();
                manager.fire_on_update();
            });
        }
    }

    /// Dispatches one cancel task per order. Marks each id as cancelling
    /// synchronously before returning so the next `has_pending_cancels()`
    /// read observes the interlock immediately (spec §4.5's pending-cancel
    /// gate relies on this happening before the caller's next tick).
    pub async fn cancel_orders(self: &Arc<Self>, orders: Vec<Order>) {
        if orders.is_empty() {
            return;
        }
        let ids: Vec<String> = orders.iter().filter_map(|o| o.id.clone()).collect();
        {
            let mut inner = self.inner.lock().await;
            for id in &ids {
                inner.order_ids_cancelling.insert(id.clone());
            }
        }
        self.fire_on_update();

        for order in orders {
            let manager = Arc::clone(self);
            let permits = Arc::clone(&manager.worker_permits);
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                let id = order.id.clone();
                match manager.exchange.cancel_order(&order).await {
                    Ok(true) => {
                        if let Some(id) = &id {
                            manager.inner.lock().await.orders.remove(id);
                            manager.metrics.inc_orders_cancelled(1);
                        }
                    }
                    Ok(false) => {
                        eprintln!("[OBM] cancel_order reported failure for {:?}", id);
                    }
                    Err(e) => {
                        eprintln!("[OBM] cancel_order errored for {:?}: {}", id, e);
                    }
                }
                if let Some(id) = id {
                    manager.inner.lock().await.order_ids_cancelling.remove(&id);
                }
                manager.fire_on_update();
            });
        }
    }

    /// Bulk cancel of a snapshot of currently-known orders.
    pub async fn cancel_all_orders(self: &Arc<Self>) {
        let snapshot: Vec<Order> = {
            let mut inner = self.inner.lock().await;
            let orders: Vec<Order> = inner.orders.values().cloned().collect();
            for order in &orders {
                if let Some(id) = &order.id {
                    inner.order_ids_cancelling.insert(id.clone());
                }
            }
            orders
        };
        if snapshot.is_empty() {
            return;
        }
        self.fire_on_update();

        let manager = Arc::clone(self);
        let permits = Arc::clone(&manager.worker_permits);
        let ids: Vec<String> = snapshot.iter().filter_map(|o| o.id.clone()).collect();
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            match manager.exchange.cancel_all_orders(&snapshot).await {
                Ok(true) => {
                    let mut inner = manager.inner.lock().await;
                    for id in &ids {
                        inner.orders.remove(id);
                    }
                    manager.metrics.inc_orders_cancelled(ids.len() as u64);
                }
                Ok(false) => eprintln!("[OBM] cancel_all_orders reported failure"),
                Err(e) => eprintln!("[OBM] cancel_all_orders errored: {}", e),
            }
            {
                let mut inner = manager.inner.lock().await;
                for id in &ids {
                    inner.order_ids_cancelling.remove(id);
                }
            }
            manager.fire_on_update();
        });
    }

    /// Starts the anti-entropy reconcile worker. Runs until `shutdown()`.
    pub fn spawn_reconcile_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.refresh_frequency);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.reconcile_once().await;
                    }
                    _ = manager.shutdown.notified() => {
                        eprintln!("[RECONCILE] shutdown requested, stopping reconcile loop");
                        return;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    async fn reconcile_once(&self) {
        let fetched_orders = self.exchange.get_orders().await;
        let fetched_balances = self.exchange.get_balances().await;

        let mut inner = self.inner.lock().await;

        match fetched_orders {
            Ok(orders) => {
                let mut replacement = HashMap::new();
                for order in orders {
                    let id = match &order.id {
                        Some(id) => id.clone(),
                        None => continue,
                    };
                    // Never resurrect an order whose cancellation is still
                    // in flight — spec §4.4 step 3.
                    if inner.order_ids_cancelling.contains(&id) {
                        continue;
                    }
                    replacement.insert(id, order);
                }
                inner.orders = replacement;
            }
            Err(e) => {
                eprintln!("[RECONCILE] get_orders failed: {}, keeping prior orders", e);
                self.metrics.inc_reconcile_failure("get_orders");
            }
        }

        match fetched_balances {
            Ok(balances) => inner.balances = balances,
            Err(e) => {
                eprintln!("[RECONCILE] get_balances failed: {}, retaining prior balances", e);
                self.metrics.inc_reconcile_failure("get_balances");
            }
        }

        drop(inner);
        self.fire_on_update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{DryRunExchange, ExchangeError};
    use crate::metrics::NoopMetrics;
    use crate::order::Side;
    use crate::token::Token;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    fn manager_with(exchange: Arc<dyn ExchangeOrders>) -> Arc<OrderBookManager> {
        OrderBookManager::new(exchange, 5, Duration::from_secs(3600), Arc::new(NoopMetrics), None)
    }

    #[tokio::test]
    async fn place_orders_inserts_on_success_and_clears_placing_counter() {
        let manager = manager_with(Arc::new(DryRunExchange::default()));
        manager.place_orders(vec![Order::new(Side::Buy, Token::A, 0.5, 10.0)]);

        // Give the spawned task a chance to run.
        for _ in 0..50 {
            if !manager.get_order_book().await.orders_being_placed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let view = manager.get_order_book().await;
        assert!(!view.orders_being_placed);
        assert_eq!(view.orders.len(), 1);
    }

    #[tokio::test]
    async fn cancel_orders_marks_cancelling_synchronously_before_task_runs() {
        let manager = manager_with(Arc::new(DryRunExchange::default()));
        let order = Order::new(Side::Sell, Token::B, 0.4, 10.0).with_id("o1".to_string());
        manager.cancel_orders(vec![order]).await;
        // The id is marked cancelling immediately upon return from
        // cancel_orders, even before the spawned task has had a chance to
        // run -- this is the interlock C5's pending-cancel gate relies on.
        assert!(manager.has_pending_cancels().await);
    }

    struct FlakyExchange {
        orders_fail: AtomicBool,
        balances_fail: AtomicBool,
    }

    #[async_trait]
    impl ExchangeOrders for FlakyExchange {
        async fn get_orders(&self) -> Result<Vec<Order>, ExchangeError> {
            if self.orders_fail.load(Ordering::SeqCst) {
                Err(ExchangeError("boom".to_string()))
            } else {
                Ok(vec![Order::new(Side::Buy, Token::A, 0.5, 10.0).with_id("O1".to_string())])
            }
        }
        async fn get_balances(&self) -> Result<Balances, ExchangeError> {
            if self.balances_fail.load(Ordering::SeqCst) {
                Err(ExchangeError("boom".to_string()))
            } else {
                Ok(Balances { collateral: Some(5.0), token_a: Some(0.0), token_b: Some(0.0) })
            }
        }
        async fn place_order(&self, order: Order) -> Result<Order, ExchangeError> {
            Ok(order.with_id("x".to_string()))
        }
        async fn cancel_order(&self, _order: &Order) -> Result<bool, ExchangeError> {
            Ok(true)
        }
        async fn cancel_all_orders(&self, _orders: &[Order]) -> Result<bool, ExchangeError> {
            Ok(true)
        }
    }

    /// S5: orders fetch succeeds, balances fetch fails -> orders replaced,
    /// balances retain prior value.
    #[tokio::test]
    async fn reconcile_keeps_stale_balances_on_fetch_failure() {
        let exchange =
            Arc::new(FlakyExchange { orders_fail: AtomicBool::new(false), balances_fail: AtomicBool::new(false) });
        let manager = manager_with(exchange.clone());
        manager.reconcile_once().await;
        let before = manager.get_order_book().await.balances;
        assert_eq!(before.collateral, Some(5.0));

        exchange.balances_fail.store(true, Ordering::SeqCst);
        manager.reconcile_once().await;
        let after = manager.get_order_book().await;
        assert_eq!(after.balances.collateral, Some(5.0), "balances must remain stale, not cleared");
        assert_eq!(after.orders.len(), 1, "orders fetch still succeeded and should replace");
    }

    #[tokio::test]
    async fn reconcile_skips_replacement_on_orders_fetch_failure() {
        let exchange =
            Arc::new(FlakyExchange { orders_fail: AtomicBool::new(false), balances_fail: AtomicBool::new(false) });
        let manager = manager_with(exchange.clone());
        manager.reconcile_once().await;
        assert_eq!(manager.get_order_book().await.orders.len(), 1);

        exchange.orders_fail.store(true, Ordering::SeqCst);
        manager.reconcile_once().await;
        assert_eq!(
            manager.get_order_book().await.orders.len(),
            1,
            "prior orders must survive a failed get_orders"
        );
    }

    /// Reconcile must never resurrect an order whose cancellation is in flight.
    #[tokio::test]
    async fn reconcile_does_not_resurrect_order_mid_cancel() {
        let exchange =
            Arc::new(FlakyExchange { orders_fail: AtomicBool::new(false), balances_fail: AtomicBool::new(false) });
        let manager = manager_with(exchange);
        {
            let mut inner = manager.inner.lock().await;
            inner.order_ids_cancelling.insert("O1".to_string());
        }
        manager.reconcile_once().await;
        let view = manager.get_order_book().await;
        assert!(view.orders.is_empty(), "O1 is mid-cancel and must not reappear");
    }
}
