//! Process-wide observability sink.
//!
//! The original keeper exports Prometheus counters/histograms for every
//! chain/CLOB request, fill latency, and slippage (see
//! `examples/original_source/poly_market_maker/metrics.py`). A live HTTP
//! exporter is out of scope here (spec §1 Non-goals); instead components
//! take a `&dyn Metrics` so tests can assert on counts without standing up
//! a server, per Design Notes §9.

use std::sync::atomic::{AtomicU64, Ordering};

pub trait Metrics: Send + Sync {
    fn inc_orders_placed(&self, token: crate::token::Token) {
        let _ = token;
    }
    fn inc_orders_cancelled(&self, count: u64) {
        let _ = count;
    }
    fn inc_fills(&self, token: crate::token::Token) {
        let _ = token;
    }
    fn observe_clob_latency(&self, method: &'static str, secs: f64) {
        let _ = (method, secs);
    }
    fn inc_desync(&self) {}
    fn inc_reconcile_failure(&self, kind: &'static str) {
        let _ = kind;
    }
}

/// Default recorder: every observation is dropped. Used when the caller
/// doesn't care to wire up a real sink.
#[derive(Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Atomics-backed recorder for tests and for asserting behavior without a
/// live exporter.
#[derive(Default)]
pub struct InMemoryMetrics {
    pub orders_placed: AtomicU64,
    pub orders_cancelled: AtomicU64,
    pub fills: AtomicU64,
    pub desyncs: AtomicU64,
    pub reconcile_failures: AtomicU64,
}

impl Metrics for InMemoryMetrics {
    fn inc_orders_placed(&self, _token: crate::token::Token) {
        self.orders_placed.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_orders_cancelled(&self, count: u64) {
        self.orders_cancelled.fetch_add(count, Ordering::Relaxed);
    }

    fn inc_fills(&self, _token: crate::token::Token) {
        self.fills.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_desync(&self) {
        self.desyncs.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_reconcile_failure(&self, _kind: &'static str) {
        self.reconcile_failures.fetch_add(1, Ordering::Relaxed);
    }
}
