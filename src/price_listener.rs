//! C2 — WebSocket market-data feed for a single asset id.
//!
//! Connects to the CLOB market WS, subscribes to one token, and on every
//! `book`/`price_change` frame updates the shared [`ShadowBook`] then fires
//! a debounced trigger to the sync loop. Grounded in teacher
//! `feeds/polymarket.rs` (connect/reconnect loop shape, `eprintln!`
//! logging, one worker per market-data connection) and
//! `examples/original_source/poly_market_maker/price_listener.py`
//! (message shapes, debounce semantics, fixed 5s reconnect backoff).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::metrics::Metrics;
use crate::shadow_book::{Delta, DeltaSide, ShadowBook, Snapshot};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Messages-received / reconnects / desyncs, surfaced for tests and callers
/// that want a cheap health check without scraping `Metrics`.
#[derive(Default, Debug, Clone, Copy)]
pub struct Stats {
    pub messages_received: u64,
    pub reconnects: u64,
    pub desyncs_observed: u64,
}

pub struct PriceListener {
    ws_url: String,
    condition_id: String,
    asset_id: String,
    debounce: Duration,
    running: Arc<AtomicBool>,
    messages_received: AtomicU64,
    reconnects: AtomicU64,
    desyncs_observed: AtomicU64,
}

impl PriceListener {
    pub fn new(ws_url: String, condition_id: String, asset_id: String, debounce_ms: u64) -> Self {
        Self {
            ws_url,
            condition_id,
            asset_id,
            debounce: Duration::from_millis(debounce_ms),
            running: Arc::new(AtomicBool::new(true)),
            messages_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            desyncs_observed: AtomicU64::new(0),
        }
    }

    /// Signals the background task to stop after its current message/sleep.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Point-in-time snapshot of this listener's counters.
    pub fn stats(&self) -> Stats {
        Stats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            desyncs_observed: self.desyncs_observed.load(Ordering::Relaxed),
        }
    }

    /// Runs the connect/subscribe/listen loop on the current task until
    /// `stop()` is called. `trigger` is a fire-and-forget handle to the sync
    /// loop (Design Notes §9: no back-reference to the caller).
    pub async fn run(
        &self,
        book: Arc<std::sync::Mutex<ShadowBook>>,
        trigger: mpsc::Sender<()>,
        metrics: Arc<dyn Metrics>,
    ) {
        let mut last_trigger = Instant::now() - self.debounce;
        let mut first_connection = true;

        while self.running.load(Ordering::SeqCst) {
            if !first_connection {
                self.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            first_connection = false;
            eprintln!("[PM] Connecting to {}", self.ws_url);

            let ws = match connect_async(&self.ws_url).await {
                Ok((ws, _)) => {
                    eprintln!("[PM] Connected, subscribing to {}", self.asset_id);
                    ws
                }
                Err(e) => {
                    eprintln!("[PM] Connection failed: {}, retrying in 5s", e);
                    metrics.inc_reconcile_failure("ws_connect");
                    self.sleep_respecting_stop(RECONNECT_DELAY).await;
                    continue;
                }
            };

            let (mut write, mut read) = ws.split();

            let sub = serde_json::json!({
                "type": "market",
                "assets_ids": [&self.asset_id],
            });
            if let Err(e) = write.send(Message::Text(sub.to_string())).await {
                eprintln!("[PM] Subscribe failed: {}, reconnecting", e);
                self.sleep_respecting_stop(RECONNECT_DELAY).await;
                continue;
            }

            loop {
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_message(&text, &book, &trigger, &metrics, &mut last_trigger)
                            .await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        eprintln!("[PM] WS error: {}, reconnecting", e);
                        break;
                    }
                    None => {
                        eprintln!("[PM] Connection closed, reconnecting");
                        break;
                    }
                }
            }

            eprintln!("[PM] Reconnecting in 5s");
            self.sleep_respecting_stop(RECONNECT_DELAY).await;
        }
        eprintln!("[PM] Listener stopped for {}", self.asset_id);
    }

    /// Sleeps for `dur`, but wakes early (in short slices) if `stop()` is
    /// called — the 5s backoff is cancellable per spec §4.2/§5.
    async fn sleep_respecting_stop(&self, dur: Duration) {
        let slice = Duration::from_millis(100);
        let mut remaining = dur;
        while remaining > Duration::ZERO && self.running.load(Ordering::SeqCst) {
            let step = remaining.min(slice);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }

    async fn handle_message(
        &self,
        text: &str,
        book: &Arc<std::sync::Mutex<ShadowBook>>,
        trigger: &mpsc::Sender<()>,
        metrics: &Arc<dyn Metrics>,
        last_trigger: &mut Instant,
    ) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };
        let frames: Vec<Value> = match value {
            Value::Array(items) => items,
            Value::Object(_) => vec![value],
            _ => return,
        };

        for frame in frames {
            self.handle_frame(&frame, book, trigger, metrics, last_trigger).await;
        }
    }

    async fn handle_frame(
        &self,
        frame: &Value,
        book: &Arc<std::sync::Mutex<ShadowBook>>,
        trigger: &mpsc::Sender<()>,
        metrics: &Arc<dyn Metrics>,
        last_trigger: &mut Instant,
    ) {
        let event_type = frame.get("event_type").and_then(Value::as_str).unwrap_or("");

        match event_type {
            "book" => {
                let market = frame.get("market").and_then(value_to_id_string).unwrap_or_default();
                let asset_id = frame.get("asset_id").and_then(value_to_id_string).unwrap_or_default();
                if market != self.condition_id || asset_id != self.asset_id {
                    return;
                }
                let bids = parse_levels(frame.get("bids"));
                let asks = parse_levels(frame.get("asks"));
                let last_trade = frame.get("last_trade_price").and_then(Value::as_str).unwrap_or("");
                {
                    let mut b = book.lock().unwrap();
                    b.set_last_trade_price(last_trade);
                    b.apply_snapshot(Snapshot { bids, asks });
                }
                self.maybe_trigger(trigger, last_trigger).await;
            }
            "price_change" => {
                let changes = match frame.get("price_changes").and_then(Value::as_array) {
                    Some(c) => c,
                    None => return,
                };
                let mut desync = false;
                {
                    let mut b = book.lock().unwrap();
                    for change in changes {
                        let asset_id =
                            change.get("asset_id").and_then(value_to_id_string).unwrap_or_default();
                        if asset_id != self.asset_id {
                            continue;
                        }
                        let side = match change.get("side").and_then(Value::as_str) {
                            Some("buy") => DeltaSide::Buy,
                            Some("sell") => DeltaSide::Sell,
                            _ => continue,
                        };
                        let price = match change.get("price").and_then(value_to_f64) {
                            Some(p) => p,
                            None => {
                                desync = true;
                                continue;
                            }
                        };
                        let size = match change.get("size").and_then(value_to_f64) {
                            Some(s) => s,
                            None => {
                                desync = true;
                                continue;
                            }
                        };
                        let server_best = match side {
                            DeltaSide::Buy => change.get("best_bid").and_then(value_to_f64),
                            DeltaSide::Sell => change.get("best_ask").and_then(value_to_f64),
                        };
                        desync |= b.apply_delta(Delta { side, price, size, server_best });
                    }
                }
                if desync {
                    metrics.inc_desync();
                    self.desyncs_observed.fetch_add(1, Ordering::Relaxed);
                }
                self.maybe_trigger(trigger, last_trigger).await;
            }
            _ => {
                eprintln!("[PM] Ignoring unknown WS event_type: {}", event_type);
            }
        }
    }

    async fn maybe_trigger(&self, trigger: &mpsc::Sender<()>, last_trigger: &mut Instant) {
        let now = Instant::now();
        if now.duration_since(*last_trigger) >= self.debounce {
            *last_trigger = now;
            let _ = trigger.send(()).await;
        }
    }
}

fn value_to_id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => crate::shadow_book::parse_safe_float(s),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_levels(v: Option<&Value>) -> Vec<(f64, f64)> {
    let arr = match v.and_then(Value::as_array) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|level| {
            let price = value_to_f64(level.get("price")?)?;
            let size = value_to_f64(level.get("size")?)?;
            Some((price, size))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;

    fn listener() -> PriceListener {
        PriceListener::new(
            "wss://example".to_string(),
            "cond-1".to_string(),
            "asset-1".to_string(),
            200,
        )
    }

    /// S1 (WS ingestion): a `book` frame for our market/asset updates the shadow book.
    #[tokio::test]
    async fn book_frame_updates_shadow_book_and_fires_trigger() {
        let pl = listener();
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-1".to_string())));
        let (tx, mut rx) = mpsc::channel(4);
        let metrics: Arc<dyn Metrics> = Arc::new(NoopMetrics);
        let mut last = Instant::now() - Duration::from_secs(1);

        let frame = serde_json::json!({
            "event_type": "book",
            "market": "cond-1",
            "asset_id": "asset-1",
            "bids": [{"price": "0.48", "size": "100"}, {"price": "0.49", "size": "50"}],
            "asks": [{"price": "0.51", "size": "80"}],
            "last_trade_price": "0.49",
        });

        pl.handle_frame(&frame, &book, &tx, &metrics, &mut last).await;

        let mut b = book.lock().unwrap();
        assert_eq!(b.get_best_bid(), Some(0.49));
        assert_eq!(b.get_best_ask(), Some(0.51));
        assert_eq!(b.last_trade_price, Some(0.49));
        drop(b);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn book_frame_for_other_market_is_ignored() {
        let pl = listener();
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-1".to_string())));
        let (tx, mut rx) = mpsc::channel(4);
        let metrics: Arc<dyn Metrics> = Arc::new(NoopMetrics);
        let mut last = Instant::now() - Duration::from_secs(1);

        let frame = serde_json::json!({
            "event_type": "book",
            "market": "cond-other",
            "asset_id": "asset-1",
            "bids": [], "asks": [],
        });
        pl.handle_frame(&frame, &book, &tx, &metrics, &mut last).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn book_frame_for_other_asset_is_ignored() {
        let pl = listener();
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-1".to_string())));
        let (tx, mut rx) = mpsc::channel(4);
        let metrics: Arc<dyn Metrics> = Arc::new(NoopMetrics);
        let mut last = Instant::now() - Duration::from_secs(1);

        let frame = serde_json::json!({
            "event_type": "book",
            "market": "cond-1",
            "asset_id": "asset-2",
            "bids": [], "asks": [],
        });
        pl.handle_frame(&frame, &book, &tx, &metrics, &mut last).await;
        assert!(rx.try_recv().is_err());
    }

    /// Debounce: a second update inside the debounce window does not re-fire.
    #[tokio::test]
    async fn debounce_suppresses_rapid_successive_triggers() {
        let pl = listener();
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-1".to_string())));
        let (tx, mut rx) = mpsc::channel(4);
        let metrics: Arc<dyn Metrics> = Arc::new(NoopMetrics);
        let mut last = Instant::now();

        let frame = serde_json::json!({
            "event_type": "price_change",
            "price_changes": [
                {"asset_id": "asset-1", "side": "buy", "price": "0.48", "size": "10", "best_bid": "0.48", "best_ask": "0.51"},
            ],
        });
        pl.handle_frame(&frame, &book, &tx, &metrics, &mut last).await;
        assert!(rx.try_recv().is_err(), "debounce window just started, should suppress");
    }

    #[tokio::test]
    async fn price_change_frame_updates_matching_side_only() {
        let pl = listener();
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-1".to_string())));
        let (tx, mut rx) = mpsc::channel(4);
        let metrics: Arc<dyn Metrics> = Arc::new(NoopMetrics);
        let mut last = Instant::now() - Duration::from_secs(1);

        let frame = serde_json::json!({
            "event_type": "price_change",
            "price_changes": [
                {"asset_id": "asset-1", "side": "buy", "price": "0.40", "size": "10", "best_bid": "0.40", "best_ask": "0.60"},
                {"asset_id": "asset-2", "side": "sell", "price": "0.99", "size": "5", "best_bid": "0.01", "best_ask": "0.99"},
            ],
        });
        pl.handle_frame(&frame, &book, &tx, &metrics, &mut last).await;

        let mut b = book.lock().unwrap();
        assert_eq!(b.get_best_bid(), Some(0.40));
        assert_eq!(b.get_best_ask(), None, "the other asset's delta must not leak in");
        drop(b);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn stop_flips_running_flag() {
        let pl = listener();
        assert!(pl.running.load(Ordering::SeqCst));
        pl.stop();
        assert!(!pl.running.load(Ordering::SeqCst));
    }

    /// `handle_message` (the per-WS-frame entry point) must count every
    /// inbound frame, regardless of how many events it unpacks to.
    #[tokio::test]
    async fn handle_message_counts_received_frames() {
        let pl = listener();
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-1".to_string())));
        let (tx, _rx) = mpsc::channel(4);
        let metrics: Arc<dyn Metrics> = Arc::new(NoopMetrics);
        let mut last = Instant::now() - Duration::from_secs(1);

        assert_eq!(pl.stats().messages_received, 0);
        let text = serde_json::json!([
            {"event_type": "book", "market": "cond-1", "asset_id": "asset-1", "bids": [], "asks": []},
        ])
        .to_string();
        pl.handle_message(&text, &book, &tx, &metrics, &mut last).await;
        assert_eq!(pl.stats().messages_received, 1);

        pl.handle_message("not json", &book, &tx, &metrics, &mut last).await;
        assert_eq!(pl.stats().messages_received, 2, "even an unparsable frame counts as received");
    }

    /// A sampled desync must be reflected in `stats()`, not just `Metrics`.
    #[tokio::test]
    async fn desync_is_reflected_in_stats() {
        let pl = listener();
        let book = Arc::new(std::sync::Mutex::new(ShadowBook::new("asset-1".to_string())));
        book.lock().unwrap().apply_snapshot(Snapshot { bids: vec![(0.48, 100.0)], asks: vec![] });
        let (tx, _rx) = mpsc::channel(4);
        let metrics: Arc<dyn Metrics> = Arc::new(NoopMetrics);
        let mut last = Instant::now() - Duration::from_secs(1);

        for _ in 0..5_000 {
            let frame = serde_json::json!({
                "event_type": "price_change",
                "price_changes": [
                    {"asset_id": "asset-1", "side": "buy", "price": "0.48", "size": "100", "best_bid": "0.60", "best_ask": "0.99"},
                ],
            });
            pl.handle_frame(&frame, &book, &tx, &metrics, &mut last).await;
            if pl.stats().desyncs_observed > 0 {
                break;
            }
        }
        assert!(pl.stats().desyncs_observed > 0, "expected at least one sampled desync over 5000 trials");
    }

    #[tokio::test]
    async fn reconnects_not_counted_until_a_second_connection_attempt() {
        let pl = listener();
        assert_eq!(pl.stats().reconnects, 0);
    }
}
