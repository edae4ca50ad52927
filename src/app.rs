//! Wiring: builds the five core components from a [`Config`] and runs the
//! keeper until shutdown. Mirrors teacher `main.rs`'s assembly style
//! (spawn per-component workers, channel them together, run until a
//! terminal signal) adapted to the five components named in spec §2.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::exchange::{ClobExchange, DryRunExchange, ExchangeOrders};
use crate::metrics::{Metrics, NoopMetrics};
use crate::order_book_manager::OrderBookManager;
use crate::price_listener::PriceListener;
use crate::shadow_book::ShadowBook;
use crate::strategy::BandsConfig;
use crate::strategy_manager::StrategyManager;

/// Default bands configuration used when `bands_config_path` cannot be
/// read, so a fresh checkout still boots in dry-run mode.
const FALLBACK_BANDS_JSON: &str = r#"{
    "bands": [
        {"min_margin": 0.0, "avg_margin": 0.02, "max_margin": 0.04,
         "min_amount": 10.0, "avg_amount": 50.0, "max_amount": 100.0}
    ],
    "active_tokens": ["A"],
    "vanilla_mode": false
}"#;

pub async fn run(config: Config) {
    eprintln!(
        "[APP] starting keeper | condition={} token_a={} token_b={} dry_run={}",
        config.condition_id, config.token_id_a, config.token_id_b, config.dry_run
    );

    let metrics: Arc<dyn Metrics> = Arc::new(NoopMetrics);

    let bands_config = load_bands_config(&config.bands_config_path);

    let exchange = build_exchange(&config).await;

    // The trigger channel is the message-sending handle Design Notes §9
    // calls for: PriceListener and the reconcile loop both hold a
    // fire-and-forget `Sender<()>` rather than a back-reference to
    // StrategyManager.
    let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(64);

    let reconcile_trigger = trigger_tx.clone();
    let on_update: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
        let _ = reconcile_trigger.try_send(());
    });

    let order_book_manager =
        OrderBookManager::new(exchange, config.max_workers, config.refresh_frequency, metrics.clone(), Some(on_update));
    let _reconcile_handle = order_book_manager.spawn_reconcile_loop();

    let shadow_book = Arc::new(std::sync::Mutex::new(ShadowBook::new(config.token_id_a.clone())));

    let strategy_manager =
        Arc::new(StrategyManager::new(shadow_book.clone(), order_book_manager.clone(), bands_config));

    let listener = Arc::new(PriceListener::new(
        config.market_ws_url.clone(),
        config.condition_id.clone(),
        config.token_id_a.clone(),
        config.debounce_ms,
    ));
    let listener_task = {
        let listener = Arc::clone(&listener);
        let book = Arc::clone(&shadow_book);
        let trigger = trigger_tx.clone();
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            listener.run(book, trigger, metrics).await;
        })
    };

    eprintln!("[APP] all components started, entering sync loop");

    loop {
        tokio::select! {
            maybe = trigger_rx.recv() => {
                match maybe {
                    Some(()) => strategy_manager.synchronize(None).await,
                    None => {
                        eprintln!("[APP] trigger channel closed, shutting down");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("[APP] ctrl-c received, shutting down");
                break;
            }
        }
    }

    listener.stop();
    eprintln!("[APP] cancelling all resting orders before exit");
    order_book_manager.cancel_all_orders().await;
    order_book_manager.shutdown();
    listener_task.abort();
}

fn load_bands_config(path: &str) -> BandsConfig {
    match std::fs::read_to_string(path) {
        Ok(json) => match BandsConfig::from_json(&json) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("[APP] invalid bands config at {}: {}, using fallback", path, e);
                BandsConfig::from_json(FALLBACK_BANDS_JSON).expect("fallback bands config is valid")
            }
        },
        Err(e) => {
            eprintln!("[APP] could not read bands config at {}: {}, using fallback", path, e);
            BandsConfig::from_json(FALLBACK_BANDS_JSON).expect("fallback bands config is valid")
        }
    }
}

async fn build_exchange(config: &Config) -> Arc<dyn ExchangeOrders> {
    if config.dry_run {
        eprintln!("[APP] DRY_RUN=true, using DryRunExchange");
        return Arc::new(DryRunExchange::default());
    }

    let private_key = match &config.private_key {
        Some(k) => k,
        None => {
            eprintln!("[APP] DRY_RUN=false but PRIVATE_KEY is unset, falling back to DryRunExchange");
            return Arc::new(DryRunExchange::default());
        }
    };

    match ClobExchange::connect(
        &config.rpc_url,
        private_key,
        config.funder_address.as_deref(),
        config.token_id_a.clone(),
        config.token_id_b.clone(),
    )
    .await
    {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("[APP] ClobExchange::connect failed: {}, falling back to DryRunExchange", e);
            Arc::new(DryRunExchange::default())
        }
    }
}
