//! Environment-driven configuration, in the teacher's
//! `std::env::var(...).unwrap_or_else(...)` idiom (no CLI-parsing crate —
//! matching the teacher's own dependency set).

use std::time::Duration;

/// Top-level keeper configuration loaded once at process start.
#[derive(Clone)]
pub struct Config {
    /// Market-data WebSocket URL (spec §6).
    pub market_ws_url: String,
    /// The binary market's condition id — resolves to `token_id_a`/`token_id_b`.
    pub condition_id: String,
    pub token_id_a: String,
    pub token_id_b: String,

    /// Path to the bands strategy JSON config (spec §6's configuration surface).
    pub bands_config_path: String,

    /// C4 anti-entropy reconcile period.
    pub refresh_frequency: Duration,
    /// Bounded place/cancel worker pool size (default 5, per spec §5).
    pub max_workers: usize,
    /// Minimum inter-invocation gap on the sync callback.
    pub debounce_ms: u64,

    /// When true, orders are routed through `DryRunExchange` instead of a
    /// live CLOB connection.
    pub dry_run: bool,

    /// Private key / funder address for the live exchange client. Unused
    /// in dry-run mode. On-chain signing itself is out of scope (spec §1).
    pub rpc_url: String,
    pub private_key: Option<String>,
    pub funder_address: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            market_ws_url: std::env::var("POLYMARKET_CLOB_WS")
                .unwrap_or_else(|_| "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()),
            condition_id: std::env::var("CONDITION_ID").unwrap_or_default(),
            token_id_a: std::env::var("TOKEN_ID_A").unwrap_or_default(),
            token_id_b: std::env::var("TOKEN_ID_B").unwrap_or_default(),
            bands_config_path: std::env::var("BANDS_CONFIG_PATH")
                .unwrap_or_else(|_| "bands.json".to_string()),
            refresh_frequency: Duration::from_secs(
                std::env::var("REFRESH_FREQUENCY_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            max_workers: std::env::var("MAX_WORKERS").ok().and_then(|s| s.parse().ok()).unwrap_or(5),
            debounce_ms: std::env::var("DEBOUNCE_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(200),
            dry_run: std::env::var("DRY_RUN")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            rpc_url: std::env::var("RPC_URL").unwrap_or_else(|_| "https://polygon-rpc.com".to_string()),
            private_key: std::env::var("PRIVATE_KEY").ok(),
            funder_address: std::env::var("FUNDER_ADDRESS").ok(),
        }
    }
}
