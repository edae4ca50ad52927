/// Smallest price increment the exchange accepts.
pub const MIN_TICK: f64 = 0.01;

/// Smallest order size the exchange accepts.
pub const MIN_SIZE: f64 = 5.0;

/// Price rounding precision used throughout the strategy.
pub const MAX_DECIMALS: u32 = 4;

/// Desync tolerance: how far the locally-tracked best bid/ask may drift
/// from the server-reported value before `ShadowBook::apply_delta` flags it.
pub const EPSILON: f64 = 0.001;

/// Probability that any given delta is sampled for a desync check.
pub const DESYNC_SAMPLE_RATE: f64 = 0.01;

pub fn round_dp(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
