//! Provider health scoring.

use crate::storage::UsageTotals;

/// Score given to a provider with no requests in the window.
pub const NO_HISTORY_SCORE: f64 = 0.8;

/// Average latency at which the latency component reaches zero.
const LATENCY_CEILING_MS: f64 = 2000.0;

/// Health score in `[0, 1]` for one provider.
///
/// `window_requests` is the request count over all candidates for the model;
/// a provider carrying a large share of it is penalized so load spreads out.
///
/// Weights: 0.4 reliability, 0.3 latency, 0.3 usage share.
pub fn health_score(totals: Option<&UsageTotals>, window_requests: i64) -> f64 {
    let totals = match totals {
        Some(t) if t.requests > 0 => t,
        _ => return NO_HISTORY_SCORE,
    };

    let requests = totals.requests as f64;
    let failures = totals.failures.clamp(0, totals.requests) as f64;
    let reliability = (requests - failures) / requests;

    // Latency is only recorded for successful calls
    let successes = requests - failures;
    let latency_score = if successes > 0.0 {
        let avg_latency_ms = totals.latency_ms_total as f64 / successes;
        (1.0 - avg_latency_ms / LATENCY_CEILING_MS).max(0.0)
    } else {
        0.0
    };

    let usage_ratio = if window_requests > 0 {
        requests / window_requests as f64
    } else {
        0.0
    };
    let usage_penalty = (1.0 - usage_ratio).max(0.0);

    (0.4 * reliability + 0.3 * latency_score + 0.3 * usage_penalty).clamp(0.0, 1.0)
}
