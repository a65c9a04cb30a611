//! Router module for provider selection.
//!
//! This module handles selecting a provider for a request based on:
//! - Model availability and capability requirements
//! - Health over the trailing 24-hour window
//! - Weighted random choice so healthy providers share load

mod health;
mod selector;

pub use health::{health_score, NO_HISTORY_SCORE};
pub use selector::{weighted_choice, LoadBalancer};
