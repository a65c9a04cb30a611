//! Prepaid credit ledger.
//!
//! - [`ledger`]: pricing, debits and refunds against persisted balances
//! - [`replenish`]: the background task granting daily credits per tier

pub mod ledger;
pub mod replenish;

pub use ledger::{request_price, Ledger};
pub use replenish::{sweep_once, CreditsService, SweepReport};
