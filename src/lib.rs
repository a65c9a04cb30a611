//! switchyard - OpenAI-compatible gateway over many AI providers
//!
//! This library provides the core functionality for the switchyard gateway:
//! configuration, health-scored provider routing with failover, the
//! streaming relay, and the prepaid credit ledger.

pub mod catalog;
pub mod config;
pub mod credits;
pub mod error;
pub mod providers;
pub mod proxy;
pub mod router;
pub mod storage;
pub mod tokens;

pub use config::Config;
pub use error::{Error, Result};
