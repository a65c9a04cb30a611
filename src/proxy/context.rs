//! Per-request routing context.

use std::time::Instant;

use crate::catalog::ModelInfo;
use crate::providers::Endpoint;
use crate::storage::Account;

/// Everything one inbound call carries through routing. Never persisted.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub endpoint: Endpoint,
    pub model: ModelInfo,
    pub needs_vision: bool,
    pub needs_tools: bool,
    pub stream: bool,
    pub account: Account,
    /// Up-front price: the prompt cost for chat, the flat price otherwise.
    pub price: f64,
    /// Provider the caller asked for, honoured only at the pin tier.
    pub pin: Option<String>,
    pub started: Instant,
}

impl RequestContext {
    pub fn new(
        request_id: impl Into<String>,
        endpoint: Endpoint,
        model: ModelInfo,
        account: Account,
        price: f64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            endpoint,
            model,
            needs_vision: false,
            needs_tools: false,
            stream: false,
            account,
            price,
            pin: None,
            started: Instant::now(),
        }
    }

    /// Whether the prompt is charged before dispatch rather than on success.
    pub fn prepays(&self) -> bool {
        self.endpoint == Endpoint::ChatCompletions
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
