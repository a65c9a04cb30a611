//! HTTP proxy server module.
//!
//! This module provides the OpenAI-compatible HTTP API: admission, routing
//! with failover, the streaming relay and usage feedback.

pub mod admission;
pub mod context;
pub mod dispatch;
pub mod handlers;
pub mod metrics;
pub mod relay;
pub mod retry;
mod server;
pub mod stream;
pub mod types;

pub use context::RequestContext;
pub use metrics::MetricsRecorder;
pub use relay::{GatewayResponse, RelayHandle, StreamItem};
pub use retry::{format_retries_header, retry_with_failover, AttemptRecord, RetryOutcome};
pub use server::{create_router, request_id, run_server, AppState, RequestId, REQUEST_ID_HEADER};
pub use types::{ChatCompletionRequest, Message, MessageContent};
