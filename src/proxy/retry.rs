//! Retry and failover across providers.
//!
//! This module encapsulates the failover loop:
//! - Up to `max_attempts` attempts per inbound request
//! - The first two attempts run on the initially selected provider
//! - From the third attempt on, the failing provider is excluded and the
//!   balancer picks a replacement; without one the original is retried
//! - Streaming attempts are judged by their first item, which is replayed
//!   untouched on success
//! - Header formatting for `x-switchyard-retries`

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;

use super::relay::{GatewayResponse, StreamItem};
use crate::error::{Error, Result};
use crate::providers::ProviderAdapter;

/// Record of a single failed attempt for building the `x-switchyard-retries` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub provider_name: String,
    pub status_code: u16,
}

/// Something an attempt can be sent to.
pub trait FailoverTarget {
    fn provider_name(&self) -> &str;
}

impl FailoverTarget for Arc<dyn ProviderAdapter> {
    fn provider_name(&self) -> &str {
        self.name()
    }
}

/// Outcome of the full retry+failover sequence.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// What the last attempt produced, unchanged.
    pub result: Result<GatewayResponse>,
    pub succeeded: bool,
    /// Target of the last attempt.
    pub target: T,
    /// Failed attempts, oldest first.
    pub attempts: Vec<AttemptRecord>,
    /// Providers excluded during this orchestration.
    pub excluded: BTreeSet<String>,
}

/// Format attempt records into the `x-switchyard-retries` header value.
///
/// Format: `"2/provider-alpha, 1/provider-beta"` -- count of failed attempts
/// per provider, preserving first-appearance order.
///
/// Returns `None` if the attempts slice is empty (no retries occurred).
pub fn format_retries_header(attempts: &[AttemptRecord]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    // Preserve order of first appearance
    let mut counts: Vec<(&str, u32)> = Vec::new();
    for attempt in attempts {
        if let Some(entry) = counts
            .iter_mut()
            .find(|(name, _)| *name == attempt.provider_name)
        {
            entry.1 += 1;
        } else {
            counts.push((&attempt.provider_name, 1));
        }
    }
    Some(
        counts
            .iter()
            .map(|(name, count)| format!("{}/{}", count, name))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Decide whether an attempt succeeded.
///
/// A stream is judged by its first item, which is put back in front of the
/// remainder so nothing is lost.
async fn settle(result: Result<GatewayResponse>) -> (bool, u16, Result<GatewayResponse>) {
    match result {
        Ok(GatewayResponse::Complete(response)) => {
            let status = response.status();
            (
                status.is_success(),
                status.as_u16(),
                Ok(GatewayResponse::Complete(response)),
            )
        }
        Ok(GatewayResponse::Stream(mut items)) => {
            let first = items.next().await;
            let (ok, status) = match &first {
                Some(StreamItem::Data(_)) => (true, 200),
                Some(StreamItem::TerminalError { status, .. }) => (false, status.as_u16()),
                Some(StreamItem::End) | None => (false, 500),
            };
            let replay = futures::stream::iter(first).chain(items);
            (ok, status, Ok(GatewayResponse::Stream(Box::pin(replay))))
        }
        Err(e) => {
            let status = match &e {
                Error::Upstream { status, .. } => *status,
                other => other.status().as_u16(),
            };
            (false, status, Err(e))
        }
    }
}

/// Run `call` until it succeeds or `max_attempts` is spent.
///
/// `reselect` receives the accumulated exclusions and returns a replacement
/// target, if any. With `allow_reselect` false (pinned requests) every
/// attempt goes to `initial`.
///
/// The orchestrator never makes up its own error: on exhaustion the last
/// attempt's result is returned as-is.
pub async fn retry_with_failover<T, C, CFut, S, SFut>(
    initial: T,
    max_attempts: u32,
    allow_reselect: bool,
    mut call: C,
    mut reselect: S,
) -> RetryOutcome<T>
where
    T: FailoverTarget + Clone,
    C: FnMut(T) -> CFut,
    CFut: Future<Output = Result<GatewayResponse>>,
    S: FnMut(BTreeSet<String>) -> SFut,
    SFut: Future<Output = Option<T>>,
{
    let mut target = initial.clone();
    let mut excluded = BTreeSet::new();
    let mut attempts = Vec::new();
    let mut last = None;

    for attempt in 0..max_attempts.max(1) {
        if attempt >= 2 && allow_reselect {
            excluded.insert(target.provider_name().to_string());
            target = match reselect(excluded.clone()).await {
                Some(next) => {
                    tracing::info!(
                        from = %target.provider_name(),
                        to = %next.provider_name(),
                        attempt = attempt,
                        "Failing over to another provider"
                    );
                    next
                }
                None => initial.clone(),
            };
        }

        let (ok, status, result) = settle(call(target.clone()).await).await;
        if ok {
            return RetryOutcome {
                result,
                succeeded: true,
                target,
                attempts,
                excluded,
            };
        }

        tracing::warn!(
            provider = %target.provider_name(),
            status = status,
            attempt = attempt,
            "Attempt failed"
        );
        attempts.push(AttemptRecord {
            provider_name: target.provider_name().to_string(),
            status_code: status,
        });
        last = Some(result);
    }

    RetryOutcome {
        result: last.unwrap_or_else(|| Err(Error::Internal("no attempt was made".to_string()))),
        succeeded: false,
        target,
        attempts,
        excluded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::relay::ItemStream;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use bytes::Bytes;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Named(&'static str);

    impl FailoverTarget for Named {
        fn provider_name(&self) -> &str {
            self.0
        }
    }

    fn status(code: StatusCode) -> Result<GatewayResponse> {
        Ok(GatewayResponse::Complete(code.into_response()))
    }

    fn status_of(result: &Result<GatewayResponse>) -> Option<StatusCode> {
        match result {
            Ok(GatewayResponse::Complete(r)) => Some(r.status()),
            _ => None,
        }
    }

    fn stream_of(items: Vec<StreamItem>) -> Result<GatewayResponse> {
        let stream: ItemStream = Box::pin(futures::stream::iter(items));
        Ok(GatewayResponse::Stream(stream))
    }

    #[test]
    fn test_format_retries_header_empty() {
        assert_eq!(format_retries_header(&[]), None);
    }

    #[test]
    fn test_format_retries_header_mixed_providers() {
        let record = |name: &str| AttemptRecord {
            provider_name: name.to_string(),
            status_code: 500,
        };
        let attempts = vec![record("alpha"), record("alpha"), record("beta")];
        assert_eq!(
            format_retries_header(&attempts),
            Some("2/alpha, 1/beta".to_string())
        );
    }

    #[tokio::test]
    async fn test_first_success_returns_immediately() {
        let calls = Mutex::new(Vec::new());
        let outcome = retry_with_failover(
            Named("alpha"),
            10,
            true,
            |t: Named| {
                calls.lock().unwrap().push(t.0);
                async { status(StatusCode::OK) }
            },
            |_| async { None },
        )
        .await;

        assert!(outcome.succeeded);
        assert!(outcome.attempts.is_empty());
        assert_eq!(*calls.lock().unwrap(), vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_fails_twice_then_moves_to_another_provider() {
        let calls = Mutex::new(Vec::new());
        let outcome = retry_with_failover(
            Named("alpha"),
            10,
            true,
            |t: Named| {
                calls.lock().unwrap().push(t.0);
                let code = if t.0 == "alpha" {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    StatusCode::OK
                };
                async move { status(code) }
            },
            |excluded: BTreeSet<String>| async move {
                assert!(excluded.contains("alpha"));
                Some(Named("beta"))
            },
        )
        .await;

        assert!(outcome.succeeded);
        assert_eq!(*calls.lock().unwrap(), vec!["alpha", "alpha", "beta"]);
        assert_eq!(outcome.target, Named("beta"));
        assert_eq!(
            format_retries_header(&outcome.attempts),
            Some("2/alpha".to_string())
        );
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_result_unchanged() {
        let count = Mutex::new(0u32);
        let outcome = retry_with_failover(
            Named("alpha"),
            4,
            true,
            |_t: Named| {
                let mut n = count.lock().unwrap();
                *n += 1;
                let code = if *n == 4 {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                async move { status(code) }
            },
            |_| async { None },
        )
        .await;

        assert!(!outcome.succeeded);
        assert_eq!(*count.lock().unwrap(), 4);
        assert_eq!(status_of(&outcome.result), Some(StatusCode::GATEWAY_TIMEOUT));
        // No replacement: stays on the original target
        assert_eq!(outcome.target, Named("alpha"));
        assert_eq!(outcome.attempts.len(), 4);
    }

    #[tokio::test]
    async fn test_errors_count_as_failed_attempts() {
        let outcome = retry_with_failover(
            Named("alpha"),
            3,
            true,
            |_t: Named| async { Err(Error::BadRequest("nope".to_string())) },
            |_| async { None },
        )
        .await;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.attempts[0].status_code, 400);
        assert!(matches!(outcome.result, Err(Error::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_pinned_never_reselects() {
        let reselected = Mutex::new(false);
        let outcome = retry_with_failover(
            Named("alpha"),
            5,
            false,
            |_t: Named| async { status(StatusCode::INTERNAL_SERVER_ERROR) },
            |_| {
                *reselected.lock().unwrap() = true;
                async { Some(Named("beta")) }
            },
        )
        .await;

        assert!(!*reselected.lock().unwrap());
        assert!(outcome.excluded.is_empty());
        assert_eq!(
            format_retries_header(&outcome.attempts),
            Some("5/alpha".to_string())
        );
    }

    #[tokio::test]
    async fn test_exclusions_accumulate() {
        let seen = Mutex::new(Vec::new());
        let outcome = retry_with_failover(
            Named("a"),
            5,
            true,
            |_t: Named| async { status(StatusCode::INTERNAL_SERVER_ERROR) },
            |excluded: BTreeSet<String>| {
                let next = match excluded.len() {
                    1 => Some(Named("b")),
                    2 => Some(Named("c")),
                    _ => None,
                };
                seen.lock().unwrap().push(excluded);
                async move { next }
            },
        )
        .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].len(), 3);
        assert_eq!(outcome.excluded.len(), 3);
        assert_eq!(
            format_retries_header(&outcome.attempts),
            // a, a, b, c, then back to a once nothing is left
            Some("3/a, 1/b, 1/c".to_string())
        );
    }

    #[tokio::test]
    async fn test_stream_judged_by_first_item_and_replayed() {
        let outcome = retry_with_failover(
            Named("alpha"),
            3,
            true,
            |_t: Named| async {
                stream_of(vec![
                    StreamItem::Data(Bytes::from_static(b"one")),
                    StreamItem::Data(Bytes::from_static(b"two")),
                    StreamItem::End,
                ])
            },
            |_| async { None },
        )
        .await;

        assert!(outcome.succeeded);
        let Ok(GatewayResponse::Stream(items)) = outcome.result else {
            panic!("expected a stream");
        };
        let all: Vec<StreamItem> = items.collect().await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], StreamItem::Data(Bytes::from_static(b"one")));
    }

    #[tokio::test]
    async fn test_stream_error_first_is_a_failure() {
        let outcome = retry_with_failover(
            Named("alpha"),
            2,
            true,
            |_t: Named| async {
                stream_of(vec![StreamItem::TerminalError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: Bytes::from_static(b"{}"),
                }])
            },
            |_| async { None },
        )
        .await;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.attempts[1].status_code, 503);

        // The failing stream is handed back intact for the relay to report
        let Ok(GatewayResponse::Stream(items)) = outcome.result else {
            panic!("expected a stream");
        };
        let (response, _) = crate::proxy::relay::into_status_response(items).await;
        let response: Response = response;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
