//! Status-aware outbound relay.
//!
//! A streamed response cannot change its status once the first byte is
//! written. The relay therefore reads one item ahead before committing
//! headers: an error first becomes a plain JSON error response with that
//! error's status, data first becomes a `200 text/event-stream` response.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::error_body;

/// Message sent when a stream ends before producing anything.
pub const EMPTY_STREAM_MESSAGE: &str =
    "The streaming response was empty, hence why this error was raised. Try again later.";

/// One item of a relayed stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// Bytes to forward verbatim.
    Data(Bytes),
    /// Ends the stream with an error.
    TerminalError { status: StatusCode, body: Bytes },
    /// Normal end of stream.
    End,
}

impl StreamItem {
    /// Classify a `(chunk, status)` pair: 2xx is data, anything else an error.
    pub fn from_pair(chunk: Bytes, status: StatusCode) -> Self {
        if status.is_success() {
            StreamItem::Data(chunk)
        } else {
            StreamItem::TerminalError {
                status,
                body: chunk,
            }
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, StreamItem::Data(_))
    }
}

/// Boxed source of stream items.
pub type ItemStream = Pin<Box<dyn Stream<Item = StreamItem> + Send>>;

/// What an attempt produced: a finished response or a stream still being read.
pub enum GatewayResponse {
    Complete(Response),
    Stream(ItemStream),
}

impl std::fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayResponse::Complete(r) => f.debug_tuple("Complete").field(&r.status()).finish(),
            GatewayResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl GatewayResponse {
    /// Turn into the outgoing response. Streams go through the relay.
    pub async fn into_http(self) -> (Response, Option<RelayHandle>) {
        match self {
            GatewayResponse::Complete(response) => (response, None),
            GatewayResponse::Stream(items) => {
                let (response, handle) = into_status_response(items).await;
                (response, Some(handle))
            }
        }
    }
}

#[derive(Debug, Default)]
struct RelayState {
    final_status: Option<StatusCode>,
    chunks_sent: usize,
    finished: bool,
    client_disconnected: bool,
}

/// Observer for a relayed response.
#[derive(Debug, Clone, Default)]
pub struct RelayHandle {
    state: Arc<Mutex<RelayState>>,
    closed: CancellationToken,
}

impl RelayHandle {
    fn update(&self, f: impl FnOnce(&mut RelayState)) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state);
        if state.finished || state.client_disconnected {
            self.closed.cancel();
        }
    }

    fn read<T>(&self, f: impl FnOnce(&RelayState) -> T) -> T {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    /// Resolves once the body ran to its end or the client went away.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Status the response ended with: the terminating error's, or the
    /// status committed with the headers.
    pub fn final_status(&self) -> Option<StatusCode> {
        self.read(|s| s.final_status)
    }

    pub fn chunks_sent(&self) -> usize {
        self.read(|s| s.chunks_sent)
    }

    /// Whether the body ran to its end.
    pub fn is_finished(&self) -> bool {
        self.read(|s| s.finished)
    }

    /// Whether the client went away before the body ended.
    pub fn client_disconnected(&self) -> bool {
        self.read(|s| s.client_disconnected)
    }
}

/// Marks the relay as disconnected if the body is dropped before it finished.
struct DisconnectGuard {
    handle: RelayHandle,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let mut disconnected = false;
        self.handle.update(|s| {
            if !s.finished {
                s.client_disconnected = true;
                disconnected = true;
            }
        });
        if disconnected {
            tracing::info!(
                chunks_sent = self.handle.chunks_sent(),
                "Client disconnected mid-stream"
            );
        }
    }
}

fn json_response(status: StatusCode, body: impl Into<Body>) -> Response {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Commit a status from the first item, then stream the rest.
pub async fn into_status_response(mut items: ItemStream) -> (Response, RelayHandle) {
    let handle = RelayHandle::default();

    let first = match items.next().await {
        Some(StreamItem::Data(bytes)) => bytes,
        Some(StreamItem::TerminalError { status, body }) => {
            handle.update(|s| {
                s.final_status = Some(status);
                s.chunks_sent = 1;
                s.finished = true;
            });
            return (json_response(status, body), handle);
        }
        Some(StreamItem::End) | None => {
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            let body = error_body(status, "invalid_response_error", EMPTY_STREAM_MESSAGE, None);
            handle.update(|s| {
                s.final_status = Some(status);
                s.chunks_sent = 1;
                s.finished = true;
            });
            tracing::warn!("Upstream stream ended before its first chunk");
            return (json_response(status, body.to_string()), handle);
        }
    };

    handle.update(|s| s.final_status = Some(StatusCode::OK));

    let guard = DisconnectGuard {
        handle: handle.clone(),
    };
    let body = async_stream::stream! {
        let guard = guard;

        yield Ok::<Bytes, Infallible>(first);
        guard.handle.update(|s| s.chunks_sent += 1);

        while let Some(item) = items.next().await {
            match item {
                StreamItem::Data(bytes) => {
                    yield Ok(bytes);
                    guard.handle.update(|s| s.chunks_sent += 1);
                }
                StreamItem::TerminalError { status, .. } => {
                    tracing::warn!(status = %status, "Stream terminated by upstream error");
                    guard.handle.update(|s| s.final_status = Some(status));
                    break;
                }
                StreamItem::End => break,
            }
        }

        guard.handle.update(|s| s.finished = true);
    };

    let response = (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response();

    (response, handle)
}
