//! Upstream SSE relay.
//!
//! Provides [`SseLineBuffer`] for line-buffered reassembly of `data:` payloads
//! across TCP chunk boundaries, and [`relay_upstream`], which re-emits each
//! payload stamped with the provider id while metering output tokens.

use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;

use super::relay::{ItemStream, StreamItem};
use crate::credits::Ledger;
use crate::error::error_body;
use crate::tokens::TokenCounter;

/// Longest SSE line kept in the buffer. Longer lines are dropped whole.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// A complete `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseData {
    Payload(String),
    Done,
}

/// Reassembles SSE lines from raw chunks.
///
/// Tolerates `\r\n` endings and `data:` with or without a following space.
/// Non-data lines (`event:`, `id:`, comments) are ignored.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
    /// Set while skipping the rest of an oversized line.
    discarding: bool,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every payload completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseData> {
        let mut out = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }

            self.buffer.extend_from_slice(head);
            let line = std::mem::take(&mut self.buffer);
            if let Some(data) = parse_line(&line) {
                out.push(data);
            }
        }

        if !self.discarding {
            self.buffer.extend_from_slice(rest);
            if self.buffer.len() > MAX_LINE_BYTES {
                tracing::warn!(
                    buffered = self.buffer.len(),
                    "SSE line exceeded buffer cap, dropping it"
                );
                self.buffer.clear();
                self.discarding = true;
            }
        }

        out
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<SseData> {
        let line = std::mem::take(&mut self.buffer);
        self.discarding = false;
        parse_line(&line).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<SseData> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let data = line.strip_prefix(b"data:")?;
    let data = data.strip_prefix(b" ").unwrap_or(data);
    let text = std::str::from_utf8(data).ok()?.trim();

    match text {
        "" => None,
        "[DONE]" => Some(SseData::Done),
        _ => Some(SseData::Payload(text.to_string())),
    }
}

/// Concatenated `choices[].delta.content` of a chunk.
pub fn delta_content(chunk: &Value) -> String {
    chunk
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|c| c.get("delta")?.get("content")?.as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Charges the caller for streamed output as it is produced.
#[derive(Clone)]
pub struct StreamMeter {
    pub ledger: Ledger,
    pub account_key: String,
    pub multiplier: f64,
    pub tokens: Arc<TokenCounter>,
}

impl StreamMeter {
    async fn charge(&self, chunk: &Value) {
        let text = delta_content(chunk);
        if text.is_empty() {
            return;
        }
        let cost = self.tokens.count_text(&text) as f64 * self.multiplier;
        if let Err(e) = self.ledger.debit(&self.account_key, cost).await {
            tracing::error!(error = %e, "Failed to debit streamed output");
        }
    }
}

/// Relay an upstream SSE response as stream items.
///
/// Each payload gets `provider_id` added and is re-emitted as
/// `data: <json>\n\n`. After the upstream ends, `data: [DONE]\n\n` closes the
/// stream if anything was sent. Malformed payloads are skipped; a read error
/// ends the stream with a terminal error item.
pub fn relay_upstream(
    response: reqwest::Response,
    provider_id: String,
    meter: Option<StreamMeter>,
) -> ItemStream {
    let mut upstream = response.bytes_stream();

    Box::pin(async_stream::stream! {
        let mut lines = SseLineBuffer::new();
        let mut emitted = 0usize;

        loop {
            let (payloads, ended) = match upstream.next().await {
                Some(Ok(chunk)) => (lines.push(&chunk), false),
                Some(Err(e)) => {
                    tracing::warn!(provider_id = %provider_id, error = %e, "Upstream stream read failed");
                    let status = StatusCode::BAD_GATEWAY;
                    let body = error_body(
                        status,
                        "invalid_response_error",
                        "The provider stream was interrupted.",
                        Some(&provider_id),
                    );
                    yield StreamItem::TerminalError {
                        status,
                        body: Bytes::from(body.to_string()),
                    };
                    return;
                }
                None => (lines.finish(), true),
            };

            for data in payloads {
                let SseData::Payload(text) = data else {
                    continue;
                };
                let mut chunk: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(error = %e, "Skipping malformed SSE payload");
                        continue;
                    }
                };
                if let Some(obj) = chunk.as_object_mut() {
                    obj.insert("provider_id".to_string(), Value::String(provider_id.clone()));
                }
                if let Some(meter) = &meter {
                    meter.charge(&chunk).await;
                }
                emitted += 1;
                yield StreamItem::Data(Bytes::from(format!("data: {}\n\n", chunk)));
            }

            if ended {
                break;
            }
        }

        if emitted > 0 {
            yield StreamItem::Data(Bytes::from_static(b"data: [DONE]\n\n"));
        }
        yield StreamItem::End;
    })
}
