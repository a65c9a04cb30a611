//! Call outcome feedback into provider health history.

use std::time::Instant;

use futures::StreamExt;
use sqlx::SqlitePool;

use super::relay::{ItemStream, StreamItem};
use crate::storage::{self, usage};

/// Writes one row-update per upstream call into `provider_usage`.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    db: SqlitePool,
}

impl MetricsRecorder {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Record a call in the current hour's slot.
    ///
    /// Failures never fail the request: they are logged and dropped.
    pub async fn record(&self, provider: &str, model: &str, latency_ms: i64, failed: bool) {
        self.record_at(storage::unix_now(), provider, model, latency_ms, failed)
            .await
    }

    /// Record a call as of `now` (unix seconds).
    pub async fn record_at(
        &self,
        now: i64,
        provider: &str,
        model: &str,
        latency_ms: i64,
        failed: bool,
    ) {
        let hour = storage::epoch_hour(now);
        if let Err(e) = usage::record_call(&self.db, provider, model, hour, latency_ms, failed).await
        {
            tracing::warn!(
                provider = %provider,
                model = %model,
                error = %e,
                "Failed to write provider usage"
            );
        }
    }

    /// Record a streamed call once its outcome is known.
    ///
    /// The stream fails if it errors at any point or ends before its first
    /// chunk. It succeeds on a normal end, or when the reader drops it after
    /// data was delivered. Latency is the time to the first chunk.
    pub fn observe_stream(
        &self,
        items: ItemStream,
        provider: String,
        model: String,
        started: Instant,
    ) -> ItemStream {
        let mut outcome = StreamOutcome {
            metrics: self.clone(),
            provider,
            model,
            first_chunk_ms: None,
            recorded: false,
        };
        let mut items = items;

        Box::pin(async_stream::stream! {
            while let Some(item) = items.next().await {
                match &item {
                    StreamItem::Data(_) => {
                        if outcome.first_chunk_ms.is_none() {
                            outcome.first_chunk_ms = Some(started.elapsed().as_millis() as i64);
                        }
                    }
                    StreamItem::TerminalError { .. } => outcome.finish(true).await,
                    StreamItem::End => {
                        let failed = outcome.first_chunk_ms.is_none();
                        outcome.finish(failed).await;
                    }
                }
                yield item;
            }
            let failed = outcome.first_chunk_ms.is_none();
            outcome.finish(failed).await;
        })
    }
}

/// Pending record for one streamed call.
struct StreamOutcome {
    metrics: MetricsRecorder,
    provider: String,
    model: String,
    first_chunk_ms: Option<i64>,
    recorded: bool,
}

impl StreamOutcome {
    async fn finish(&mut self, failed: bool) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let latency_ms = self.first_chunk_ms.unwrap_or(0);
        self.metrics
            .record(&self.provider, &self.model, latency_ms, failed)
            .await;
    }
}

impl Drop for StreamOutcome {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        // Dropped before the first chunk: the call was abandoned, not failed.
        let Some(latency_ms) = self.first_chunk_ms else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let metrics = self.metrics.clone();
        let provider = std::mem::take(&mut self.provider);
        let model = std::mem::take(&mut self.model);
        runtime.spawn(async move {
            metrics.record(&provider, &model, latency_ms, false).await;
        });
    }
}
