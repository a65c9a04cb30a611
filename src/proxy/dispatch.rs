//! Routing one admitted request: provider selection, attempts, metering.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use super::context::RequestContext;
use super::relay::{GatewayResponse, RelayHandle};
use super::retry::{retry_with_failover, AttemptRecord};
use super::server::AppState;
use super::stream::{relay_upstream, StreamMeter};
use crate::config::ApiKey;
use crate::error::{Error, Result};
use crate::providers::{self, pool::disables_credential, Endpoint, ProviderAdapter, RequestBody, UpstreamRequest};

/// Longest upstream error body echoed into the logs.
const MAX_LOGGED_ERROR_BYTES: usize = 512;

/// Result of routing: the response to send plus what the handler reports.
#[derive(Debug)]
pub struct Routed {
    pub response: Response,
    /// Provider of the last attempt.
    pub provider: String,
    pub attempts: Vec<AttemptRecord>,
    pub relay: Option<RelayHandle>,
}

/// Pick the first target: the pinned provider when the tier allows it,
/// otherwise the balancer's choice.
///
/// Returns the adapter and whether it is pinned.
async fn initial_target(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<(Arc<dyn ProviderAdapter>, bool)> {
    if let Some(pin) = &ctx.pin {
        if ctx.account.tier >= state.config.routing.pin_tier {
            if let Some(row) = state.balancer.get_specific_provider(pin).await {
                if let Some(adapter) = state.registry.get(&row.name) {
                    tracing::debug!(provider = %row.name, "Using pinned provider");
                    return Ok((adapter, true));
                }
            }
            tracing::debug!(provider = %pin, "Pinned provider not found, selecting normally");
        } else {
            tracing::debug!(tier = ctx.account.tier, "Tier may not pin providers, ignoring");
        }
    }

    let row = state
        .balancer
        .get_best_provider(
            &ctx.model.id,
            ctx.needs_vision,
            ctx.needs_tools,
            &BTreeSet::new(),
        )
        .await
        .ok_or_else(|| Error::NoProvider {
            model: ctx.model.id.clone(),
        })?;

    let adapter = state
        .registry
        .get(&row.name)
        .ok_or_else(|| Error::Internal(format!("provider '{}' has no adapter", row.name)))?;
    Ok((adapter, false))
}

/// Route an admitted request and produce its response.
///
/// The chat prompt price is charged once before the first attempt and handed
/// back if no attempt succeeds.
pub async fn route(state: &AppState, ctx: &RequestContext, body: RequestBody) -> Result<Routed> {
    let (initial, pinned) = initial_target(state, ctx).await?;

    let key = ctx.account.key.as_str();
    if ctx.prepays() {
        state.ledger.debit(key, ctx.price).await?;
    }

    let body = &body;
    let outcome = retry_with_failover(
        initial,
        state.config.routing.max_attempts,
        !pinned,
        move |adapter: Arc<dyn ProviderAdapter>| attempt(state, ctx, adapter, body),
        move |excluded: BTreeSet<String>| async move {
            let row = state
                .balancer
                .get_best_provider(&ctx.model.id, ctx.needs_vision, ctx.needs_tools, &excluded)
                .await;
            row.and_then(|row| state.registry.get(&row.name))
        },
    )
    .await;

    if !outcome.succeeded {
        tracing::warn!(
            request_id = %ctx.request_id,
            model = %ctx.model.id,
            attempts = outcome.attempts.len(),
            "All attempts failed"
        );
        if ctx.prepays() {
            if let Err(e) = state.ledger.refund(key, ctx.price).await {
                tracing::error!(error = %e, "Failed to refund prompt debit");
            }
        }
    }

    let provider = outcome.target.name().to_string();
    let (response, relay) = match outcome.result {
        Ok(gateway) => gateway.into_http().await,
        Err(e) => (e.into_response(), None),
    };

    Ok(Routed {
        response,
        provider,
        attempts: outcome.attempts,
        relay,
    })
}

/// One attempt against one provider.
async fn attempt(
    state: &AppState,
    ctx: &RequestContext,
    adapter: Arc<dyn ProviderAdapter>,
    body: &RequestBody,
) -> Result<GatewayResponse> {
    let provider = adapter.name().to_string();
    let provider_id = adapter.provider_id().to_string();
    let model = ctx.model.id.as_str();

    let sub = state
        .sub_providers
        .get_available_provider(&provider, model)
        .await?
        .ok_or_else(|| Error::NoSubProvider {
            provider_id: provider_id.clone(),
            model: model.to_string(),
        })?;

    // Counted per pick, before the outcome is known.
    if let Err(e) = state.sub_providers.record_use(&sub.credential).await {
        tracing::warn!(provider = %provider, error = %e, "Failed to count credential use");
    }

    let request = UpstreamRequest {
        credential: ApiKey::from(sub.credential.clone()),
        organization: sub.organization.clone(),
        body: body.clone(),
        stream: ctx.stream,
    };

    let started = Instant::now();
    let response = match providers::dispatch(adapter.as_ref(), ctx.endpoint, &request).await {
        Ok(response) => response,
        Err(e) => {
            state.metrics.record(&provider, model, 0, true).await;
            return Err(e);
        }
    };
    let latency_ms = started.elapsed().as_millis() as i64;
    let status = response.status();

    if !status.is_success() {
        if disables_credential(status.as_u16()) {
            if let Err(e) = state.sub_providers.disable(&sub.credential).await {
                tracing::error!(provider = %provider, error = %e, "Failed to disable credential");
            }
        }
        state.metrics.record(&provider, model, latency_ms, true).await;

        let text = response.text().await.unwrap_or_default();
        let excerpt: String = text.chars().take(MAX_LOGGED_ERROR_BYTES).collect();
        tracing::warn!(
            provider = %provider,
            status = status.as_u16(),
            body = %excerpt,
            "Provider returned error"
        );
        return Err(Error::Upstream {
            provider,
            provider_id,
            status: status.as_u16(),
        });
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let key = ctx.account.key.as_str();

    if content_type.starts_with("text/event-stream") {
        let meter = (ctx.endpoint == Endpoint::ChatCompletions).then(|| StreamMeter {
            ledger: state.ledger.clone(),
            account_key: key.to_string(),
            multiplier: ctx.model.token_multiplier(),
            tokens: state.tokens.clone(),
        });
        // Outcome is recorded once the stream's first items are seen.
        let items = relay_upstream(response, provider_id, meter);
        return Ok(GatewayResponse::Stream(state.metrics.observe_stream(
            items,
            provider,
            model.to_string(),
            started,
        )));
    }

    if content_type.starts_with("application/json") {
        let mut json: Value = match response.json().await {
            Ok(json) => json,
            Err(e) => {
                state.metrics.record(&provider, model, latency_ms, true).await;
                return Err(e.into());
            }
        };
        state.metrics.record(&provider, model, latency_ms, false).await;
        if let Some(obj) = json.as_object_mut() {
            obj.insert("provider_id".to_string(), Value::String(provider_id));
        }

        let cost = if ctx.prepays() {
            completion_tokens(state, &json) as f64 * ctx.model.token_multiplier()
        } else {
            ctx.price
        };
        debit_logged(state, key, cost).await;

        return Ok(GatewayResponse::Complete(
            (StatusCode::OK, Json(json)).into_response(),
        ));
    }

    // Binary payloads such as synthesized audio pass through as-is.
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            state.metrics.record(&provider, model, latency_ms, true).await;
            return Err(e.into());
        }
    };
    state.metrics.record(&provider, model, latency_ms, false).await;
    if !ctx.prepays() {
        debit_logged(state, key, ctx.price).await;
    }
    let content_type = HeaderValue::from_str(&content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    Ok(GatewayResponse::Complete(
        (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], bytes).into_response(),
    ))
}

/// Completion tokens of a finished chat response.
///
/// Prefers the provider's own `usage.completion_tokens`, falling back to
/// counting the returned message text.
fn completion_tokens(state: &AppState, response: &Value) -> usize {
    if let Some(n) = response
        .get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_u64)
    {
        return n as usize;
    }

    response
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|c| c.get("message")?.get("content")?.as_str())
                .map(|text| state.tokens.count_text(text))
                .sum()
        })
        .unwrap_or(0)
}

async fn debit_logged(state: &AppState, key: &str, amount: f64) {
    if let Err(e) = state.ledger.debit(key, amount).await {
        tracing::error!(amount = amount, error = %e, "Failed to debit credits");
    }
}
