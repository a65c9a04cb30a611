//! HTTP request handlers.

use axum::{
    extract::{Extension, Multipart, State},
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};

use super::context::RequestContext;
use super::dispatch::{self, Routed};
use super::retry::format_retries_header;
use super::server::{AppState, RequestId};
use super::types::{ChatCompletionRequest, ModelRequest, SpeechRequest};
use crate::catalog::ModelInfo;
use crate::credits::ledger::ensure_affordable;
use crate::credits::request_price;
use crate::error::{Error, Result};
use crate::providers::{Endpoint, RequestBody};
use crate::storage::Account;

/// Response header: provider that handled the last attempt.
pub const SWITCHYARD_PROVIDER_HEADER: &str = "x-switchyard-provider";
/// Response header: failed attempts per provider, e.g. `2/alpha, 1/beta`.
pub const SWITCHYARD_RETRIES_HEADER: &str = "x-switchyard-retries";

/// Attach routing metadata headers to a response.
fn attach_switchyard_headers(response: &mut Response, provider: &str, retries: Option<String>) {
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(provider) {
        headers.insert(HeaderName::from_static(SWITCHYARD_PROVIDER_HEADER), value);
    }
    if let Some(value) = retries.and_then(|r| HeaderValue::from_str(&r).ok()) {
        headers.insert(HeaderName::from_static(SWITCHYARD_RETRIES_HEADER), value);
    }
}

/// Resolve the model for this caller and reject what they cannot afford.
fn admit_model(
    state: &AppState,
    account: &Account,
    model: &str,
    endpoint: Endpoint,
    voice: Option<&str>,
) -> Result<ModelInfo> {
    let info = state.catalog.check_access(
        model,
        endpoint,
        voice,
        account.tier,
        state.config.credits.premium_tier,
    )?;
    Ok(info.clone())
}

/// Route a priced request and decorate the result.
async fn forward(state: &AppState, ctx: RequestContext, body: RequestBody) -> Result<Response> {
    ensure_affordable(&ctx.account, ctx.price)?;

    tracing::info!(
        request_id = %ctx.request_id,
        endpoint = %ctx.endpoint,
        model = %ctx.model.id,
        stream = ctx.stream,
        price = ctx.price,
        "Routing request"
    );

    let Routed {
        mut response,
        provider,
        attempts,
        relay,
    } = dispatch::route(state, &ctx, body).await?;

    attach_switchyard_headers(&mut response, &provider, format_retries_header(&attempts));

    let retries = attempts.len();
    match relay {
        // A committed stream is only done once its body is.
        Some(relay) if response.status().is_success() => {
            let request_id = ctx.request_id.clone();
            let started = ctx.started;
            tokio::spawn(async move {
                relay.closed().await;
                let status = relay.final_status().map(|s| s.as_u16()).unwrap_or(200);
                tracing::info!(
                    request_id = %request_id,
                    provider = %provider,
                    status = status,
                    retries = retries,
                    chunks = relay.chunks_sent(),
                    client_disconnected = relay.client_disconnected(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Stream completed"
                );
            });
        }
        _ => {
            tracing::info!(
                request_id = %ctx.request_id,
                provider = %provider,
                status = response.status().as_u16(),
                retries = retries,
                latency_ms = ctx.elapsed_ms(),
                "Request completed"
            );
        }
    }
    Ok(response)
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(account): Extension<Account>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response> {
    let endpoint = Endpoint::ChatCompletions;
    let info = admit_model(&state, &account, &request.model, endpoint, None)?;

    let prompt_tokens = state.tokens.count_messages(&request.messages);
    let price = request_price(&info, endpoint, prompt_tokens, 0);

    let mut ctx = RequestContext::new(request_id.0, endpoint, info, account, price);
    ctx.needs_vision = request.needs_vision();
    ctx.needs_tools = request.needs_tools();
    ctx.stream = request.is_streaming();
    ctx.pin = request.provider_name.clone();

    let payload = request
        .to_payload()
        .map_err(|e| Error::BadRequest(e.to_string()))?;
    forward(&state, ctx, RequestBody::Json(payload)).await
}

/// Shared body of the JSON endpoints priced per call.
async fn flat_json(
    state: AppState,
    request_id: RequestId,
    account: Account,
    endpoint: Endpoint,
    request: ModelRequest,
) -> Result<Response> {
    let info = admit_model(&state, &account, &request.model, endpoint, None)?;
    let price = request_price(&info, endpoint, 0, 0);
    let ctx = RequestContext::new(request_id.0, endpoint, info, account, price);

    let payload = serde_json::to_value(&request).map_err(|e| Error::BadRequest(e.to_string()))?;
    forward(&state, ctx, RequestBody::Json(payload)).await
}

/// Handle POST /v1/embeddings
pub async fn embeddings(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(account): Extension<Account>,
    Json(request): Json<ModelRequest>,
) -> Result<Response> {
    flat_json(state, request_id, account, Endpoint::Embeddings, request).await
}

/// Handle POST /v1/moderations
pub async fn moderations(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(account): Extension<Account>,
    Json(request): Json<ModelRequest>,
) -> Result<Response> {
    flat_json(state, request_id, account, Endpoint::Moderations, request).await
}

/// Handle POST /v1/images/generations
pub async fn images_generations(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(account): Extension<Account>,
    Json(request): Json<ModelRequest>,
) -> Result<Response> {
    flat_json(state, request_id, account, Endpoint::ImagesGenerations, request).await
}

/// Handle POST /v1/text/translations
pub async fn text_translations(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(account): Extension<Account>,
    Json(request): Json<ModelRequest>,
) -> Result<Response> {
    flat_json(state, request_id, account, Endpoint::TextTranslations, request).await
}

/// Handle POST /v1/audio/speech
pub async fn audio_speech(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(account): Extension<Account>,
    Json(request): Json<SpeechRequest>,
) -> Result<Response> {
    let endpoint = Endpoint::AudioSpeech;
    let info = admit_model(
        &state,
        &account,
        &request.model,
        endpoint,
        request.voice.as_deref(),
    )?;
    let price = request_price(&info, endpoint, 0, request.input.chars().count());
    let ctx = RequestContext::new(request_id.0, endpoint, info, account, price);

    let payload = serde_json::to_value(&request).map_err(|e| Error::BadRequest(e.to_string()))?;
    forward(&state, ctx, RequestBody::Json(payload)).await
}

/// Handle POST /v1/audio/translations (multipart: `model`, `file`, extra text fields)
pub async fn audio_translations(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(account): Extension<Account>,
    mut multipart: Multipart,
) -> Result<Response> {
    let mut fields = Vec::new();
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or("audio").to_string();
            let content_type = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| Error::BadRequest(e.to_string()))?;
            file = Some((file_name, content_type, bytes));
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| Error::BadRequest(e.to_string()))?;
            fields.push((name, value));
        }
    }

    let model = fields
        .iter()
        .find(|(k, _)| k == "model")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| Error::BadRequest("missing `model` field".to_string()))?;
    let (file_name, content_type, file) =
        file.ok_or_else(|| Error::BadRequest("missing `file` field".to_string()))?;

    let endpoint = Endpoint::AudioTranslations;
    let info = admit_model(&state, &account, &model, endpoint, None)?;
    let price = request_price(&info, endpoint, 0, 0);
    let ctx = RequestContext::new(request_id.0, endpoint, info, account, price);

    let body = RequestBody::Multipart {
        fields,
        file_name,
        content_type,
        file,
    };
    forward(&state, ctx, body).await
}

/// Handle GET /v1/models
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.catalog.to_openai_list())
}

/// Handle GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "switchyard"
    }))
}

/// Handle GET /
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "switchyard",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            Endpoint::ChatCompletions.path(),
            Endpoint::Embeddings.path(),
            Endpoint::ImagesGenerations.path(),
            Endpoint::AudioSpeech.path(),
            Endpoint::AudioTranslations.path(),
            Endpoint::Moderations.path(),
            Endpoint::TextTranslations.path(),
        ]
    }))
}
