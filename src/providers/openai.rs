//! Adapter for upstreams speaking the OpenAI REST dialect.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

use super::{Endpoint, ProviderAdapter, RequestBody, UpstreamRequest};
use crate::config::ProviderConfig;
use crate::error::{Error, Result};

/// OpenAI-compatible HTTP adapter.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    name: String,
    provider_id: String,
    base_url: String,
    client: Client,
    timeout: Duration,
    long_timeout: Duration,
}

impl OpenAiAdapter {
    pub fn new(config: &ProviderConfig, client: Client) -> Self {
        Self {
            name: config.name.clone(),
            provider_id: config
                .provider_id
                .clone()
                .unwrap_or_else(|| config.name.to_lowercase()),
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            timeout: Duration::from_secs(config.timeout_secs),
            long_timeout: Duration::from_secs(config.long_timeout_secs),
        }
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }

    async fn send(&self, endpoint: Endpoint, request: &UpstreamRequest) -> Result<reqwest::Response> {
        // Streams stay open for as long as the model generates
        let timeout = if endpoint.is_slow() || request.stream {
            self.long_timeout
        } else {
            self.timeout
        };

        let mut builder = self
            .client
            .post(self.url(endpoint))
            .bearer_auth(request.credential.expose_secret())
            .timeout(timeout);

        if let Some(org) = &request.organization {
            builder = builder.header("OpenAI-Organization", org);
        }

        builder = match &request.body {
            RequestBody::Json(payload) => builder.json(payload),
            RequestBody::Multipart {
                fields,
                file_name,
                content_type,
                file,
            } => {
                let mut part = Part::bytes(file.to_vec()).file_name(file_name.clone());
                if let Some(mime) = content_type {
                    part = part.mime_str(mime).map_err(|e| {
                        Error::BadRequest(format!("invalid file content type '{mime}': {e}"))
                    })?;
                }
                let form = fields
                    .iter()
                    .fold(Form::new(), |form, (k, v)| form.text(k.clone(), v.clone()))
                    .part("file", part);
                builder.multipart(form)
            }
        };

        tracing::debug!(
            provider = %self.name,
            endpoint = %endpoint,
            stream = request.stream,
            "Sending upstream request"
        );

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(provider = %self.name, error = %e, "Failed to reach provider");
            Error::Transport(e)
        })?;

        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn chat_completions(&self, request: &UpstreamRequest) -> Result<reqwest::Response> {
        self.send(Endpoint::ChatCompletions, request).await
    }

    async fn embeddings(&self, request: &UpstreamRequest) -> Result<reqwest::Response> {
        self.send(Endpoint::Embeddings, request).await
    }

    async fn images_generations(&self, request: &UpstreamRequest) -> Result<reqwest::Response> {
        self.send(Endpoint::ImagesGenerations, request).await
    }

    async fn audio_speech(&self, request: &UpstreamRequest) -> Result<reqwest::Response> {
        self.send(Endpoint::AudioSpeech, request).await
    }

    async fn audio_translations(&self, request: &UpstreamRequest) -> Result<reqwest::Response> {
        self.send(Endpoint::AudioTranslations, request).await
    }

    async fn moderations(&self, request: &UpstreamRequest) -> Result<reqwest::Response> {
        self.send(Endpoint::Moderations, request).await
    }

    async fn text_translations(&self, request: &UpstreamRequest) -> Result<reqwest::Response> {
        self.send(Endpoint::TextTranslations, request).await
    }
}
