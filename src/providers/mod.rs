//! Upstream providers.
//!
//! Every provider implements the same fixed capability interface
//! ([`ProviderAdapter`]). Which implementation serves a provider is decided
//! once at boot by the [`registry`].

pub mod openai;
pub mod pool;
pub mod registry;

pub use openai::OpenAiAdapter;
pub use pool::SubProviderPool;
pub use registry::{ProviderCapability, ProviderRegistry};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::config::ApiKey;
use crate::error::Result;

/// The fixed set of routed endpoint families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    ChatCompletions,
    Embeddings,
    ImagesGenerations,
    AudioSpeech,
    AudioTranslations,
    Moderations,
    TextTranslations,
}

impl Endpoint {
    /// Path under which the gateway serves this family. Upstreams use the same path.
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "/v1/chat/completions",
            Endpoint::Embeddings => "/v1/embeddings",
            Endpoint::ImagesGenerations => "/v1/images/generations",
            Endpoint::AudioSpeech => "/v1/audio/speech",
            Endpoint::AudioTranslations => "/v1/audio/translations",
            Endpoint::Moderations => "/v1/moderations",
            Endpoint::TextTranslations => "/v1/text/translations",
        }
    }

    /// Families whose upstream calls get the long timeout.
    pub fn is_slow(&self) -> bool {
        matches!(
            self,
            Endpoint::Embeddings
                | Endpoint::ImagesGenerations
                | Endpoint::AudioSpeech
                | Endpoint::AudioTranslations
        )
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// Body of an upstream call.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    /// Audio upload: plain form fields plus one file.
    Multipart {
        fields: Vec<(String, String)>,
        file_name: String,
        content_type: Option<String>,
        file: Bytes,
    },
}

/// One call to a provider, bound to the credential chosen for it.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub credential: ApiKey,
    pub organization: Option<String>,
    pub body: RequestBody,
    pub stream: bool,
}

/// Capability interface every provider adapter implements.
///
/// Methods return the raw upstream response; status interpretation, metrics
/// and credential bookkeeping are done by the caller.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registry name, unique across providers.
    fn name(&self) -> &str;

    /// Short tag stamped into responses.
    fn provider_id(&self) -> &str;

    async fn chat_completions(&self, request: &UpstreamRequest) -> Result<reqwest::Response>;

    async fn embeddings(&self, request: &UpstreamRequest) -> Result<reqwest::Response>;

    async fn images_generations(&self, request: &UpstreamRequest) -> Result<reqwest::Response>;

    async fn audio_speech(&self, request: &UpstreamRequest) -> Result<reqwest::Response>;

    async fn audio_translations(&self, request: &UpstreamRequest) -> Result<reqwest::Response>;

    async fn moderations(&self, request: &UpstreamRequest) -> Result<reqwest::Response>;

    async fn text_translations(&self, request: &UpstreamRequest) -> Result<reqwest::Response>;
}

/// Call the adapter method for `endpoint`.
pub async fn dispatch(
    adapter: &dyn ProviderAdapter,
    endpoint: Endpoint,
    request: &UpstreamRequest,
) -> Result<reqwest::Response> {
    match endpoint {
        Endpoint::ChatCompletions => adapter.chat_completions(request).await,
        Endpoint::Embeddings => adapter.embeddings(request).await,
        Endpoint::ImagesGenerations => adapter.images_generations(request).await,
        Endpoint::AudioSpeech => adapter.audio_speech(request).await,
        Endpoint::AudioTranslations => adapter.audio_translations(request).await,
        Endpoint::Moderations => adapter.moderations(request).await,
        Endpoint::TextTranslations => adapter.text_translations(request).await,
    }
}
