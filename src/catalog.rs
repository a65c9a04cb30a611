//! Model catalog: model id to endpoints, pricing and access class.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::config::{ModelAccess, ModelConfig};
use crate::error::AdmissionError;
use crate::providers::Endpoint;

/// How a model is charged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pricing {
    /// Credits per token, for prompt and completion alike.
    PerToken { multiplier: f64 },
    /// Credits per call.
    Flat(f64),
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub owned_by: String,
    pub endpoints: Vec<String>,
    pub pricing: Pricing,
    pub access: ModelAccess,
    pub voices: Vec<String>,
}

impl From<&ModelConfig> for ModelInfo {
    fn from(config: &ModelConfig) -> Self {
        Self {
            id: config.id.clone(),
            owned_by: config.owned_by.clone(),
            endpoints: config.endpoints.clone(),
            pricing: match config.price {
                Some(price) => Pricing::Flat(price),
                None => Pricing::PerToken {
                    multiplier: config.multiplier,
                },
            },
            access: config.access,
            voices: config.voices.clone(),
        }
    }
}

impl ModelInfo {
    pub fn serves(&self, endpoint: Endpoint) -> bool {
        self.endpoints.iter().any(|e| e == endpoint.path())
    }

    /// Credits per token. Flat-priced models charge nothing per token.
    pub fn token_multiplier(&self) -> f64 {
        match self.pricing {
            Pricing::PerToken { multiplier } => multiplier,
            Pricing::Flat(_) => 0.0,
        }
    }
}

/// Lookup table built from `[[models]]`.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    models: Vec<ModelInfo>,
    index: HashMap<String, usize>,
}

impl Catalog {
    pub fn from_config(models: &[ModelConfig]) -> Self {
        let models: Vec<ModelInfo> = models.iter().map(ModelInfo::from).collect();
        let index = models
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
        Self { models, index }
    }

    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.index.get(id).map(|&i| &self.models[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelInfo> {
        self.models.iter()
    }

    /// Resolve `model` for `endpoint` and check the caller may use it.
    ///
    /// Paid models are closed to tier 0; early-access models need the premium tier.
    pub fn check_access(
        &self,
        model: &str,
        endpoint: Endpoint,
        voice: Option<&str>,
        tier: i64,
        premium_tier: i64,
    ) -> Result<&ModelInfo, AdmissionError> {
        let info = self
            .get(model)
            .ok_or_else(|| AdmissionError::UnknownModel(model.to_string()))?;

        if !info.serves(endpoint) {
            return Err(AdmissionError::EndpointMismatch {
                model: model.to_string(),
                endpoint: endpoint.path().to_string(),
            });
        }

        if endpoint == Endpoint::AudioSpeech {
            if let Some(voice) = voice {
                if !info.voices.iter().any(|v| v == voice) {
                    return Err(AdmissionError::UnknownVoice {
                        model: model.to_string(),
                        voice: voice.to_string(),
                    });
                }
            }
        }

        let denied = match info.access {
            ModelAccess::Free => None,
            ModelAccess::Paid if tier == 0 => Some("not available for free users"),
            ModelAccess::Paid => None,
            ModelAccess::EarlyAccess if tier < premium_tier => {
                Some("early access only and requires a premium tier")
            }
            ModelAccess::EarlyAccess => None,
        };
        if let Some(reason) = denied {
            return Err(AdmissionError::ModelAccess {
                model: model.to_string(),
                reason,
            });
        }

        Ok(info)
    }

    /// `GET /v1/models` body.
    pub fn to_openai_list(&self) -> Value {
        let data: Vec<Value> = self
            .models
            .iter()
            .map(|m| {
                json!({
                    "id": m.id,
                    "object": "model",
                    "owned_by": m.owned_by,
                    "endpoints": m.endpoints,
                    "access": m.access,
                })
            })
            .collect();
        json!({ "object": "list", "data": data })
    }
}
