//! Error types for switchyard.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Result type alias for switchyard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Rejections produced before a request is routed. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("No API key was provided in the request. Include your API key in the Authorization header as \"Bearer <your_key>\".")]
    MissingKey,

    #[error("The provided API key was not found. Check that you entered it correctly.")]
    UnknownKey,

    #[error("Your API key has been banned from accessing the service.")]
    Banned,

    #[error("IP address mismatch detected. Accounts below the premium tier are limited to one IP address, and your current address does not match the one registered to your account.")]
    IpMismatch,

    #[error("The model `{0}` does not exist.")]
    UnknownModel(String),

    #[error("The model `{model}` cannot be used with this endpoint ({endpoint}).")]
    EndpointMismatch { model: String, endpoint: String },

    #[error("The voice `{voice}` is not available for model `{model}`.")]
    UnknownVoice { model: String, voice: String },

    #[error("Access denied for model `{model}`. This model is {reason}.")]
    ModelAccess { model: String, reason: &'static str },

    #[error("Insufficient credits to process this request. You currently have {available} credits available, but this operation requires {required} credits. Wait for your credits to be replenished or upgrade your tier.")]
    InsufficientCredits { available: f64, required: f64 },
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::MissingKey | AdmissionError::UnknownKey => StatusCode::UNAUTHORIZED,
            AdmissionError::Banned | AdmissionError::IpMismatch | AdmissionError::ModelAccess { .. } => {
                StatusCode::FORBIDDEN
            }
            AdmissionError::UnknownModel(_)
            | AdmissionError::EndpointMismatch { .. }
            | AdmissionError::UnknownVoice { .. } => StatusCode::BAD_REQUEST,
            AdmissionError::InsufficientCredits { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

/// Main error type for switchyard.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("The requested model is temporarily unavailable due to no active providers. This is likely a temporary issue. Try again in a few minutes, or select a different model.")]
    NoProvider { model: String },

    #[error("No sub-providers were found for the specified model. Try again later.")]
    NoSubProvider { provider_id: String, model: String },

    #[error("Provider '{provider}' answered with status {status}")]
    Upstream {
        provider: String,
        provider_id: String,
        status: u16,
    },

    #[error("Upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// HTTP status, error type label and client-facing message.
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            Error::Admission(e) => (e.status(), "invalid_request_error", e.to_string()),
            Error::NoProvider { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no_provider_error",
                self.to_string(),
            ),
            Error::NoSubProvider { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "sub_provider_error",
                self.to_string(),
            ),
            Error::Upstream { .. } | Error::Transport(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "invalid_response_error",
                "Something went wrong. Try again later.".to_string(),
            ),
            Error::BadRequest(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                self.to_string(),
            ),
            // Operator-side detail stays in the logs
            Error::Config(_) | Error::Internal(_) | Error::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_server_error",
                "An internal error occurred.".to_string(),
            ),
        }
    }

    /// The `provider_id` to stamp into the error body, if one is known.
    fn provider_id(&self) -> Option<&str> {
        match self {
            Error::NoSubProvider { provider_id, .. } | Error::Upstream { provider_id, .. } => {
                Some(provider_id)
            }
            _ => None,
        }
    }

    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        self.parts().0
    }
}

/// Build the OpenAI-compatible error body.
pub fn error_body(
    status: StatusCode,
    error_type: &str,
    message: &str,
    provider_id: Option<&str>,
) -> serde_json::Value {
    let mut error = json!({
        "message": message,
        "type": error_type,
        "code": status.as_u16(),
    });
    if let Some(id) = provider_id {
        error["provider_id"] = json!(id);
    }
    json!({ "error": error })
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type, message) = self.parts();

        if matches!(
            self,
            Error::Config(_) | Error::Internal(_) | Error::Database(_)
        ) {
            tracing::error!(error = %self, "Request failed with internal error");
        }

        let body = error_body(status, error_type, &message, self.provider_id());
        (status, axum::Json(body)).into_response()
    }
}
