//! OpenAI-compatible request types.
//!
//! Only the fields routing and pricing need are typed; everything else is
//! carried through to the provider untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Chat completion request (OpenAI-compatible).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    /// Gateway extension: pin a provider by name. Never forwarded upstream.
    #[serde(default, skip_serializing)]
    pub provider_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A chat message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Message content: plain text or a list of typed parts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One part of a multi-part message.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Whether any message carries an image part.
    pub fn needs_vision(&self) -> bool {
        self.messages.iter().any(|m| match &m.content {
            Some(MessageContent::Parts(parts)) => parts.iter().any(|p| p.kind == "image_url"),
            _ => false,
        })
    }

    /// Whether the request declares tools.
    pub fn needs_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }

    /// JSON body to send upstream.
    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Request body shared by the JSON endpoints that only need the model to route.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelRequest {
    pub model: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Text-to-speech request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_text_request() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hello"}],
            "temperature": 0.2
        }))
        .unwrap();

        assert!(!req.is_streaming());
        assert!(!req.needs_vision());
        assert!(!req.needs_tools());
        assert_eq!(req.to_payload().unwrap()["temperature"], 0.2);
    }

    #[test]
    fn test_image_part_requires_vision() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "https://x.test/a.png"}}
            ]}]
        }))
        .unwrap();

        assert!(req.needs_vision());
        let payload = req.to_payload().unwrap();
        assert_eq!(
            payload["messages"][0]["content"][1]["image_url"]["url"],
            "https://x.test/a.png"
        );
    }

    #[test]
    fn test_tools_and_pin_are_detected() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "f"}}],
            "provider_name": "alpha",
            "stream": true
        }))
        .unwrap();

        assert!(req.needs_tools());
        assert!(req.is_streaming());
        assert_eq!(req.provider_name.as_deref(), Some("alpha"));

        // The pin is a gateway concern and must not leak upstream
        let payload = req.to_payload().unwrap();
        assert!(payload.get("provider_name").is_none());
        assert_eq!(payload["stream"], true);
    }

    #[test]
    fn test_empty_tools_do_not_count() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [],
            "tools": []
        }))
        .unwrap();
        assert!(!req.needs_tools());
    }
}
