//! Typed per-capability request records and submission options.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Capability;
use crate::error::GatewayError;

/// LLM completion request.
///
/// POST /ai/llm/completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// One message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// LLM chat request.
///
/// POST /ai/llm/chat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Vision analysis request.
///
/// POST /ai/vision/analyze
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(default = "default_vision_task")]
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

fn default_vision_task() -> String {
    "analyze".to_string()
}

/// NLP processing request.
///
/// POST /ai/nlp/process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlpRequest {
    pub text: String,
    pub task: String,
}

/// Tabular data processing request.
///
/// POST /data/process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataProcessRequest {
    pub operation: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// A decoded, validated request for one capability.
#[derive(Debug, Clone)]
pub enum AiRequest {
    Completion(CompletionRequest),
    Chat(ChatRequest),
    Vision(VisionRequest),
    Nlp(NlpRequest),
    Data(DataProcessRequest),
}

impl AiRequest {
    /// Decode a raw JSON body into the typed record for `capability`.
    ///
    /// Decoding is total: every failure maps to `InvalidRequest` with the
    /// offending field named in the message.
    pub fn decode(capability: Capability, body: Value) -> Result<Self, GatewayError> {
        let decoded = match capability {
            Capability::LlmCompletion => {
                serde_json::from_value(body).map(AiRequest::Completion)
            }
            Capability::LlmChat => serde_json::from_value(body).map(AiRequest::Chat),
            Capability::VisionAnalyze => serde_json::from_value(body).map(AiRequest::Vision),
            Capability::NlpAnalyze => serde_json::from_value(body).map(AiRequest::Nlp),
            Capability::DataProcess => serde_json::from_value(body).map(AiRequest::Data),
        };
        let request =
            decoded.map_err(|e| GatewayError::invalid_request(format!("{e}")))?;
        request.validate()?;
        Ok(request)
    }

    /// Semantic validation beyond what serde can express.
    pub fn validate(&self) -> Result<(), GatewayError> {
        match self {
            AiRequest::Completion(r) => {
                if r.prompt.is_empty() {
                    return Err(GatewayError::invalid_request("prompt: must not be empty"));
                }
                if let Some(t) = r.temperature {
                    if !(0.0..=2.0).contains(&t) {
                        return Err(GatewayError::invalid_request(
                            "temperature: must be within [0.0, 2.0]",
                        ));
                    }
                }
            }
            AiRequest::Chat(r) => {
                if r.messages.is_empty() {
                    return Err(GatewayError::invalid_request(
                        "messages: must contain at least one message",
                    ));
                }
                for (i, m) in r.messages.iter().enumerate() {
                    if m.role.is_empty() {
                        return Err(GatewayError::invalid_request(format!(
                            "messages[{i}].role: must not be empty"
                        )));
                    }
                }
            }
            AiRequest::Vision(r) => {
                if r.image_url.is_none() && r.image_base64.is_none() {
                    return Err(GatewayError::invalid_request(
                        "image_url: one of image_url or image_base64 is required",
                    ));
                }
            }
            AiRequest::Nlp(r) => {
                if r.text.is_empty() {
                    return Err(GatewayError::invalid_request("text: must not be empty"));
                }
                if r.task.is_empty() {
                    return Err(GatewayError::invalid_request("task: must not be empty"));
                }
            }
            AiRequest::Data(r) => {
                if r.operation.is_empty() {
                    return Err(GatewayError::invalid_request(
                        "operation: must not be empty",
                    ));
                }
            }
        }
        Ok(())
    }

    /// The capability this request targets.
    pub fn capability(&self) -> Capability {
        match self {
            AiRequest::Completion(_) => Capability::LlmCompletion,
            AiRequest::Chat(_) => Capability::LlmChat,
            AiRequest::Vision(_) => Capability::VisionAnalyze,
            AiRequest::Nlp(_) => Capability::NlpAnalyze,
            AiRequest::Data(_) => Capability::DataProcess,
        }
    }

    /// Whether this request is replay-stable and may share a backend call
    /// with identical concurrent submissions.
    ///
    /// Sampling at temperature > 0 makes LLM output non-deterministic, so
    /// such requests only coalesce when the caller opted in via
    /// `allow_cache`.
    pub fn is_pure(&self, allow_cache: bool) -> bool {
        let temperature = match self {
            AiRequest::Completion(r) => r.temperature,
            AiRequest::Chat(r) => r.temperature,
            _ => return self.capability().pure_by_default(),
        };
        match temperature {
            Some(t) if t > 0.0 => allow_cache,
            _ => true,
        }
    }

    /// Key identifying the parameters that must match for two requests to
    /// share one batched backend call.
    pub fn bucket_key(&self) -> String {
        match self {
            AiRequest::Completion(r) => format!(
                "{}|t{}",
                r.model.as_deref().unwrap_or("default"),
                temperature_tier(r.temperature)
            ),
            AiRequest::Chat(r) => format!(
                "{}|t{}",
                r.model.as_deref().unwrap_or("default"),
                temperature_tier(r.temperature)
            ),
            AiRequest::Vision(r) => r.task.clone(),
            AiRequest::Nlp(r) => r.task.clone(),
            AiRequest::Data(r) => r.operation.clone(),
        }
    }

    /// The JSON body forwarded to the backend.
    pub fn to_body(&self) -> Value {
        match self {
            AiRequest::Completion(r) => serde_json::to_value(r),
            AiRequest::Chat(r) => serde_json::to_value(r),
            AiRequest::Vision(r) => serde_json::to_value(r),
            AiRequest::Nlp(r) => serde_json::to_value(r),
            AiRequest::Data(r) => serde_json::to_value(r),
        }
        .unwrap_or(Value::Null)
    }
}

/// Temperature bucket for batching: requests in the same 0.1-wide tier may
/// share one backend call.
fn temperature_tier(temperature: Option<f32>) -> u32 {
    (temperature.unwrap_or(0.0).clamp(0.0, 2.0) * 10.0).round() as u32
}

/// Submission priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    /// Skips the micro-batch wait and dispatches immediately.
    High,
}

/// Per-submission options.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Overall deadline for the job, including queueing and retries.
    pub deadline: Duration,
    /// Whether the response cache may serve or store this request.
    pub allow_cache: bool,
    pub priority: Priority,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            allow_cache: true,
            priority: Priority::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_completion() {
        let req = AiRequest::decode(
            Capability::LlmCompletion,
            json!({"prompt": "hello", "max_tokens": 64, "temperature": 0.7}),
        )
        .unwrap();
        assert!(matches!(req, AiRequest::Completion(_)));
        assert_eq!(req.capability(), Capability::LlmCompletion);
    }

    #[test]
    fn test_decode_missing_field() {
        let err = AiRequest::decode(Capability::NlpAnalyze, json!({"text": "hi"})).unwrap_err();
        assert_eq!(err.kind().as_str(), "invalid_request");
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let err =
            AiRequest::decode(Capability::LlmCompletion, json!({"prompt": ""})).unwrap_err();
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn test_vision_requires_image() {
        let err =
            AiRequest::decode(Capability::VisionAnalyze, json!({"task": "ocr"})).unwrap_err();
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn test_purity_with_temperature() {
        let req = AiRequest::decode(
            Capability::LlmCompletion,
            json!({"prompt": "hi", "temperature": 0.9}),
        )
        .unwrap();
        assert!(!req.is_pure(false));
        assert!(req.is_pure(true));

        let cold = AiRequest::decode(
            Capability::LlmCompletion,
            json!({"prompt": "hi", "temperature": 0.0}),
        )
        .unwrap();
        assert!(cold.is_pure(false));
    }

    #[test]
    fn test_bucket_key_groups_compatible_requests() {
        let a = AiRequest::decode(
            Capability::LlmCompletion,
            json!({"prompt": "one", "model": "m", "temperature": 0.70}),
        )
        .unwrap();
        let b = AiRequest::decode(
            Capability::LlmCompletion,
            json!({"prompt": "two", "model": "m", "temperature": 0.72}),
        )
        .unwrap();
        let c = AiRequest::decode(
            Capability::LlmCompletion,
            json!({"prompt": "three", "model": "other", "temperature": 0.7}),
        )
        .unwrap();
        assert_eq!(a.bucket_key(), b.bucket_key());
        assert_ne!(a.bucket_key(), c.bucket_key());
    }
}
