//! API request and response models.
//!
//! Inbound bodies are validated from raw JSON (see [`crate::api::validation`]),
//! so only the validated [`ChatRequest`] is a typed model. Outbound payloads
//! follow the OpenAI chat completion shape.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which upstream serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Primary,
    Fallback,
}

impl ProviderKind {
    /// Case-insensitive, whitespace-tolerant parse.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" => Some(ProviderKind::Primary),
            "fallback" => Some(ProviderKind::Fallback),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Primary => "primary",
            ProviderKind::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role: "system", "user", "assistant" or a short custom role
    pub role: String,

    /// Message content, already sanitized
    pub content: String,
}

/// A validated chat request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub stream: Option<bool>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub provider: Option<ProviderKind>,
}

/// Canonical chat completion response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Set only on responses served from the cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
}

/// A single choice in the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

/// Token usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Streaming response chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

/// A single choice in a streaming chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// Delta content in a streaming chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Lenient view of either provider's non-streaming response.
///
/// The primary provider answers `{result: {response}}` or `{response}`; the
/// fallback answers with OpenAI-style `choices`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderPayload {
    #[serde(default)]
    pub choices: Option<Vec<ProviderChoice>>,

    #[serde(default)]
    pub result: Option<ProviderResult>,

    #[serde(default)]
    pub response: Option<String>,

    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderChoice {
    #[serde(default)]
    pub message: Option<ProviderMessage>,

    #[serde(default)]
    pub delta: Option<ProviderMessage>,

    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderMessage {
    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderResult {
    #[serde(default)]
    pub response: Option<String>,
}

const NO_RESPONSE: &str = "No response";

pub fn completion_id() -> String {
    format!("chat-{}", uuid::Uuid::new_v4().simple())
}

impl ChatCompletionResponse {
    /// Normalize a provider payload. `model` is the model that actually served
    /// the request.
    pub fn from_provider(payload: ProviderPayload, model: &str) -> Self {
        let text_fallback = payload
            .result
            .as_ref()
            .and_then(|r| r.response.clone())
            .or_else(|| payload.response.clone());

        let choices = match payload.choices {
            Some(choices) if !choices.is_empty() => choices
                .into_iter()
                .enumerate()
                .map(|(index, choice)| {
                    let message = match choice.message {
                        Some(ProviderMessage {
                            role,
                            content: Some(content),
                        }) => Message {
                            role: role.unwrap_or_else(|| "assistant".to_string()),
                            content,
                        },
                        _ => Message {
                            role: "assistant".to_string(),
                            content: choice
                                .delta
                                .and_then(|d| d.content)
                                .or_else(|| text_fallback.clone())
                                .unwrap_or_else(|| NO_RESPONSE.to_string()),
                        },
                    };
                    Choice {
                        index: index as u32,
                        message,
                        finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
                    }
                })
                .collect(),
            _ => vec![Choice {
                index: 0,
                message: Message {
                    role: "assistant".to_string(),
                    content: text_fallback.unwrap_or_else(|| NO_RESPONSE.to_string()),
                },
                finish_reason: "stop".to_string(),
            }],
        };

        Self {
            id: completion_id(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices,
            usage: Some(payload.usage.unwrap_or_default()),
            cached: None,
        }
    }
}

impl StreamChunk {
    fn new(model: &str, delta: Delta, finish_reason: Option<&str>) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    /// Opening chunk announcing the assistant role.
    pub fn role(model: &str) -> Self {
        Self::new(
            model,
            Delta {
                role: Some("assistant".to_string()),
                content: None,
            },
            None,
        )
    }

    pub fn content(model: &str, text: &str) -> Self {
        Self::new(
            model,
            Delta {
                role: None,
                content: Some(text.to_string()),
            },
            None,
        )
    }

    /// Terminal chunk with an empty delta.
    pub fn stop(model: &str) -> Self {
        Self::new(model, Delta::default(), Some("stop"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> ProviderPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(ProviderKind::parse("primary"), Some(ProviderKind::Primary));
        assert_eq!(ProviderKind::parse(" Fallback "), Some(ProviderKind::Fallback));
        assert_eq!(ProviderKind::parse("openai"), None);
        assert_eq!(ProviderKind::default(), ProviderKind::Primary);
        assert_eq!(ProviderKind::Fallback.to_string(), "fallback");
    }

    #[test]
    fn test_from_primary_response_field() {
        let response = ChatCompletionResponse::from_provider(
            payload(json!({"response": "hello"})),
            "@cf/meta/llama-3.1-8b-instruct",
        );
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.model, "@cf/meta/llama-3.1-8b-instruct");
        assert_eq!(
            response.choices,
            vec![Choice {
                index: 0,
                message: Message {
                    role: "assistant".to_string(),
                    content: "hello".to_string(),
                },
                finish_reason: "stop".to_string(),
            }]
        );
        assert_eq!(response.usage, Some(Usage::default()));
        assert!(response.cached.is_none());
    }

    #[test]
    fn test_from_primary_result_envelope() {
        let response =
            ChatCompletionResponse::from_provider(payload(json!({"result": {"response": "hi"}})), "m");
        assert_eq!(response.choices[0].message.content, "hi");
    }

    #[test]
    fn test_from_openai_choices() {
        let response = ChatCompletionResponse::from_provider(
            payload(json!({
                "choices": [
                    {"message": {"role": "assistant", "content": "a"}, "finish_reason": "length"},
                    {"message": {"role": "assistant", "content": "b"}}
                ],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })),
            "gpt-4o-mini",
        );
        assert_eq!(response.choices.len(), 2);
        assert_eq!(response.choices[0].finish_reason, "length");
        assert_eq!(response.choices[1].index, 1);
        assert_eq!(response.choices[1].message.content, "b");
        assert_eq!(response.choices[1].finish_reason, "stop");
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn test_empty_payload_yields_placeholder() {
        let response = ChatCompletionResponse::from_provider(payload(json!({})), "m");
        assert_eq!(response.choices[0].message.content, NO_RESPONSE);
    }

    #[test]
    fn test_cached_flag_serialization() {
        let mut response = ChatCompletionResponse::from_provider(payload(json!({"response": "x"})), "m");
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("cached").is_none());

        response.cached = Some(true);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["cached"], json!(true));
    }

    #[test]
    fn test_stream_chunk_shapes() {
        let role = serde_json::to_value(StreamChunk::role("m")).unwrap();
        assert_eq!(role["object"], "chat.completion.chunk");
        assert_eq!(role["choices"][0]["delta"], json!({"role": "assistant"}));
        assert_eq!(role["choices"][0]["finish_reason"], json!(null));

        let content = serde_json::to_value(StreamChunk::content("m", "hi")).unwrap();
        assert_eq!(content["choices"][0]["delta"], json!({"content": "hi"}));

        let stop = serde_json::to_value(StreamChunk::stop("m")).unwrap();
        assert_eq!(stop["choices"][0]["delta"], json!({}));
        assert_eq!(stop["choices"][0]["finish_reason"], "stop");
    }
}
