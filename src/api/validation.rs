//! Request body validation and input sanitization.
//!
//! Bodies arrive as raw JSON so that every shape error can be reported with
//! the same generic public message while the detailed reason is kept for logs.

use crate::api::models::{ChatRequest, Message, ProviderKind};
use crate::core::error::{AppError, Result};
use serde_json::Value;

pub const MAX_MESSAGE_LENGTH: usize = 10_000;
pub const MAX_MESSAGES_COUNT: usize = 100;
pub const MAX_MODEL_NAME_LENGTH: usize = 100;
pub const MIN_TEMPERATURE: f64 = 0.0;
pub const MAX_TEMPERATURE: f64 = 2.0;

/// Custom roles longer than this are rejected.
const MAX_CUSTOM_ROLE_LENGTH: usize = 20;

const STANDARD_ROLES: &[&str] = &["system", "user", "assistant"];

/// Number of alternatives listed when a model is refused.
const SUGGESTED_MODELS: usize = 5;

/// Known model identifiers for both providers.
pub const ALLOWED_MODELS: &[&str] = &[
    // Meta Llama
    "@cf/meta/llama-3.3-70b-instruct",
    "@cf/meta/llama-3.2-11b-vision-instruct",
    "@cf/meta/llama-3.2-3b-instruct",
    "@cf/meta/llama-3.2-1b-instruct",
    "@cf/meta/llama-3.1-70b-instruct",
    "@cf/meta/llama-3.1-8b-instruct",
    "@cf/meta/llama-3-8b-instruct",
    "@cf/meta/llama-2-7b-chat-fp16",
    // Mistral
    "@cf/mistral/mistral-7b-instruct-v0.2",
    "@cf/mistral/mistral-7b-instruct-v0.1",
    // Microsoft
    "@cf/microsoft/phi-2",
    // Qwen
    "@cf/qwen/qwen1.5-0.5b-chat",
    "@cf/qwen/qwen1.5-1.8b-chat",
    "@cf/qwen/qwen1.5-7b-chat-awq",
    "@cf/qwen/qwen1.5-14b-chat-awq",
    // Other
    "@cf/tinyllama/tinyllama-1.1b-chat-v1.0",
    "@cf/deepseek-ai/deepseek-math-7b-instruct",
    "@cf/thebloke/deepseek-coder-6.7b-instruct-awq",
    "@cf/openchat/openchat-3.5-0106",
    // Fallback provider
    "gpt-4o-mini",
    "gpt-4o",
    "gpt-4-turbo-preview",
    "gpt-4",
    "gpt-3.5-turbo",
    "gpt-3.5-turbo-16k",
];

pub fn is_allowed_model(model: &str) -> bool {
    ALLOWED_MODELS.contains(&model)
}

fn is_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0B}'..='\u{0C}' | '\u{0E}'..='\u{1F}' | '\u{7F}')
}

/// Strip control characters (keeping `\n`, `\r` and `\t`) and truncate to
/// `max_chars`. Idempotent.
pub fn sanitize_string(input: &str, max_chars: usize) -> String {
    input.chars().filter(|c| !is_control(*c)).take(max_chars).collect()
}

/// Validate one message object at `index`.
pub fn validate_message(value: &Value, index: usize) -> Result<Message> {
    let object = value
        .as_object()
        .ok_or_else(|| AppError::validation(format!("Message at index {} must be an object", index)))?;

    let role = object
        .get("role")
        .and_then(Value::as_str)
        .map(|r| r.trim().to_lowercase())
        .filter(|r| !r.is_empty())
        .ok_or_else(|| AppError::validation(format!("Message at index {} missing valid role", index)))?;

    if !STANDARD_ROLES.contains(&role.as_str()) && role.chars().count() > MAX_CUSTOM_ROLE_LENGTH {
        return Err(AppError::validation(format!(
            "Message at index {} has invalid role",
            index
        )));
    }

    let content = match object.get("content") {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::String(_)) | None | Some(Value::Null) => {
            return Err(AppError::validation(format!(
                "Message at index {} missing content",
                index
            )))
        }
        Some(_) => {
            return Err(AppError::validation(format!(
                "Message at index {} content must be a string",
                index
            )))
        }
    };

    let content = sanitize_string(content, MAX_MESSAGE_LENGTH);
    if content.is_empty() {
        return Err(AppError::validation(format!(
            "Message at index {} has no content after sanitization",
            index
        )));
    }

    Ok(Message { role, content })
}

pub fn validate_messages(value: &Value) -> Result<Vec<Message>> {
    let messages = value
        .as_array()
        .ok_or_else(|| AppError::validation("Messages must be an array"))?;

    if messages.is_empty() {
        return Err(AppError::validation("Messages array cannot be empty"));
    }
    if messages.len() > MAX_MESSAGES_COUNT {
        return Err(AppError::validation(format!(
            "Too many messages: {} (max {})",
            messages.len(),
            MAX_MESSAGES_COUNT
        )));
    }

    messages
        .iter()
        .enumerate()
        .map(|(index, message)| validate_message(message, index))
        .collect()
}

/// Validate an optional model name against [`ALLOWED_MODELS`]. An empty
/// string counts as absent.
pub fn validate_model_name(value: Option<&Value>) -> Result<Option<String>> {
    let model = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s,
        Some(_) => return Err(AppError::validation("Model must be a string")),
    };

    if model.chars().count() > MAX_MODEL_NAME_LENGTH {
        return Err(AppError::validation(format!(
            "Model name exceeds {} characters",
            MAX_MODEL_NAME_LENGTH
        )));
    }

    let sanitized = sanitize_string(model, MAX_MODEL_NAME_LENGTH);
    if sanitized.is_empty() {
        return Ok(None);
    }

    if !is_allowed_model(&sanitized) {
        let suggestions: Vec<&str> = ALLOWED_MODELS
            .iter()
            .copied()
            .filter(|m| m.starts_with("@cf/"))
            .take(SUGGESTED_MODELS)
            .collect();
        return Err(AppError::validation_with_public(
            format!(
                "Invalid request: model is not in the allowed models list. Available models: {}, ...",
                suggestions.join(", ")
            ),
            format!("Model '{}' is not allowlisted", sanitized),
        ));
    }

    Ok(Some(sanitized))
}

/// Accepts a JSON number or a numeric string; must be finite and in [0, 2].
pub fn validate_temperature(value: Option<&Value>) -> Result<Option<f64>> {
    let temperature = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    }
    .filter(|t| t.is_finite())
    .ok_or_else(|| AppError::validation("Temperature must be a number"))?;

    if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&temperature) {
        return Err(AppError::validation(format!(
            "Temperature must be between {} and {}",
            MIN_TEMPERATURE, MAX_TEMPERATURE
        )));
    }

    Ok(Some(temperature))
}

pub fn validate_provider(value: Option<&Value>) -> Result<Option<ProviderKind>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => ProviderKind::parse(s)
            .map(Some)
            .ok_or_else(|| AppError::validation("Invalid provider")),
        Some(_) => Err(AppError::validation("Provider must be a string")),
    }
}

/// Validate a full request body.
///
/// `messages` is read from the top level, or from `variables.messages` when a
/// `query` field is present.
pub fn validate_request_body(body: &Value) -> Result<ChatRequest> {
    let request = body
        .as_object()
        .ok_or_else(|| AppError::validation("Request body must be an object"))?;

    let messages = match request.get("messages") {
        Some(messages) if !messages.is_null() => messages,
        _ => match (request.get("query"), body.pointer("/variables/messages")) {
            (Some(query), Some(messages)) if !query.is_null() && !messages.is_null() => messages,
            _ => return Err(AppError::validation("No messages found in request")),
        },
    };

    Ok(ChatRequest {
        messages: validate_messages(messages)?,
        stream: request.get("stream").and_then(Value::as_bool),
        model: validate_model_name(request.get("model"))?,
        temperature: validate_temperature(request.get("temperature"))?,
        provider: validate_provider(request.get("provider"))?,
    })
}
