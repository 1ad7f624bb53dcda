//! Intake adaptation: normalize the external request shape into the
//! internal submission call.
//!
//! Precedence rules:
//! - `provider_config.model_name` overrides `model`
//! - explicit `messages` win over `prompt`
//! - `input_text` is appended to `prompt` after a blank line
//! - `output_schema` aliases `response_format`
//! - unspecified knobs come from the per-model defaults catalog

use crate::error::{Error, Result};
use crate::http::schemas::CreateTaskRequest;
use crate::presets::ModelDefaultsCatalog;
use crate::providers::{ChatMessage, GenerationParams, TaskInput};

/// One adapted submission, ready for the dispatcher.
#[derive(Debug, Clone)]
pub struct AdaptedRequest {
    /// Resolved model name (may still come from the conversation).
    pub model: Option<String>,
    /// Normalized input.
    pub input: TaskInput,
    /// Effective generation parameters.
    pub params: GenerationParams,
    /// Streaming hint.
    pub stream: bool,
}

/// Adapt an intake-style request into the internal shape.
pub fn adapt_request(
    request: &CreateTaskRequest,
    defaults: &ModelDefaultsCatalog,
) -> Result<AdaptedRequest> {
    let model = request
        .provider_config
        .as_ref()
        .and_then(|pc| pc.model_name.clone())
        .or_else(|| request.model.clone())
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());

    let input = normalize_input(request)?;
    let params = effective_params(request, model.as_deref(), defaults)?;

    Ok(AdaptedRequest {
        model,
        input,
        params,
        stream: request.stream.unwrap_or(false),
    })
}

fn normalize_input(request: &CreateTaskRequest) -> Result<TaskInput> {
    if let Some(messages) = &request.messages {
        if !messages.is_empty() {
            return Ok(TaskInput::Messages(
                messages
                    .iter()
                    .map(|m| ChatMessage::new(m.role, m.content.clone()))
                    .collect(),
            ));
        }
    }
    let prompt = request.prompt.as_deref().map(str::trim).unwrap_or_default();
    let input_text = request
        .input_text
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    let combined = match (prompt.is_empty(), input_text.is_empty()) {
        (false, false) => format!("{prompt}\n\n{input_text}"),
        (false, true) => prompt.to_string(),
        (true, false) => input_text.to_string(),
        (true, true) => {
            return Err(Error::Validation(
                "either prompt or messages must be provided".to_string(),
            ));
        }
    };
    Ok(TaskInput::Prompt(combined))
}

fn effective_params(
    request: &CreateTaskRequest,
    model: Option<&str>,
    defaults: &ModelDefaultsCatalog,
) -> Result<GenerationParams> {
    let mut params = defaults.params_for(model.unwrap_or_default());
    if let Some(temperature) = request.temperature {
        params.temperature = temperature;
    }
    if let Some(max_tokens) = request.max_tokens {
        params.max_tokens = max_tokens;
    }
    if let Some(top_p) = request.top_p {
        params.top_p = top_p;
    }
    if let Some(top_k) = request.top_k {
        params.top_k = top_k;
    }
    if let Some(frequency_penalty) = request.frequency_penalty {
        params.frequency_penalty = frequency_penalty;
    }
    if let Some(presence_penalty) = request.presence_penalty {
        params.presence_penalty = presence_penalty;
    }
    if let Some(stop_sequences) = &request.stop_sequences {
        params.stop_sequences = stop_sequences.clone();
    }
    params.seed = request.seed;
    params.response_format = request
        .output_schema
        .clone()
        .or_else(|| request.response_format.clone());
    params.grammar = request.grammar.clone();
    if let Some(extra) = &request.extra_params {
        params.extra = extra.clone();
    }
    params.validate()?;
    Ok(params)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::http::schemas::{MessageIn, ProviderConfigOverride};
    use crate::providers::Role;

    fn defaults() -> ModelDefaultsCatalog {
        ModelDefaultsCatalog::with_builtin()
    }

    #[test]
    fn provider_config_model_overrides_top_level() {
        let request = CreateTaskRequest {
            model: Some("ignored".to_string()),
            prompt: Some("hi".to_string()),
            provider_config: Some(ProviderConfigOverride {
                model_name: Some("actual-model".to_string()),
            }),
            ..CreateTaskRequest::default()
        };
        let adapted = adapt_request(&request, &defaults()).unwrap();
        assert_eq!(adapted.model.as_deref(), Some("actual-model"));
    }

    #[test]
    fn input_text_is_appended_after_blank_line() {
        let request = CreateTaskRequest {
            model: Some("echo".to_string()),
            prompt: Some("summarize this".to_string()),
            input_text: Some("long document".to_string()),
            ..CreateTaskRequest::default()
        };
        let adapted = adapt_request(&request, &defaults()).unwrap();
        assert_eq!(adapted.input.prompt(), Some("summarize this\n\nlong document"));
    }

    #[test]
    fn messages_win_over_prompt() {
        let request = CreateTaskRequest {
            model: Some("echo".to_string()),
            prompt: Some("unused".to_string()),
            messages: Some(vec![MessageIn {
                role: Role::User,
                content: "hello".to_string(),
            }]),
            ..CreateTaskRequest::default()
        };
        let adapted = adapt_request(&request, &defaults()).unwrap();
        assert!(matches!(adapted.input, TaskInput::Messages(ref m) if m.len() == 1));
    }

    #[test]
    fn missing_input_is_a_validation_error() {
        let request = CreateTaskRequest {
            model: Some("echo".to_string()),
            ..CreateTaskRequest::default()
        };
        assert!(matches!(
            adapt_request(&request, &defaults()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn output_schema_aliases_response_format() {
        let request = CreateTaskRequest {
            model: Some("echo".to_string()),
            prompt: Some("hi".to_string()),
            output_schema: Some(json!({"type": "object"})),
            ..CreateTaskRequest::default()
        };
        let adapted = adapt_request(&request, &defaults()).unwrap();
        assert_eq!(adapted.params.response_format, Some(json!({"type": "object"})));
    }

    #[test]
    fn model_defaults_fill_unspecified_knobs() {
        let request = CreateTaskRequest {
            model: Some("gpt-4-turbo".to_string()),
            prompt: Some("hi".to_string()),
            max_tokens: Some(128),
            ..CreateTaskRequest::default()
        };
        let adapted = adapt_request(&request, &defaults()).unwrap();
        // Explicit field wins, family default fills the rest.
        assert_eq!(adapted.params.max_tokens, 128);
        assert!((adapted.params.temperature - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_range_knob_is_rejected() {
        let request = CreateTaskRequest {
            model: Some("echo".to_string()),
            prompt: Some("hi".to_string()),
            temperature: Some(9.0),
            ..CreateTaskRequest::default()
        };
        assert!(matches!(
            adapt_request(&request, &defaults()),
            Err(Error::Validation(_))
        ));
    }
}
