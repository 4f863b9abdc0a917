//! OpenAI Codex (ChatGPT backend) Responses adapter.
//!
//! Raw SSE over the ChatGPT backend with a JWT access token: the account
//! id is pulled out of the token payload, requests carry `originator` and
//! `chatgpt-account-id` headers, and transient failures retry with
//! exponential backoff. Stream processing is shared with the Responses
//! adapter; the backend's `response.done` is folded into
//! `response.completed`.

use std::collections::HashMap;

use base64::Engine;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use unillm_core::event::{
    assistant_message_channel, AssistantMessageEvent, AssistantMessageSink, AssistantMessageStream,
};
use unillm_core::message::{AssistantMessage, Context};
use unillm_core::model::Model;
use unillm_core::provider::{PayloadHook, SimpleStreamOptions, StreamOptions};
use unillm_core::{env::get_env_api_key, Error};

use crate::adapter::{check_cancel, finish_stream, http_client, new_output, AdapterError};
use crate::openai_shared::{
    convert_responses_messages, convert_responses_tools, process_responses_stream,
    OPENAI_TOOL_CALL_PROVIDERS,
};
use crate::options::{build_base_options, openai_reasoning_effort};
use crate::sse::SseReader;

const DEFAULT_CODEX_BASE_URL: &str = "https://chatgpt.com/backend-api";
const JWT_CLAIM_PATH: &str = "https://api.openai.com/auth";
const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 1000;

/// Extended options for the Codex adapter.
#[derive(Clone, Default)]
pub struct CodexResponsesOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
    pub reasoning_effort: Option<String>,
    pub reasoning_summary: Option<String>,
    pub text_verbosity: Option<String>,
}

impl From<StreamOptions> for CodexResponsesOptions {
    fn from(options: StreamOptions) -> Self {
        Self {
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            api_key: options.api_key,
            headers: options.headers,
            session_id: options.session_id,
            cancel: options.cancel,
            on_payload: options.on_payload,
            ..Self::default()
        }
    }
}

/// Pull the ChatGPT account id out of the JWT payload.
fn extract_account_id(token: &str) -> Result<String, AdapterError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AdapterError::msg("Failed to extract accountId from token: invalid token"));
    }
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| AdapterError::msg(format!("Failed to extract accountId from token: {e}")))?;
    let payload: Value = serde_json::from_slice(&payload)
        .map_err(|e| AdapterError::msg(format!("Failed to extract accountId from token: {e}")))?;
    payload[JWT_CLAIM_PATH]["chatgpt_account_id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AdapterError::msg("Failed to extract accountId from token: no account ID in token"))
}

fn resolve_codex_url(base_url: &str) -> String {
    let raw = if base_url.trim().is_empty() { DEFAULT_CODEX_BASE_URL } else { base_url };
    let normalized = raw.trim_end_matches('/');
    if normalized.ends_with("/codex/responses") {
        normalized.to_string()
    } else if normalized.ends_with("/codex") {
        format!("{normalized}/responses")
    } else {
        format!("{normalized}/codex/responses")
    }
}

/// Some efforts are unavailable on some Codex models.
fn clamp_codex_effort(model_id: &str, effort: &str) -> String {
    let id = model_id.rsplit('/').next().unwrap_or(model_id);
    if (id.starts_with("gpt-5.2") || id.starts_with("gpt-5.3")) && effort == "minimal" {
        return "low".into();
    }
    if id == "gpt-5.1" && effort == "xhigh" {
        return "high".into();
    }
    if id == "gpt-5.1-codex-mini" {
        return if effort == "high" || effort == "xhigh" { "high" } else { "medium" }.into();
    }
    effort.to_string()
}

fn is_retryable_error(status: u16, error_text: &str) -> bool {
    if matches!(status, 429 | 500 | 502 | 503 | 504) {
        return true;
    }
    let lowered = error_text.to_lowercase();
    ["rate limit", "ratelimit", "rate-limit", "overloaded", "service unavailable", "upstream connect", "connection refused"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

/// Provider error bodies get a friendlier usage-limit message.
fn parse_error_message(raw: &str, status: u16) -> String {
    let fallback = if raw.is_empty() {
        format!("Request failed with status {status}")
    } else {
        raw.to_string()
    };
    let Ok(parsed) = serde_json::from_str::<Value>(raw) else { return fallback };
    let error = &parsed["error"];
    if error.is_null() {
        return fallback;
    }

    let code = error["code"].as_str().or_else(|| error["type"].as_str()).unwrap_or_default();
    let is_usage_limit = status == 429
        || ["usage_limit_reached", "usage_not_included", "rate_limit_exceeded"]
            .iter()
            .any(|needle| code.contains(needle));
    if is_usage_limit {
        let plan = error["plan_type"]
            .as_str()
            .map(|p| format!(" ({} plan)", p.to_lowercase()))
            .unwrap_or_default();
        return format!("You have hit your ChatGPT usage limit{plan}.");
    }
    error["message"].as_str().map(str::to_string).unwrap_or(fallback)
}

fn build_body(model: &Model, context: &Context, options: &CodexResponsesOptions) -> Value {
    let input = convert_responses_messages(model, context, OPENAI_TOOL_CALL_PROVIDERS, false);

    let mut body = json!({
        "model": model.id,
        "store": false,
        "stream": true,
        "instructions": context.system_prompt,
        "input": input,
        "text": {"verbosity": options.text_verbosity.as_deref().unwrap_or("medium")},
        "include": ["reasoning.encrypted_content"],
        "prompt_cache_key": options.session_id,
        "tool_choice": "auto",
        "parallel_tool_calls": true,
    });

    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }
    if !context.tools.is_empty() {
        body["tools"] = json!(convert_responses_tools(&context.tools, false));
    }
    if let Some(effort) = &options.reasoning_effort {
        body["reasoning"] = json!({
            "effort": clamp_codex_effort(&model.id, effort),
            "summary": options.reasoning_summary.as_deref().unwrap_or("auto"),
        });
    }

    body
}

/// Stream a response from the Codex backend.
pub fn stream_codex_responses(
    model: Model,
    context: Context,
    options: CodexResponsesOptions,
) -> AssistantMessageStream {
    let (sink, stream) = assistant_message_channel();
    let cancel = options.cancel.clone().unwrap_or_default();

    let task = tokio::spawn(async move {
        let mut output = new_output(&model);
        let result = run(&model, &context, &options, &mut output, &sink, &cancel).await;
        finish_stream(&sink, output, result, &cancel);
    });

    stream.with_task(task)
}

async fn run(
    model: &Model,
    context: &Context,
    options: &CodexResponsesOptions,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let token = options
        .api_key
        .clone()
        .or_else(|| get_env_api_key(&model.provider))
        .ok_or_else(|| AdapterError::msg(format!("No API key for provider: {}", model.provider)))?;
    let account_id = extract_account_id(&token)?;

    let body = build_body(model, context, options);
    if let Some(on_payload) = &options.on_payload {
        on_payload(&body);
    }

    let url = resolve_codex_url(&model.base_url);
    debug!(provider = %model.provider, model = %model.id, "Sending streaming request");
    let client = http_client();

    let mut response = None;
    for attempt in 0..=MAX_RETRIES {
        check_cancel(cancel)?;

        let mut request = client
            .post(&url)
            .header("Authorization", format!("Bearer {token}"))
            .header("chatgpt-account-id", &account_id)
            .header("OpenAI-Beta", "responses=experimental")
            .header("originator", "unillm")
            .header("accept", "text/event-stream")
            .header("content-type", "application/json");
        if let Some(session_id) = &options.session_id {
            request = request.header("session_id", session_id);
        }
        for (name, value) in model.headers.iter().flatten() {
            request = request.header(name.as_str(), value.as_str());
        }
        for (name, value) in options.headers.iter().flatten() {
            request = request.header(name.as_str(), value.as_str());
        }

        let attempt_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdapterError::Aborted),
            result = request.json(&body).send() => result,
        };

        match attempt_result {
            Ok(resp) if resp.status().is_success() => {
                response = Some(resp);
                break;
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                let error_text = resp.text().await.unwrap_or_default();
                if attempt < MAX_RETRIES && is_retryable_error(status, &error_text) {
                    let delay = BASE_DELAY_MS * 2u64.pow(attempt);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
                        _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                    }
                    continue;
                }
                return Err(AdapterError::msg(parse_error_message(&error_text, status)));
            }
            Err(err) => {
                if attempt < MAX_RETRIES {
                    let delay = BASE_DELAY_MS * 2u64.pow(attempt);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
                        _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                    }
                    continue;
                }
                return Err(err.into());
            }
        }
    }
    let response = response.ok_or_else(|| AdapterError::msg("Failed after retries"))?;

    sink.push(AssistantMessageEvent::Start { partial: output.clone() });

    let mut reader = SseReader::new(response, cancel.clone());
    process_responses_stream(&mut reader, model, output, sink, None, false).await?;

    if output.stop_reason.is_terminal_failure() {
        return Err(AdapterError::msg("An unknown error occurred"));
    }
    Ok(())
}

/// Stream using the simple API, mapping the reasoning level to effort.
pub fn stream_simple_codex_responses(
    model: Model,
    context: Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessageStream, Error> {
    let api_key = options
        .api_key
        .clone()
        .or_else(|| get_env_api_key(&model.provider))
        .ok_or_else(|| Error::MissingApiKey(model.provider.clone()))?;

    let base = build_base_options(&model, &options);
    let reasoning_effort = options
        .effective_reasoning()
        .and_then(|level| openai_reasoning_effort(&model, level))
        .map(str::to_string);

    let codex = CodexResponsesOptions {
        api_key: Some(api_key),
        reasoning_effort,
        ..CodexResponsesOptions::from(base)
    };
    Ok(stream_codex_responses(model, context, codex))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jwt(account_id: Option<&str>) -> String {
        let claims = match account_id {
            Some(id) => json!({JWT_CLAIM_PATH: {"chatgpt_account_id": id}}),
            None => json!({"sub": "nobody"}),
        };
        let payload =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("hdr.{payload}.sig")
    }

    #[test]
    fn account_id_extraction() {
        let token = fake_jwt(Some("acct_123"));
        assert_eq!(extract_account_id(&token).unwrap(), "acct_123");

        assert!(extract_account_id("not-a-jwt").is_err());
        assert!(extract_account_id(&fake_jwt(None)).is_err());
    }

    #[test]
    fn url_resolution() {
        assert_eq!(
            resolve_codex_url(""),
            "https://chatgpt.com/backend-api/codex/responses"
        );
        assert_eq!(
            resolve_codex_url("https://chatgpt.com/backend-api/"),
            "https://chatgpt.com/backend-api/codex/responses"
        );
        assert_eq!(
            resolve_codex_url("https://proxy.example/codex"),
            "https://proxy.example/codex/responses"
        );
        assert_eq!(
            resolve_codex_url("https://proxy.example/codex/responses"),
            "https://proxy.example/codex/responses"
        );
    }

    #[test]
    fn effort_clamping_per_model() {
        assert_eq!(clamp_codex_effort("gpt-5.2-codex", "minimal"), "low");
        assert_eq!(clamp_codex_effort("gpt-5.1", "xhigh"), "high");
        assert_eq!(clamp_codex_effort("gpt-5.1-codex-mini", "low"), "medium");
        assert_eq!(clamp_codex_effort("gpt-5.1-codex-mini", "xhigh"), "high");
        assert_eq!(clamp_codex_effort("gpt-5.2", "high"), "high");
    }

    #[test]
    fn retryable_errors() {
        assert!(is_retryable_error(429, ""));
        assert!(is_retryable_error(503, ""));
        assert!(is_retryable_error(400, "model overloaded, try later"));
        assert!(!is_retryable_error(400, "bad request"));
        assert!(!is_retryable_error(401, "unauthorized"));
    }

    #[test]
    fn usage_limit_errors_get_friendly_message() {
        let raw = r#"{"error":{"code":"usage_limit_reached","plan_type":"Plus"}}"#;
        let message = parse_error_message(raw, 429);
        assert!(message.contains("usage limit"));
        assert!(message.contains("plus plan"));

        let raw = r#"{"error":{"message":"invalid model"}}"#;
        assert_eq!(parse_error_message(raw, 404), "invalid model");
    }
}
