//! Google Gemini CLI backend (Cloud Code Assist API) adapter.
//!
//! Raw SSE against `v1internal:streamGenerateContent` with OAuth access
//! tokens. Credentials come from the caller (`api_key` as JSON
//! `{"token": …, "projectId": …}`) or the Gemini CLI's credential cache
//! (`~/.gemini/oauth_creds.json`), refreshed against Google's token
//! endpoint when expired. Requests and responses are wrapped in the
//! Cloud Code envelope; rate limits retry with the server-provided delay.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use unillm_core::event::{
    assistant_message_channel, AssistantMessageEvent, AssistantMessageSink, AssistantMessageStream,
};
use unillm_core::message::{AssistantMessage, Context};
use unillm_core::model::Model;
use unillm_core::provider::{PayloadHook, SimpleStreamOptions};

use crate::adapter::{check_cancel, finish_stream, http_client, new_output, AdapterError};
use crate::google::resolve_thinking;
use crate::google_shared::{
    build_generation_config, convert_messages, convert_tools, GoogleStreamProcessor, GoogleThinking,
};
use crate::options::build_base_options;
use crate::sse::SseReader;

const DEFAULT_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
// Public OAuth client of the Gemini CLI.
const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";
const MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 1000;
const MAX_RETRY_DELAY_MS: u64 = 60_000;
const CLAUDE_THINKING_BETA_HEADER: &str = "interleaved-thinking-2025-05-14";

/// Extended options for the Gemini CLI adapter.
#[derive(Clone, Default)]
pub struct GoogleGeminiCliOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// JSON-encoded `{"token": …, "projectId": …}`; falls back to the
    /// CLI's credential cache.
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
    pub tool_choice: Option<String>,
    pub thinking: GoogleThinking,
    pub max_retry_delay_ms: Option<u64>,
}

struct CloudCodeCredentials {
    token: String,
    project_id: String,
}

fn parse_credentials(api_key: &str, fallback_project: Option<&str>) -> Option<CloudCodeCredentials> {
    let parsed: Value = serde_json::from_str(api_key).ok()?;
    let token = parsed["token"].as_str()?.to_string();
    let project_id = parsed["projectId"]
        .as_str()
        .or(fallback_project)?
        .to_string();
    if token.is_empty() || project_id.is_empty() {
        return None;
    }
    Some(CloudCodeCredentials { token, project_id })
}

fn oauth_cache_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".gemini/oauth_creds.json"))
}

/// Load the Gemini CLI credential cache, refreshing the access token when
/// it is expired. The refreshed token is written back to the cache.
async fn load_cached_credentials(
    project_id: Option<&str>,
    cancel: &CancellationToken,
) -> Result<CloudCodeCredentials, AdapterError> {
    let path = oauth_cache_path().ok_or_else(|| {
        AdapterError::msg("Google Cloud Code Assist requires OAuth authentication.")
    })?;
    let raw = std::fs::read_to_string(&path).map_err(|_| {
        AdapterError::msg("Google Cloud Code Assist requires OAuth authentication.")
    })?;
    let mut creds: Value = serde_json::from_str(&raw)
        .map_err(|_| AdapterError::msg("Invalid Google Cloud Code Assist credentials."))?;

    let project_id = project_id
        .map(str::to_string)
        .or_else(|| std::env::var("GOOGLE_CLOUD_PROJECT").ok())
        .or_else(|| creds["projectId"].as_str().map(str::to_string))
        .ok_or_else(|| AdapterError::msg("Missing projectId in Google Cloud credentials."))?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let expired = creds["expiry_date"].as_i64().map_or(true, |e| e <= now_ms + 60_000);

    if !expired {
        if let Some(token) = creds["access_token"].as_str() {
            return Ok(CloudCodeCredentials {
                token: token.to_string(),
                project_id,
            });
        }
    }

    let refresh_token = creds["refresh_token"]
        .as_str()
        .ok_or_else(|| AdapterError::msg("Invalid Google Cloud Code Assist credentials."))?
        .to_string();

    let refresh = http_client()
        .post(OAUTH_TOKEN_URL)
        .form(&[
            ("client_id", OAUTH_CLIENT_ID),
            ("client_secret", OAUTH_CLIENT_SECRET),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .send();
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
        response = refresh => response?,
    };
    if !response.status().is_success() {
        return Err(AdapterError::msg(format!(
            "OAuth token refresh failed ({})",
            response.status()
        )));
    }
    let refreshed: Value = response.json().await.map_err(AdapterError::from)?;
    let token = refreshed["access_token"]
        .as_str()
        .ok_or_else(|| AdapterError::msg("OAuth token refresh returned no access token"))?
        .to_string();

    creds["access_token"] = json!(token);
    if let Some(expires_in) = refreshed["expires_in"].as_i64() {
        creds["expiry_date"] = json!(now_ms + expires_in * 1000);
    }
    if let Err(error) = std::fs::write(&path, creds.to_string()) {
        warn!(error = %error, "Failed to update OAuth credential cache");
    }

    Ok(CloudCodeCredentials { token, project_id })
}

fn is_claude_thinking_model(model_id: &str) -> bool {
    let normalized = model_id.to_lowercase();
    normalized.contains("claude") && normalized.contains("thinking")
}

fn is_retryable_error(status: u16, error_text: &str) -> bool {
    if matches!(status, 429 | 500 | 502 | 503 | 504) {
        return true;
    }
    let lowered = error_text.to_lowercase();
    ["resource exhausted", "resource_exhausted", "rate limit", "ratelimit", "overloaded", "service unavailable", "other side closed"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

/// Server-provided retry delay in milliseconds (plus a one-second pad),
/// from the `Retry-After` header or a `"retryDelay": "34.07s"` body field.
fn extract_retry_delay(error_text: &str, retry_after: Option<&str>) -> Option<u64> {
    if let Some(seconds) = retry_after.and_then(|v| v.parse::<f64>().ok()) {
        if seconds.is_finite() && seconds > 0.0 {
            return Some((seconds * 1000.0).ceil() as u64 + 1000);
        }
    }

    let idx = error_text.find("\"retryDelay\"")?;
    let rest = error_text[idx + "\"retryDelay\"".len()..]
        .trim_start()
        .strip_prefix(':')?
        .trim_start()
        .strip_prefix('"')?;
    let value = &rest[..rest.find('"')?];
    let (number, is_ms) = match value.strip_suffix("ms") {
        Some(v) => (v, true),
        None => (value.strip_suffix('s')?, false),
    };
    let number: f64 = number.parse().ok()?;
    if !number.is_finite() || number <= 0.0 {
        return None;
    }
    let ms = if is_ms { number } else { number * 1000.0 };
    Some(ms.ceil() as u64 + 1000)
}

fn extract_error_message(error_text: &str) -> String {
    serde_json::from_str::<Value>(error_text)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| error_text.to_string())
}

fn build_envelope(
    model: &Model,
    context: &Context,
    project_id: &str,
    options: &GoogleGeminiCliOptions,
) -> Value {
    let mut request = json!({
        "contents": convert_messages(model, context),
    });

    if let Some(session_id) = &options.session_id {
        request["sessionId"] = json!(session_id);
    }
    if let Some(system) = &context.system_prompt {
        request["systemInstruction"] = json!({"parts": [{"text": system}]});
    }

    // v1internal wants the uppercase ThinkingLevel enum.
    let thinking = GoogleThinking {
        level: options.thinking.level.as_ref().map(|l| l.to_uppercase()),
        ..options.thinking.clone()
    };
    let config = build_generation_config(model, options.temperature, options.max_tokens, &thinking);
    if config.as_object().is_some_and(|o| !o.is_empty()) {
        request["generationConfig"] = config;
    }

    if !context.tools.is_empty() {
        request["tools"] = convert_tools(&context.tools);
        if let Some(choice) = &options.tool_choice {
            let mode = match choice.as_str() {
                "none" => "NONE",
                "any" => "ANY",
                _ => "AUTO",
            };
            request["toolConfig"] = json!({"functionCallingConfig": {"mode": mode}});
        }
    }

    json!({
        "project": project_id,
        "model": model.id,
        "request": request,
        "userAgent": "unillm",
        "requestId": format!("unillm-{}", uuid::Uuid::new_v4().simple()),
    })
}

/// Stream a response from the Cloud Code Assist API.
pub fn stream_google_gemini_cli(
    model: Model,
    context: Context,
    options: GoogleGeminiCliOptions,
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
    options: &GoogleGeminiCliOptions,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let credentials = match &options.api_key {
        Some(api_key) => parse_credentials(api_key, options.project_id.as_deref())
            .ok_or_else(|| AdapterError::msg("Invalid Google Cloud Code Assist credentials."))?,
        None => load_cached_credentials(options.project_id.as_deref(), cancel).await?,
    };

    let body = build_envelope(model, context, &credentials.project_id, options);
    if let Some(on_payload) = &options.on_payload {
        on_payload(&body);
    }

    let endpoint = if model.base_url.trim().is_empty() {
        DEFAULT_ENDPOINT.to_string()
    } else {
        model.base_url.trim_end_matches('/').to_string()
    };
    let url = format!("{endpoint}/v1internal:streamGenerateContent?alt=sse");
    debug!(provider = %model.provider, model = %model.id, "Sending streaming request");
    let client = http_client();

    let mut response = None;
    for attempt in 0..=MAX_RETRIES {
        check_cancel(cancel)?;

        let mut request = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", credentials.token))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .header("User-Agent", "google-cloud-sdk vscode_cloudshelleditor/0.1")
            .header("X-Goog-Api-Client", "gl-node/22.17.0");
        if is_claude_thinking_model(&model.id) {
            request = request.header("anthropic-beta", CLAUDE_THINKING_BETA_HEADER);
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
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let error_text = resp.text().await.unwrap_or_default();

                if attempt < MAX_RETRIES && is_retryable_error(status, &error_text) {
                    let server_delay = extract_retry_delay(&error_text, retry_after.as_deref());
                    let max_delay = options.max_retry_delay_ms.unwrap_or(MAX_RETRY_DELAY_MS);
                    if let Some(delay) = server_delay {
                        if delay > max_delay {
                            return Err(AdapterError::msg(format!(
                                "Server requested {}s retry delay (max: {}s). {}",
                                delay.div_ceil(1000),
                                max_delay.div_ceil(1000),
                                extract_error_message(&error_text)
                            )));
                        }
                    }
                    let delay = server_delay.unwrap_or(BASE_DELAY_MS * 2u64.pow(attempt));
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
                        _ = tokio::time::sleep(std::time::Duration::from_millis(delay)) => {}
                    }
                    continue;
                }
                return Err(AdapterError::msg(format!(
                    "Cloud Code Assist API error ({status}): {}",
                    extract_error_message(&error_text)
                )));
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
    let response = response.ok_or_else(|| AdapterError::msg("Failed to get response after retries"))?;

    sink.push(AssistantMessageEvent::Start { partial: output.clone() });

    let mut processor = GoogleStreamProcessor::new();
    let mut reader = SseReader::new(response, cancel.clone());
    while let Some(event) = reader.next().await? {
        let chunk: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => continue,
        };
        // Cloud Code wraps every chunk in a `response` envelope.
        let Some(inner) = chunk.get("response") else { continue };
        processor.process_chunk(inner, model, output, sink);
    }
    processor.finish_open_block(output, sink);

    if output.stop_reason.is_terminal_failure() {
        return Err(AdapterError::msg("An unknown error occurred"));
    }
    Ok(())
}

/// Stream using the simple API with reasoning support.
pub fn stream_simple_google_gemini_cli(
    model: Model,
    context: Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessageStream, unillm_core::Error> {
    let base = build_base_options(&model, &options);
    let thinking = resolve_thinking(&model, &options);

    let cli = GoogleGeminiCliOptions {
        temperature: base.temperature,
        max_tokens: base.max_tokens,
        api_key: base.api_key,
        headers: base.headers,
        session_id: base.session_id,
        cancel: base.cancel,
        on_payload: base.on_payload,
        thinking,
        ..GoogleGeminiCliOptions::default()
    };
    Ok(stream_google_gemini_cli(model, context, cli))
}

#[cfg(test)]
mod tests {
    use super::*;
    use unillm_core::message::{Message, StopReason};
    use unillm_core::model::{InputModality, ModelCost};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model(base_url: &str) -> Model {
        Model {
            id: "gemini-2.5-pro".into(),
            name: "Gemini 2.5 Pro".into(),
            api: "google-gemini-cli".into(),
            provider: "google-gemini-cli".into(),
            base_url: base_url.into(),
            reasoning: true,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost::default(),
            context_window: 1_048_576,
            max_tokens: 65_536,
            headers: None,
            compat: None,
        }
    }

    fn creds() -> String {
        json!({"token": "ya29.test", "projectId": "proj-1"}).to_string()
    }

    #[test]
    fn credential_parsing() {
        let parsed = parse_credentials(&creds(), None).unwrap();
        assert_eq!(parsed.token, "ya29.test");
        assert_eq!(parsed.project_id, "proj-1");

        assert!(parse_credentials("not json", None).is_none());
        assert!(parse_credentials(r#"{"token": ""}"#, None).is_none());
        // Project can come from the fallback.
        let parsed = parse_credentials(r#"{"token": "t"}"#, Some("fallback")).unwrap();
        assert_eq!(parsed.project_id, "fallback");
    }

    #[test]
    fn retry_delay_extraction() {
        assert_eq!(extract_retry_delay("", Some("2")), Some(3000));
        let body = r#"{"error": {"details": [{"retryDelay": "34s"}]}}"#;
        assert_eq!(extract_retry_delay(body, None), Some(35_000));
        assert_eq!(extract_retry_delay("no delay here", None), None);
    }

    #[test]
    fn claude_thinking_detection() {
        assert!(is_claude_thinking_model("claude-sonnet-4-5-thinking"));
        assert!(!is_claude_thinking_model("claude-sonnet-4-5"));
        assert!(!is_claude_thinking_model("gemini-3-pro"));
    }

    #[test]
    fn envelope_carries_project_and_wrapped_request() {
        let m = model("");
        let context = Context {
            system_prompt: Some("terse".into()),
            messages: vec![Message::user("hi")],
            ..Context::default()
        };
        let options = GoogleGeminiCliOptions {
            thinking: GoogleThinking {
                enabled: true,
                budget_tokens: None,
                level: Some("high".into()),
            },
            ..GoogleGeminiCliOptions::default()
        };
        let envelope = build_envelope(&m, &context, "proj-1", &options);

        assert_eq!(envelope["project"], "proj-1");
        assert_eq!(envelope["model"], "gemini-2.5-pro");
        assert_eq!(
            envelope["request"]["generationConfig"]["thinkingConfig"]["thinkingLevel"],
            "HIGH"
        );
        assert_eq!(envelope["request"]["systemInstruction"]["parts"][0]["text"], "terse");
    }

    #[tokio::test]
    async fn streams_wrapped_chunks() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]},\"finishReason\":\"STOP\"}]}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let message = stream_google_gemini_cli(
            model(&server.uri()),
            Context {
                messages: vec![Message::user("hello")],
                ..Context::default()
            },
            GoogleGeminiCliOptions {
                api_key: Some(creds()),
                ..GoogleGeminiCliOptions::default()
            },
        )
        .result()
        .await
        .unwrap();

        assert_eq!(message.text(), "Hi");
        assert_eq!(message.stop_reason, StopReason::Stop);
    }

    #[tokio::test]
    async fn retries_on_rate_limit_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(429).set_body_string(
                r#"{"error":{"message":"rate limit"}}"#,
            ))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(
                        "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"after retry\"}]},\"finishReason\":\"STOP\"}]}}\n\n",
                    ),
            )
            .mount(&server)
            .await;

        let message = stream_google_gemini_cli(
            model(&server.uri()),
            Context {
                messages: vec![Message::user("hello")],
                ..Context::default()
            },
            GoogleGeminiCliOptions {
                api_key: Some(creds()),
                ..GoogleGeminiCliOptions::default()
            },
        )
        .result()
        .await
        .unwrap();
        assert_eq!(message.text(), "after retry");
    }
}
