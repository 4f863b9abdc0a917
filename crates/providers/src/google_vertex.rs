//! Google Vertex AI (Gemini via ADC) adapter.
//!
//! Same chunk processing as the GenAI adapter; authentication uses an
//! Application Default Credentials access token (caller-supplied via
//! `api_key`, the GCE metadata server, or `gcloud auth
//! print-access-token`), and the endpoint is built from project/location.

use std::collections::HashMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use unillm_core::event::{
    assistant_message_channel, AssistantMessageEvent, AssistantMessageSink, AssistantMessageStream,
};
use unillm_core::message::{AssistantMessage, Context};
use unillm_core::model::Model;
use unillm_core::provider::{PayloadHook, SimpleStreamOptions};

use crate::adapter::{check_cancel, finish_stream, http_client, new_output, AdapterError};
use crate::google::{build_request_body, resolve_thinking, GoogleOptions};
use crate::google_shared::GoogleStreamProcessor;
use crate::options::build_base_options;
use crate::sse::SseReader;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Extended options for the Vertex adapter.
#[derive(Clone, Default)]
pub struct GoogleVertexOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// ADC access token; resolved from the environment when absent.
    pub access_token: Option<String>,
    pub project: Option<String>,
    pub location: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
    pub tool_choice: Option<String>,
    pub thinking: crate::google_shared::GoogleThinking,
}

fn resolve_project(options: &GoogleVertexOptions) -> Result<String, AdapterError> {
    options
        .project
        .clone()
        .or_else(|| std::env::var("GOOGLE_CLOUD_PROJECT").ok())
        .or_else(|| std::env::var("GCLOUD_PROJECT").ok())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            AdapterError::msg(
                "Vertex AI requires a project ID. Set GOOGLE_CLOUD_PROJECT/GCLOUD_PROJECT or pass project in options.",
            )
        })
}

fn resolve_location(options: &GoogleVertexOptions) -> Result<String, AdapterError> {
    options
        .location
        .clone()
        .or_else(|| std::env::var("GOOGLE_CLOUD_LOCATION").ok())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| {
            AdapterError::msg("Vertex AI requires a location. Set GOOGLE_CLOUD_LOCATION or pass location in options.")
        })
}

/// Mint an ADC access token: metadata server first, then gcloud.
async fn resolve_access_token(cancel: &CancellationToken) -> Result<String, AdapterError> {
    let metadata = http_client()
        .get(METADATA_TOKEN_URL)
        .header("Metadata-Flavor", "Google")
        .timeout(std::time::Duration::from_secs(2))
        .send();
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
        response = metadata => response,
    };
    if let Ok(response) = response {
        if response.status().is_success() {
            if let Ok(body) = response.json::<Value>().await {
                if let Some(token) = body["access_token"].as_str() {
                    return Ok(token.to_string());
                }
            }
        }
    }

    let gcloud = tokio::process::Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output();
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
        output = gcloud => output,
    }
    .map_err(|e| AdapterError::msg(format!("Failed to resolve ADC credentials: {e}")))?;

    if !output.status.success() {
        return Err(AdapterError::msg(
            "Failed to resolve ADC credentials: gcloud auth print-access-token failed",
        ));
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(AdapterError::msg("Failed to resolve ADC credentials: empty token"));
    }
    Ok(token)
}

fn vertex_url(model: &Model, project: &str, location: &str) -> String {
    let host = if location == "global" {
        "https://aiplatform.googleapis.com".to_string()
    } else {
        format!("https://{location}-aiplatform.googleapis.com")
    };
    format!(
        "{host}/v1/projects/{project}/locations/{location}/publishers/google/models/{}:streamGenerateContent?alt=sse",
        model.id
    )
}

/// Stream a response from Vertex AI.
pub fn stream_google_vertex(
    model: Model,
    context: Context,
    options: GoogleVertexOptions,
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
    options: &GoogleVertexOptions,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let project = resolve_project(options)?;
    let location = resolve_location(options)?;
    let token = match &options.access_token {
        Some(token) if token != unillm_core::env::AUTHENTICATED => token.clone(),
        _ => resolve_access_token(cancel).await?,
    };

    let google_options = GoogleOptions {
        temperature: options.temperature,
        max_tokens: options.max_tokens,
        tool_choice: options.tool_choice.clone(),
        thinking: options.thinking.clone(),
        ..GoogleOptions::default()
    };
    let body = build_request_body(model, context, &google_options);
    if let Some(on_payload) = &options.on_payload {
        on_payload(&body);
    }

    // An explicit base URL (tests, proxies) overrides the regional host.
    let url = if model.base_url.is_empty() {
        vertex_url(model, &project, &location)
    } else {
        format!(
            "{}/projects/{project}/locations/{location}/publishers/google/models/{}:streamGenerateContent?alt=sse",
            model.base_url.trim_end_matches('/'),
            model.id
        )
    };
    debug!(provider = %model.provider, model = %model.id, project = %project, location = %location, "Sending streaming request");

    let mut request = http_client()
        .post(&url)
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/json");
    for (name, value) in model.headers.iter().flatten() {
        request = request.header(name.as_str(), value.as_str());
    }
    for (name, value) in options.headers.iter().flatten() {
        request = request.header(name.as_str(), value.as_str());
    }

    check_cancel(cancel)?;
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
        response = request.json(&body).send() => response?,
    };

    let status = response.status();
    if !status.is_success() {
        let error_body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&error_body)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or(error_body);
        return Err(AdapterError::msg(format!("Vertex AI error ({status}): {message}")));
    }

    sink.push(AssistantMessageEvent::Start { partial: output.clone() });

    let mut processor = GoogleStreamProcessor::new();
    let mut reader = SseReader::new(response, cancel.clone());
    while let Some(event) = reader.next().await? {
        let chunk: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(_) => continue,
        };
        processor.process_chunk(&chunk, model, output, sink);
    }
    processor.finish_open_block(output, sink);

    if output.stop_reason.is_terminal_failure() {
        return Err(AdapterError::msg("An unknown error occurred"));
    }
    Ok(())
}

/// Stream using the simple API with reasoning support.
pub fn stream_simple_google_vertex(
    model: Model,
    context: Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessageStream, unillm_core::Error> {
    let base = build_base_options(&model, &options);
    let thinking = resolve_thinking(&model, &options);

    let vertex = GoogleVertexOptions {
        temperature: base.temperature,
        max_tokens: base.max_tokens,
        access_token: base.api_key,
        headers: base.headers,
        session_id: base.session_id,
        cancel: base.cancel,
        on_payload: base.on_payload,
        thinking,
        ..GoogleVertexOptions::default()
    };
    Ok(stream_google_vertex(model, context, vertex))
}
