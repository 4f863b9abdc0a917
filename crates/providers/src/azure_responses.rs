//! Azure OpenAI Responses API adapter.
//!
//! Same wire protocol as the OpenAI Responses adapter, with Azure's
//! `api-key` header, resource-based URL building, and deployment-name
//! mapping (`AZURE_OPENAI_DEPLOYMENT_NAME_MAP="model=deployment,…"`).

use std::collections::HashMap;

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
};
use crate::options::{build_base_options, openai_reasoning_effort};
use crate::sse::SseReader;

const DEFAULT_AZURE_API_VERSION: &str = "v1";
const AZURE_TOOL_CALL_PROVIDERS: &[&str] =
    &["openai", "openai-codex", "opencode", "azure-openai-responses"];

/// Extended options for the Azure Responses adapter.
#[derive(Clone, Default)]
pub struct AzureResponsesOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub on_payload: Option<PayloadHook>,
    pub reasoning_effort: Option<String>,
    pub reasoning_summary: Option<String>,
    pub azure_api_version: Option<String>,
    pub azure_resource_name: Option<String>,
    pub azure_base_url: Option<String>,
    pub azure_deployment_name: Option<String>,
}

impl From<StreamOptions> for AzureResponsesOptions {
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

/// `"model=deployment,other=dep2"` → map.
fn parse_deployment_name_map(value: Option<&str>) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let Some(value) = value else { return result };
    for entry in value.split(',') {
        let Some((model, deployment)) = entry.trim().split_once('=') else { continue };
        let (model, deployment) = (model.trim(), deployment.trim());
        if !model.is_empty() && !deployment.is_empty() {
            result.insert(model.to_string(), deployment.to_string());
        }
    }
    result
}

fn resolve_deployment_name(model: &Model, options: &AzureResponsesOptions) -> String {
    if let Some(name) = &options.azure_deployment_name {
        return name.clone();
    }
    let env_map = std::env::var("AZURE_OPENAI_DEPLOYMENT_NAME_MAP").ok();
    parse_deployment_name_map(env_map.as_deref())
        .remove(&model.id)
        .unwrap_or_else(|| model.id.clone())
}

fn resolve_azure_base(model: &Model, options: &AzureResponsesOptions) -> Result<(String, String), AdapterError> {
    let api_version = options
        .azure_api_version
        .clone()
        .or_else(|| std::env::var("AZURE_OPENAI_API_VERSION").ok())
        .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string());

    let mut base_url = options
        .azure_base_url
        .clone()
        .filter(|url| !url.trim().is_empty())
        .or_else(|| std::env::var("AZURE_OPENAI_BASE_URL").ok().filter(|url| !url.trim().is_empty()));

    if base_url.is_none() {
        if let Some(resource) = options
            .azure_resource_name
            .clone()
            .or_else(|| std::env::var("AZURE_OPENAI_RESOURCE_NAME").ok())
        {
            base_url = Some(format!("https://{resource}.openai.azure.com/openai/v1"));
        }
    }
    let base_url = base_url
        .or_else(|| Some(model.base_url.clone()).filter(|url| !url.is_empty()))
        .ok_or_else(|| AdapterError::msg("Azure OpenAI base URL is required"))?;

    Ok((base_url.trim_end_matches('/').to_string(), api_version))
}

fn build_body(model: &Model, context: &Context, options: &AzureResponsesOptions, deployment: &str) -> Value {
    let mut input = convert_responses_messages(model, context, AZURE_TOOL_CALL_PROVIDERS, true);

    let mut body = json!({
        "model": deployment,
        "stream": true,
    });

    if let Some(session_id) = &options.session_id {
        body["prompt_cache_key"] = json!(session_id);
    }
    if let Some(max_tokens) = options.max_tokens {
        body["max_output_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }
    if !context.tools.is_empty() {
        body["tools"] = json!(convert_responses_tools(&context.tools, false));
    }

    if model.reasoning {
        if options.reasoning_effort.is_some() || options.reasoning_summary.is_some() {
            body["reasoning"] = json!({
                "effort": options.reasoning_effort.as_deref().unwrap_or("medium"),
                "summary": options.reasoning_summary.as_deref().unwrap_or("auto"),
            });
            body["include"] = json!(["reasoning.encrypted_content"]);
        } else if model.name.to_lowercase().starts_with("gpt-5") {
            input.push(json!({
                "role": "developer",
                "content": [{"type": "input_text", "text": "# Juice: 0 !important"}],
            }));
        }
    }

    body["input"] = json!(input);
    body
}

/// Stream a response from the Azure OpenAI Responses API.
pub fn stream_azure_responses(
    model: Model,
    context: Context,
    options: AzureResponsesOptions,
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
    options: &AzureResponsesOptions,
    output: &mut AssistantMessage,
    sink: &AssistantMessageSink,
    cancel: &CancellationToken,
) -> Result<(), AdapterError> {
    let api_key = options
        .api_key
        .clone()
        .or_else(|| get_env_api_key(&model.provider))
        .ok_or_else(|| AdapterError::msg("Azure OpenAI API key is required"))?;

    let deployment = resolve_deployment_name(model, options);
    let (base_url, api_version) = resolve_azure_base(model, options)?;
    let body = build_body(model, context, options, &deployment);
    if let Some(on_payload) = &options.on_payload {
        on_payload(&body);
    }

    let url = format!("{base_url}/responses?api-version={api_version}");
    debug!(provider = %model.provider, model = %model.id, deployment = %deployment, "Sending streaming request");

    let mut request = http_client()
        .post(&url)
        .header("api-key", &api_key)
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
        return Err(AdapterError::msg(format!(
            "Azure OpenAI API error ({status}): {error_body}"
        )));
    }

    sink.push(AssistantMessageEvent::Start { partial: output.clone() });

    let mut reader = SseReader::new(response, cancel.clone());
    process_responses_stream(&mut reader, model, output, sink, None, false).await?;

    if output.stop_reason.is_terminal_failure() {
        return Err(AdapterError::msg("An unknown error occurred"));
    }
    Ok(())
}

/// Stream using the simple API, mapping the reasoning level to effort.
pub fn stream_simple_azure_responses(
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

    let azure = AzureResponsesOptions {
        api_key: Some(api_key),
        reasoning_effort,
        ..AzureResponsesOptions::from(base)
    };
    Ok(stream_azure_responses(model, context, azure))
}
