//! Built-in model definitions for all provider families.
//!
//! The commonly-used models per provider, with cost tables, context
//! windows, and compat/headers where a family needs them. Callers can
//! register additional models (or replace these) at any time before
//! streaming.

use std::collections::HashMap;

use unillm_core::model::{
    register_models, CompletionsCompat, InputModality, Model, ModelCost,
};

const ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const OPENAI_BASE: &str = "https://api.openai.com/v1";
const GOOGLE_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const BEDROCK_BASE: &str = "https://bedrock-runtime.us-east-1.amazonaws.com";
const CODEX_BASE: &str = "https://chatgpt.com/backend-api";
const COPILOT_BASE: &str = "https://api.individual.githubcopilot.com";

#[allow(clippy::too_many_arguments)]
fn model(
    id: &str,
    name: &str,
    api: &str,
    provider: &str,
    base_url: &str,
    reasoning: bool,
    cost: ModelCost,
    context_window: u64,
    max_tokens: u32,
) -> Model {
    Model {
        id: id.into(),
        name: name.into(),
        api: api.into(),
        provider: provider.into(),
        base_url: base_url.into(),
        reasoning,
        input: vec![InputModality::Text, InputModality::Image],
        cost,
        context_window,
        max_tokens,
        headers: None,
        compat: None,
    }
}

fn anthropic_models() -> HashMap<String, Model> {
    let rows: &[(&str, &str, bool, f64, f64, f64, f64, u32)] = &[
        ("claude-opus-4-6", "Claude Opus 4.6", true, 5.0, 25.0, 0.5, 6.25, 128_000),
        ("claude-opus-4-5", "Claude Opus 4.5 (latest)", true, 5.0, 25.0, 0.5, 6.25, 64_000),
        ("claude-opus-4-5-20251101", "Claude Opus 4.5", true, 5.0, 25.0, 0.5, 6.25, 64_000),
        ("claude-opus-4-1", "Claude Opus 4.1 (latest)", true, 15.0, 75.0, 1.5, 18.75, 32_000),
        ("claude-opus-4-1-20250805", "Claude Opus 4.1", true, 15.0, 75.0, 1.5, 18.75, 32_000),
        ("claude-sonnet-4-5", "Claude Sonnet 4.5 (latest)", true, 3.0, 15.0, 0.3, 3.75, 64_000),
        ("claude-sonnet-4-5-20250929", "Claude Sonnet 4.5", true, 3.0, 15.0, 0.3, 3.75, 64_000),
        ("claude-sonnet-4-0", "Claude Sonnet 4 (latest)", true, 3.0, 15.0, 0.3, 3.75, 64_000),
        ("claude-sonnet-4-20250514", "Claude Sonnet 4", true, 3.0, 15.0, 0.3, 3.75, 64_000),
        ("claude-3-7-sonnet-20250219", "Claude Sonnet 3.7", true, 3.0, 15.0, 0.3, 3.75, 64_000),
        ("claude-3-5-sonnet-20241022", "Claude Sonnet 3.5 v2", false, 3.0, 15.0, 0.3, 3.75, 8192),
        ("claude-haiku-4-5", "Claude Haiku 4.5 (latest)", true, 1.0, 5.0, 0.1, 1.25, 64_000),
        ("claude-haiku-4-5-20251001", "Claude Haiku 4.5", true, 1.0, 5.0, 0.1, 1.25, 64_000),
        ("claude-3-5-haiku-20241022", "Claude Haiku 3.5", false, 0.8, 4.0, 0.08, 1.0, 8192),
    ];
    rows.iter()
        .map(|&(id, name, reasoning, input, output, cache_read, cache_write, max_tokens)| {
            (
                id.to_string(),
                model(
                    id,
                    name,
                    "anthropic-messages",
                    "anthropic",
                    ANTHROPIC_BASE,
                    reasoning,
                    ModelCost::new(input, output, cache_read, cache_write),
                    200_000,
                    max_tokens,
                ),
            )
        })
        .collect()
}

fn openai_models() -> HashMap<String, Model> {
    let rows: &[(&str, &str, bool, f64, f64, f64, u64, u32)] = &[
        ("gpt-5.2", "GPT-5.2", true, 1.75, 14.0, 0.175, 400_000, 128_000),
        ("gpt-5.1", "GPT-5.1", true, 1.25, 10.0, 0.13, 400_000, 128_000),
        ("gpt-4.1", "GPT-4.1", false, 2.0, 8.0, 0.5, 1_047_576, 32_768),
        ("gpt-4.1-mini", "GPT-4.1 mini", false, 0.4, 1.6, 0.1, 1_047_576, 32_768),
        ("o4-mini", "o4-mini", true, 1.1, 4.4, 0.28, 200_000, 100_000),
        ("o3", "o3", true, 2.0, 8.0, 0.5, 200_000, 100_000),
        ("gpt-4o", "GPT-4o", false, 2.5, 10.0, 1.25, 128_000, 16_384),
        ("gpt-4o-mini", "GPT-4o mini", false, 0.15, 0.6, 0.08, 128_000, 16_384),
    ];
    rows.iter()
        .map(|&(id, name, reasoning, input, output, cache_read, context_window, max_tokens)| {
            (
                id.to_string(),
                model(
                    id,
                    name,
                    "openai-responses",
                    "openai",
                    OPENAI_BASE,
                    reasoning,
                    ModelCost::new(input, output, cache_read, 0.0),
                    context_window,
                    max_tokens,
                ),
            )
        })
        .collect()
}

fn google_models() -> HashMap<String, Model> {
    let rows: &[(&str, &str, bool, f64, f64, f64, u64, u32)] = &[
        ("gemini-3-pro-preview", "Gemini 3 Pro Preview", true, 2.0, 12.0, 0.2, 1_000_000, 64_000),
        ("gemini-3-flash-preview", "Gemini 3 Flash Preview", true, 0.5, 3.0, 0.05, 1_048_576, 65_536),
        ("gemini-2.5-pro", "Gemini 2.5 Pro", true, 1.25, 10.0, 0.31, 1_048_576, 65_536),
        ("gemini-2.5-flash", "Gemini 2.5 Flash", true, 0.3, 2.5, 0.075, 1_048_576, 65_536),
        ("gemini-2.0-flash", "Gemini 2.0 Flash", false, 0.1, 0.4, 0.025, 1_048_576, 8192),
    ];
    rows.iter()
        .map(|&(id, name, reasoning, input, output, cache_read, context_window, max_tokens)| {
            (
                id.to_string(),
                model(
                    id,
                    name,
                    "google-generative-ai",
                    "google",
                    GOOGLE_BASE,
                    reasoning,
                    ModelCost::new(input, output, cache_read, 0.0),
                    context_window,
                    max_tokens,
                ),
            )
        })
        .collect()
}

fn bedrock_models() -> HashMap<String, Model> {
    let rows: &[(&str, &str, bool, f64, f64, f64, f64, u32)] = &[
        ("anthropic.claude-opus-4-6-v1", "Claude Opus 4.6", true, 5.0, 25.0, 0.5, 6.25, 128_000),
        ("us.anthropic.claude-opus-4-6-v1", "Claude Opus 4.6 (US)", true, 5.0, 25.0, 0.5, 6.25, 128_000),
        ("anthropic.claude-opus-4-5-20251101-v1:0", "Claude Opus 4.5", true, 5.0, 25.0, 0.5, 6.25, 64_000),
        ("us.anthropic.claude-opus-4-5-20251101-v1:0", "Claude Opus 4.5 (US)", true, 5.0, 25.0, 0.5, 6.25, 64_000),
        ("anthropic.claude-sonnet-4-5-20250929-v1:0", "Claude Sonnet 4.5", true, 3.0, 15.0, 0.3, 3.75, 64_000),
        ("us.anthropic.claude-sonnet-4-5-20250929-v1:0", "Claude Sonnet 4.5 (US)", true, 3.0, 15.0, 0.3, 3.75, 64_000),
        ("anthropic.claude-haiku-4-5-20251001-v1:0", "Claude Haiku 4.5", true, 1.0, 5.0, 0.1, 1.25, 64_000),
        ("us.anthropic.claude-haiku-4-5-20251001-v1:0", "Claude Haiku 4.5 (US)", true, 1.0, 5.0, 0.1, 1.25, 64_000),
        ("anthropic.claude-3-5-sonnet-20241022-v2:0", "Claude Sonnet 3.5 v2", false, 3.0, 15.0, 0.3, 3.75, 8192),
        ("anthropic.claude-3-5-haiku-20241022-v1:0", "Claude Haiku 3.5", false, 0.8, 4.0, 0.08, 1.0, 8192),
    ];
    rows.iter()
        .map(|&(id, name, reasoning, input, output, cache_read, cache_write, max_tokens)| {
            (
                id.to_string(),
                model(
                    id,
                    name,
                    "bedrock-converse-stream",
                    "amazon-bedrock",
                    BEDROCK_BASE,
                    reasoning,
                    ModelCost::new(input, output, cache_read, cache_write),
                    200_000,
                    max_tokens,
                ),
            )
        })
        .collect()
}

fn codex_models() -> HashMap<String, Model> {
    let rows: &[(&str, &str, f64, f64, f64)] = &[
        ("gpt-5.1", "GPT-5.1", 1.25, 10.0, 0.125),
        ("gpt-5.1-codex-max", "GPT-5.1 Codex Max", 1.25, 10.0, 0.125),
        ("gpt-5.1-codex-mini", "GPT-5.1 Codex Mini", 0.25, 2.0, 0.025),
        ("gpt-5.2", "GPT-5.2", 1.75, 14.0, 0.175),
        ("gpt-5.2-codex", "GPT-5.2 Codex", 1.75, 14.0, 0.175),
        ("gpt-5.3-codex", "GPT-5.3 Codex", 1.75, 14.0, 0.175),
    ];
    rows.iter()
        .map(|&(id, name, input, output, cache_read)| {
            (
                id.to_string(),
                model(
                    id,
                    name,
                    "openai-codex-responses",
                    "openai-codex",
                    CODEX_BASE,
                    true,
                    ModelCost::new(input, output, cache_read, 0.0),
                    272_000,
                    128_000,
                ),
            )
        })
        .collect()
}

fn copilot_models() -> HashMap<String, Model> {
    let headers: HashMap<String, String> = [
        ("User-Agent", "GitHubCopilotChat/0.35.0"),
        ("Editor-Version", "vscode/1.107.0"),
        ("Editor-Plugin-Version", "copilot-chat/0.35.0"),
        ("Copilot-Integration-Id", "vscode-chat"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let compat = CompletionsCompat {
        supports_store: Some(false),
        supports_developer_role: Some(false),
        supports_reasoning_effort: Some(false),
        ..CompletionsCompat::default()
    };

    let completions_rows: &[(&str, &str, bool, u64, u32)] = &[
        ("claude-sonnet-4.5", "Claude Sonnet 4.5", true, 128_000, 16_000),
        ("claude-opus-4.5", "Claude Opus 4.5", true, 128_000, 16_000),
        ("claude-opus-4.6", "Claude Opus 4.6", true, 128_000, 64_000),
        ("claude-haiku-4.5", "Claude Haiku 4.5", true, 128_000, 16_000),
        ("gpt-4.1", "GPT-4.1", false, 128_000, 16_384),
        ("gemini-2.5-pro", "Gemini 2.5 Pro", false, 128_000, 64_000),
        ("gemini-3-pro-preview", "Gemini 3 Pro Preview", true, 128_000, 64_000),
    ];
    let mut models: HashMap<String, Model> = completions_rows
        .iter()
        .map(|&(id, name, reasoning, context_window, max_tokens)| {
            let mut m = model(
                id,
                name,
                "openai-completions",
                "github-copilot",
                COPILOT_BASE,
                reasoning,
                ModelCost::default(),
                context_window,
                max_tokens,
            );
            m.headers = Some(headers.clone());
            m.compat = Some(compat.clone());
            (id.to_string(), m)
        })
        .collect();

    // Copilot GPT-5 models speak the Responses API and take no compat.
    for &(id, name, context_window, max_tokens) in
        &[("gpt-5.2", "GPT-5.2", 128_000u64, 64_000u32), ("gpt-5.1", "GPT-5.1", 128_000, 128_000)]
    {
        let mut m = model(
            id,
            name,
            "openai-responses",
            "github-copilot",
            COPILOT_BASE,
            true,
            ModelCost::default(),
            context_window,
            max_tokens,
        );
        m.headers = Some(headers.clone());
        models.insert(id.to_string(), m);
    }

    models
}

/// Register all built-in models for all provider families.
pub fn register_builtin_models() {
    register_models("anthropic", anthropic_models());
    register_models("openai", openai_models());
    register_models("google", google_models());
    register_models("amazon-bedrock", bedrock_models());
    register_models("openai-codex", codex_models());
    register_models("github-copilot", copilot_models());
}
