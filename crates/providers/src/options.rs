//! Reasoning-level translation shared across adapters.
//!
//! One table maps the provider-agnostic `ThinkingLevel` dial to Anthropic
//! token budgets, OpenAI effort strings, Google token budgets, and Google
//! thinking levels. Levels a model does not support fall back to the
//! highest supported lower level; non-reasoning models ignore everything
//! but `off`.

use unillm_core::model::{supports_xhigh, Model, ThinkingLevel};
use unillm_core::provider::{SimpleStreamOptions, StreamOptions, ThinkingBudgets};

/// Anthropic `budget_tokens` per level.
pub fn anthropic_thinking_budget(level: ThinkingLevel) -> u32 {
    match level {
        ThinkingLevel::Off => 0,
        ThinkingLevel::Minimal => 1024,
        ThinkingLevel::Low => 2048,
        ThinkingLevel::Medium => 4096,
        ThinkingLevel::High => 8192,
        ThinkingLevel::Xhigh => 16_384,
    }
}

/// OpenAI `reasoning_effort` string, `None` when thinking is off.
pub fn openai_reasoning_effort(model: &Model, level: ThinkingLevel) -> Option<&'static str> {
    match clamp_reasoning(model, level) {
        ThinkingLevel::Off => None,
        ThinkingLevel::Minimal => Some("minimal"),
        ThinkingLevel::Low => Some("low"),
        ThinkingLevel::Medium => Some("medium"),
        ThinkingLevel::High => Some("high"),
        ThinkingLevel::Xhigh => Some("xhigh"),
    }
}

/// Google thinking budget (tokens) for 2.x-generation models.
pub fn google_thinking_budget(model: &Model, level: ThinkingLevel, budgets: Option<&ThinkingBudgets>) -> i64 {
    if let Some(custom) = budgets.and_then(|b| b.get(level)) {
        return i64::from(custom);
    }

    // Per-model tables for the 2.5 generation.
    if model.id.contains("2.5-pro") {
        return match level {
            ThinkingLevel::Off => 0,
            ThinkingLevel::Minimal => 128,
            ThinkingLevel::Low => 2048,
            ThinkingLevel::Medium => 8192,
            ThinkingLevel::High => 32_768,
            ThinkingLevel::Xhigh => 32_768,
        };
    }
    if model.id.contains("2.5-flash") {
        return match level {
            ThinkingLevel::Off => 0,
            ThinkingLevel::Minimal => 128,
            ThinkingLevel::Low => 2048,
            ThinkingLevel::Medium => 8192,
            ThinkingLevel::High => 24_576,
            ThinkingLevel::Xhigh => 24_576,
        };
    }

    match level {
        ThinkingLevel::Off => 0,
        ThinkingLevel::Minimal => 512,
        ThinkingLevel::Low => 2048,
        ThinkingLevel::Medium => 8192,
        ThinkingLevel::High => 16_384,
        ThinkingLevel::Xhigh => 24_576,
    }
}

/// Google `thinking_level` request value for 3.x-generation models.
pub fn google_thinking_level(model: &Model, level: ThinkingLevel) -> &'static str {
    let is_pro = model.id.contains("3-pro");
    match level {
        ThinkingLevel::Off => "off",
        ThinkingLevel::Minimal | ThinkingLevel::Low => "low",
        ThinkingLevel::Medium => {
            if is_pro {
                // Gemini 3 Pro exposes only low/high.
                "high"
            } else {
                "medium"
            }
        }
        ThinkingLevel::High | ThinkingLevel::Xhigh => "high",
    }
}

/// Whether the model's requests use `thinking_level` instead of budgets.
pub fn is_gemini_3(model: &Model) -> bool {
    model.id.contains("gemini-3")
}

/// Clamp a level the model does not support down to the highest supported
/// lower level.
pub fn clamp_reasoning(model: &Model, level: ThinkingLevel) -> ThinkingLevel {
    if !model.reasoning {
        return ThinkingLevel::Off;
    }
    if level == ThinkingLevel::Xhigh && !supports_xhigh(model) {
        return ThinkingLevel::High;
    }
    level
}

/// Default `max_tokens` for a model: the model's limit capped at 32k.
pub fn default_max_tokens(model: &Model) -> u32 {
    if model.max_tokens > 0 {
        model.max_tokens.min(32_000)
    } else {
        32_000
    }
}

/// Fill base options from simple options, defaulting `max_tokens`.
pub fn build_base_options(model: &Model, options: &SimpleStreamOptions) -> StreamOptions {
    StreamOptions {
        temperature: options.temperature,
        max_tokens: Some(options.max_tokens.unwrap_or_else(|| default_max_tokens(model))),
        api_key: options.api_key.clone(),
        headers: options.headers.clone(),
        session_id: options.session_id.clone(),
        cancel: options.cancel.clone(),
        on_payload: options.on_payload.clone(),
    }
}

/// Budget-based thinking raises the token ceiling: the budget is added on
/// top of `max_tokens`, keeping at least 1,024 tokens of real output.
///
/// Returns `(adjusted_max_tokens, thinking_budget)`.
pub fn adjust_max_tokens_for_thinking(max_tokens: u32, thinking_budget: u32) -> (u32, u32) {
    const MIN_OUTPUT: u32 = 1024;
    let total = max_tokens + thinking_budget;
    if max_tokens < MIN_OUTPUT {
        (MIN_OUTPUT, total.saturating_sub(MIN_OUTPUT))
    } else {
        (total, thinking_budget)
    }
}
