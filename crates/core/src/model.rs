//! Model descriptors and the process-wide model registry.
//!
//! A `Model` is an immutable value describing one backend model: which API
//! protocol it speaks, where it lives, what it costs, and what it can do.
//! Models are registered at init (builtins or caller-supplied) and looked
//! up by `(provider, id)`.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use serde::{Deserialize, Serialize};

use crate::message::Usage;

/// Provider-agnostic reasoning dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    pub fn is_off(self) -> bool {
        self == ThinkingLevel::Off
    }
}

impl std::fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Xhigh => "xhigh",
        };
        write!(f, "{s}")
    }
}

/// Input modalities a model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputModality {
    Text,
    Image,
}

/// Cost per one million tokens, in USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

impl ModelCost {
    pub fn new(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Self {
        Self {
            input,
            output,
            cache_read,
            cache_write,
        }
    }
}

/// Which request field carries the output-token limit on a
/// Chat-Completions-compatible host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxTokensField {
    MaxCompletionTokens,
    MaxTokens,
}

/// How a Chat-Completions-compatible host expects thinking to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingFormat {
    Openai,
    Zai,
    Qwen,
}

/// Per-model overrides for Chat-Completions compatibility quirks.
/// `None` fields fall back to detection from provider id and base URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionsCompat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_developer_role: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_reasoning_effort: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_usage_in_streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_field: Option<MaxTokensField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_tool_result_name: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_assistant_after_tool_result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_thinking_as_text: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_mistral_tool_ids: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_format: Option<ThinkingFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_strict_mode: Option<bool>,
}

/// Model definition for the unified model system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Provider-scoped model id (e.g. "claude-sonnet-4-5").
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Which API protocol the model speaks (e.g. "anthropic-messages").
    pub api: String,
    /// Provider family (e.g. "anthropic", "github-copilot").
    pub provider: String,
    pub base_url: String,
    /// Whether the model can produce thinking blocks.
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default = "default_input")]
    pub input: Vec<InputModality>,
    #[serde(default)]
    pub cost: ModelCost,
    #[serde(default)]
    pub context_window: u64,
    #[serde(default)]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compat: Option<CompletionsCompat>,
}

fn default_input() -> Vec<InputModality> {
    vec![InputModality::Text]
}

impl Model {
    pub fn supports_images(&self) -> bool {
        self.input.contains(&InputModality::Image)
    }
}

/// Compute cost from the model's rate table, updating `usage.cost` in place.
pub fn calculate_cost(model: &Model, usage: &mut Usage) {
    let per = 1_000_000.0;
    usage.cost.input = model.cost.input / per * usage.input as f64;
    usage.cost.output = model.cost.output / per * usage.output as f64;
    usage.cost.cache_read = model.cost.cache_read / per * usage.cache_read as f64;
    usage.cost.cache_write = model.cost.cache_write / per * usage.cache_write as f64;
    usage.cost.total =
        usage.cost.input + usage.cost.output + usage.cost.cache_read + usage.cost.cache_write;
}

/// Whether a model accepts the `xhigh` thinking level.
pub fn supports_xhigh(model: &Model) -> bool {
    if model.id.contains("gpt-5.2") || model.id.contains("gpt-5.3") {
        return true;
    }
    if model.api == "anthropic-messages" {
        return model.id.contains("opus-4-6") || model.id.contains("opus-4.6");
    }
    false
}

static MODEL_REGISTRY: LazyLock<RwLock<HashMap<String, HashMap<String, Model>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register models for a provider. Replaces the provider's prior map.
pub fn register_models(provider: impl Into<String>, models: HashMap<String, Model>) {
    let mut registry = MODEL_REGISTRY.write().unwrap();
    registry.insert(provider.into(), models);
}

/// Look up a model by provider and model id.
pub fn get_model(provider: &str, model_id: &str) -> Option<Model> {
    let registry = MODEL_REGISTRY.read().unwrap();
    registry.get(provider).and_then(|m| m.get(model_id)).cloned()
}

/// All registered provider names, sorted.
pub fn get_providers() -> Vec<String> {
    let registry = MODEL_REGISTRY.read().unwrap();
    let mut names: Vec<String> = registry.keys().cloned().collect();
    names.sort();
    names
}

/// All models for a provider.
pub fn get_models(provider: &str) -> Vec<Model> {
    let registry = MODEL_REGISTRY.read().unwrap();
    registry
        .get(provider)
        .map(|m| m.values().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_model(provider: &str, id: &str) -> Model {
        Model {
            id: id.into(),
            name: id.into(),
            api: "anthropic-messages".into(),
            provider: provider.into(),
            base_url: "https://api.example.com".into(),
            reasoning: true,
            input: vec![InputModality::Text, InputModality::Image],
            cost: ModelCost::new(3.0, 15.0, 0.3, 3.75),
            context_window: 200_000,
            max_tokens: 64_000,
            headers: None,
            compat: None,
        }
    }

    #[test]
    fn cost_formula_covers_all_four_classes() {
        let model = test_model("t-cost", "m");
        let mut usage = Usage {
            input: 1_000_000,
            output: 1_000_000,
            cache_read: 1_000_000,
            cache_write: 1_000_000,
            ..Usage::default()
        };
        calculate_cost(&model, &mut usage);
        assert!((usage.cost.input - 3.0).abs() < 1e-10);
        assert!((usage.cost.output - 15.0).abs() < 1e-10);
        assert!((usage.cost.cache_read - 0.3).abs() < 1e-10);
        assert!((usage.cost.cache_write - 3.75).abs() < 1e-10);
        assert!((usage.cost.total - 22.05).abs() < 1e-10);
    }

    #[test]
    fn cost_scales_with_tokens() {
        let model = test_model("t-cost2", "m");
        let mut usage = Usage {
            input: 1000,
            output: 500,
            ..Usage::default()
        };
        calculate_cost(&model, &mut usage);
        // (1000 * 3.0 + 500 * 15.0) / 1M = 0.0105
        assert!((usage.cost.total - 0.0105).abs() < 1e-10);
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut models = HashMap::new();
        models.insert("m1".to_string(), test_model("t-reg", "m1"));
        register_models("t-reg", models);

        assert!(get_model("t-reg", "m1").is_some());
        assert!(get_model("t-reg", "missing").is_none());
        assert!(get_model("missing", "m1").is_none());
        assert!(get_providers().contains(&"t-reg".to_string()));
        assert_eq!(get_models("t-reg").len(), 1);
    }

    #[test]
    fn reregistration_replaces_prior_entry() {
        let mut models = HashMap::new();
        let mut first = test_model("t-replace", "m1");
        first.name = "first".into();
        models.insert("m1".to_string(), first);
        register_models("t-replace", models);

        let mut models = HashMap::new();
        let mut second = test_model("t-replace", "m1");
        second.name = "second".into();
        models.insert("m1".to_string(), second);
        register_models("t-replace", models);

        assert_eq!(get_model("t-replace", "m1").unwrap().name, "second");
    }

    #[test]
    fn xhigh_support() {
        let mut model = test_model("t-xhigh", "claude-opus-4-6");
        assert!(supports_xhigh(&model));
        model.id = "claude-sonnet-4-5".into();
        assert!(!supports_xhigh(&model));
        model.api = "openai-responses".into();
        model.id = "gpt-5.2".into();
        assert!(supports_xhigh(&model));
    }

    #[test]
    fn thinking_level_ordering() {
        assert!(ThinkingLevel::Off < ThinkingLevel::Minimal);
        assert!(ThinkingLevel::High < ThinkingLevel::Xhigh);
        assert_eq!(ThinkingLevel::Medium.to_string(), "medium");
    }
}
