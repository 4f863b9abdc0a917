//! Environment-based API key resolution for LLM providers.
//!
//! Resolution order for every adapter: caller-supplied `api_key` in the
//! options, then the environment variables here, then provider-specific
//! chains (AWS credential chain, Google ADC, OAuth refresh) handled by
//! the adapters themselves.

use std::path::PathBuf;

/// Sentinel returned for providers whose auth is ambient (ADC, AWS chain)
/// rather than a literal key.
pub const AUTHENTICATED: &str = "<authenticated>";

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn has_vertex_adc_credentials() -> bool {
    if let Some(path) = env("GOOGLE_APPLICATION_CREDENTIALS") {
        return PathBuf::from(path).exists();
    }
    std::env::var("HOME")
        .map(|home| {
            PathBuf::from(home)
                .join(".config/gcloud/application_default_credentials.json")
                .exists()
        })
        .unwrap_or(false)
}

fn has_bedrock_credentials() -> bool {
    const CHAIN_VARS: [&str; 5] = [
        "AWS_PROFILE",
        "AWS_BEARER_TOKEN_BEDROCK",
        "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI",
        "AWS_CONTAINER_CREDENTIALS_FULL_URI",
        "AWS_WEB_IDENTITY_TOKEN_FILE",
    ];
    if CHAIN_VARS.iter().any(|var| env(var).is_some()) {
        return true;
    }
    env("AWS_ACCESS_KEY_ID").is_some() && env("AWS_SECRET_ACCESS_KEY").is_some()
}

/// Get the API key for a provider from environment variables.
///
/// Returns `None` for providers with no configured key; returns the
/// `AUTHENTICATED` sentinel for ambient-credential providers whose chain
/// is detectable but keyless.
pub fn get_env_api_key(provider: &str) -> Option<String> {
    match provider {
        "anthropic" => env("ANTHROPIC_OAUTH_TOKEN")
            .or_else(|| env("ANTHROPIC_API_KEY"))
            .or_else(|| env("PI_API_KEY")),

        "github-copilot" => env("GITHUB_COPILOT_TOKEN")
            .or_else(|| env("COPILOT_GITHUB_TOKEN"))
            .or_else(|| env("GH_TOKEN"))
            .or_else(|| env("GITHUB_TOKEN")),

        "google-vertex" => {
            let has_project =
                env("GOOGLE_CLOUD_PROJECT").is_some() || env("GCLOUD_PROJECT").is_some();
            let has_location = env("GOOGLE_CLOUD_LOCATION").is_some();
            if has_vertex_adc_credentials() && has_project && has_location {
                Some(AUTHENTICATED.to_string())
            } else {
                None
            }
        }

        "amazon-bedrock" => {
            if has_bedrock_credentials() {
                Some(AUTHENTICATED.to_string())
            } else {
                None
            }
        }

        // OAuth token refresh; no env key.
        "google-gemini-cli" => None,

        "google" => env("GOOGLE_API_KEY").or_else(|| env("GEMINI_API_KEY")),

        _ => {
            let var = match provider {
                "openai" => "OPENAI_API_KEY",
                "openai-codex" => "OPENAI_CODEX_API_KEY",
                "azure-openai-responses" => "AZURE_OPENAI_API_KEY",
                "groq" => "GROQ_API_KEY",
                "cerebras" => "CEREBRAS_API_KEY",
                "xai" => "XAI_API_KEY",
                "openrouter" => "OPENROUTER_API_KEY",
                "mistral" => "MISTRAL_API_KEY",
                "zai" => "ZAI_API_KEY",
                "minimax" => "MINIMAX_API_KEY",
                "huggingface" => "HF_TOKEN",
                _ => return None,
            };
            env(var)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each uses its own variable and
    // restores it to avoid crosstalk.
    struct EnvGuard(&'static str, Option<String>);

    impl EnvGuard {
        fn set(name: &'static str, value: &str) -> Self {
            let prior = std::env::var(name).ok();
            std::env::set_var(name, value);
            Self(name, prior)
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.1 {
                Some(v) => std::env::set_var(self.0, v),
                None => std::env::remove_var(self.0),
            }
        }
    }

    #[test]
    fn groq_key_from_env() {
        let _guard = EnvGuard::set("GROQ_API_KEY", "gsk-test");
        assert_eq!(get_env_api_key("groq").as_deref(), Some("gsk-test"));
    }

    #[test]
    fn unknown_provider_returns_none() {
        assert_eq!(get_env_api_key("no-such-provider"), None);
    }

    #[test]
    fn gemini_cli_has_no_env_key() {
        assert_eq!(get_env_api_key("google-gemini-cli"), None);
    }
}
