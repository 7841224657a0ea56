//! Provider spec registry (`{api_style, request_url, env_vars, default_model,
//! token_optional}`) and the model-cost catalog used to normalize the Agent
//! Loop's `meta` fields. Grounded on
//! `original_source/clawlite/core/providers.py` and
//! `original_source/clawlite/core/model_catalog.py`.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    Openai,
    Anthropic,
    Local,
}

#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub key: &'static str,
    pub display: &'static str,
    pub env_vars: &'static [&'static str],
    pub api_style: ApiStyle,
    pub request_url: &'static str,
    pub default_model: &'static str,
    pub token_optional: bool,
}

pub fn normalize_provider(provider: &str) -> String {
    match provider.trim().to_lowercase().as_str() {
        "google" | "google-gemini" => "gemini".to_string(),
        "codex" | "openai-codex-cli" => "openai-codex".to_string(),
        "z.ai" | "z-ai" => "zai".to_string(),
        other => other.to_string(),
    }
}

pub fn provider_spec(key: &str) -> Option<&'static ProviderSpec> {
    PROVIDER_SPECS.iter().find(|s| s.key == key)
}

pub static PROVIDER_SPECS: &[ProviderSpec] = &[
    ProviderSpec {
        key: "openai",
        display: "OpenAI",
        env_vars: &["OPENAI_API_KEY"],
        api_style: ApiStyle::Openai,
        request_url: "https://api.openai.com/v1/chat/completions",
        default_model: "gpt-4o-mini",
        token_optional: false,
    },
    ProviderSpec {
        key: "openai-codex",
        display: "OpenAI Codex",
        env_vars: &["OPENAI_CODEX_API_KEY", "CODEX_API_KEY", "OPENAI_API_KEY", "OPENAI_CODEX_ACCESS_TOKEN"],
        api_style: ApiStyle::Openai,
        request_url: "https://api.openai.com/v1/chat/completions",
        default_model: "gpt-5.3-codex",
        token_optional: true,
    },
    ProviderSpec {
        key: "anthropic",
        display: "Anthropic",
        env_vars: &["ANTHROPIC_API_KEY"],
        api_style: ApiStyle::Anthropic,
        request_url: "https://api.anthropic.com/v1/messages",
        default_model: "claude-haiku-4-5-20251001",
        token_optional: false,
    },
    ProviderSpec {
        key: "gemini",
        display: "Google Gemini",
        env_vars: &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        api_style: ApiStyle::Openai,
        request_url: "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions",
        default_model: "gemini-2.5-flash",
        token_optional: false,
    },
    ProviderSpec {
        key: "openrouter",
        display: "OpenRouter",
        env_vars: &["OPENROUTER_API_KEY"],
        api_style: ApiStyle::Openai,
        request_url: "https://openrouter.ai/api/v1/chat/completions",
        default_model: "openai/gpt-4o-mini",
        token_optional: false,
    },
    ProviderSpec {
        key: "groq",
        display: "Groq",
        env_vars: &["GROQ_API_KEY"],
        api_style: ApiStyle::Openai,
        request_url: "https://api.groq.com/openai/v1/chat/completions",
        default_model: "llama-3.1-8b-instant",
        token_optional: false,
    },
    ProviderSpec {
        key: "zai",
        display: "Z.ai",
        env_vars: &["ZAI_API_KEY"],
        api_style: ApiStyle::Openai,
        request_url: "https://api.z.ai/api/paas/v4/chat/completions",
        default_model: "glm-4.6",
        token_optional: false,
    },
    ProviderSpec {
        key: "ollama",
        display: "Ollama (local)",
        env_vars: &[],
        api_style: ApiStyle::Local,
        request_url: "",
        default_model: "llama3.1:8b",
        token_optional: true,
    },
];

#[derive(Debug, Clone, Default)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub id: String,
    pub provider: String,
    pub display_name: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub cost: ModelCost,
}

fn catalog() -> &'static HashMap<&'static str, ModelEntry> {
    use std::sync::OnceLock;
    static CATALOG: OnceLock<HashMap<&'static str, ModelEntry>> = OnceLock::new();
    CATALOG.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert(
            "openai/gpt-4o-mini",
            ModelEntry { id: "gpt-4o-mini".into(), provider: "openai".into(), display_name: "GPT-4o Mini".into(), context_window: 128_000, max_output_tokens: 16_384, cost: ModelCost { input: 0.00015, output: 0.0006 } },
        );
        m.insert(
            "openai/gpt-4o",
            ModelEntry { id: "gpt-4o".into(), provider: "openai".into(), display_name: "GPT-4o".into(), context_window: 128_000, max_output_tokens: 16_384, cost: ModelCost { input: 0.005, output: 0.015 } },
        );
        m.insert(
            "anthropic/claude-haiku-4-5-20251001",
            ModelEntry { id: "claude-haiku-4-5-20251001".into(), provider: "anthropic".into(), display_name: "Claude Haiku 4.5".into(), context_window: 200_000, max_output_tokens: 8_192, cost: ModelCost { input: 0.001, output: 0.005 } },
        );
        m.insert(
            "anthropic/claude-sonnet-4-5-20250929",
            ModelEntry { id: "claude-sonnet-4-5-20250929".into(), provider: "anthropic".into(), display_name: "Claude Sonnet 4.5".into(), context_window: 200_000, max_output_tokens: 16_384, cost: ModelCost { input: 0.003, output: 0.015 } },
        );
        m.insert(
            "gemini/gemini-2.5-flash",
            ModelEntry { id: "gemini-2.5-flash".into(), provider: "gemini".into(), display_name: "Gemini 2.5 Flash".into(), context_window: 1_000_000, max_output_tokens: 8_192, cost: ModelCost { input: 0.000075, output: 0.0003 } },
        );
        m.insert(
            "ollama/llama3.1:8b",
            ModelEntry { id: "llama3.1:8b".into(), provider: "ollama".into(), display_name: "Llama 3.1 8B (local)".into(), context_window: 128_000, max_output_tokens: 4_096, cost: ModelCost::default() },
        );
        m
    })
}

pub fn get_model_or_default(model_key: &str) -> ModelEntry {
    if let Some(entry) = catalog().get(model_key) {
        return entry.clone();
    }
    let (provider, id) = model_key.split_once('/').unwrap_or(("unknown", model_key));
    ModelEntry {
        id: id.to_string(),
        provider: provider.to_string(),
        display_name: model_key.to_string(),
        context_window: 128_000,
        max_output_tokens: 4_096,
        cost: ModelCost { input: 0.001, output: 0.003 },
    }
}

pub fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() / 3).max(1)) as u64
}

pub fn estimate_cost_usd(model_key: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let entry = get_model_or_default(model_key);
    let input_cost = (input_tokens as f64 / 1000.0) * entry.cost.input;
    let output_cost = (output_tokens as f64 / 1000.0) * entry.cost.output;
    ((input_cost + output_cost) * 1_000_000.0).round() / 1_000_000.0
}

pub fn context_window(model_key: &str) -> u32 {
    get_model_or_default(model_key).context_window
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_gets_generic_entry() {
        let entry = get_model_or_default("mystery/model-x");
        assert_eq!(entry.provider, "mystery");
        assert_eq!(entry.context_window, 128_000);
    }

    #[test]
    fn normalize_provider_maps_aliases() {
        assert_eq!(normalize_provider("google"), "gemini");
        assert_eq!(normalize_provider("codex"), "openai-codex");
        assert_eq!(normalize_provider("z.ai"), "zai");
    }

    #[test]
    fn estimate_cost_rounds_to_six_decimals() {
        let cost = estimate_cost_usd("openai/gpt-4o-mini", 1000, 1000);
        assert!((cost - 0.00075).abs() < 1e-9);
    }
}
