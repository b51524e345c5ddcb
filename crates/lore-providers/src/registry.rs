//! Provider registry — maps the `provider` tag stored on an LLM row to a
//! concrete adapter. Unknown tags get the OpenAI-compatible adapter, which
//! covers most vendors in the wild.

use tracing::warn;

use crate::anthropic::AnthropicProvider;
use crate::baidu::BaiduProvider;
use crate::google::GoogleProvider;
use crate::minimax::MinimaxProvider;
use crate::openai::OpenAiProvider;
use crate::provider::LlmProvider;

/// Tags with a dedicated adapter. Everything else is OpenAI-compatible.
const OPENAI_COMPATIBLE: &[&str] = &[
    "openai",
    "deepseek",
    "siliconflow",
    "moonshot",
    "zhipu",
    "qwen",
    "baichuan",
    "yi",
    "doubao",
];

pub fn build_provider(
    tag: &str,
    api_key: String,
    base_url: Option<String>,
    api_version: Option<String>,
) -> Box<dyn LlmProvider> {
    let tag_lower = tag.to_lowercase();
    match tag_lower.as_str() {
        "anthropic" => Box::new(AnthropicProvider::new(api_key, base_url, api_version)),
        "google" | "gemini" => Box::new(GoogleProvider::new(api_key, base_url)),
        "baidu" | "ernie" => Box::new(BaiduProvider::new(api_key, base_url)),
        "minimax" => Box::new(MinimaxProvider::new(api_key, base_url)),
        _ => {
            if !OPENAI_COMPATIBLE.contains(&tag_lower.as_str()) {
                warn!(tag, "no dedicated adapter for provider, using OpenAI-compatible mode");
            }
            Box::new(OpenAiProvider::tagged(tag_lower, api_key, base_url))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_resolve_to_their_adapters() {
        assert_eq!(build_provider("anthropic", "k".into(), None, None).name(), "anthropic");
        assert_eq!(build_provider("Gemini", "k".into(), None, None).name(), "google");
        assert_eq!(build_provider("ernie", "k".into(), None, None).name(), "baidu");
        assert_eq!(build_provider("minimax", "k".into(), None, None).name(), "minimax");
    }

    #[test]
    fn unknown_tags_fall_back_to_openai_compatible() {
        let provider = build_provider("totally-new-vendor", "k".into(), None, None);
        assert_eq!(provider.name(), "totally-new-vendor");
    }

    #[test]
    fn compatible_tags_keep_their_name() {
        let provider = build_provider("deepseek", "k".into(), None, None);
        assert_eq!(provider.name(), "deepseek");
    }
}
