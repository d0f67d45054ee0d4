//! Synthesizer backends selected by configuration.
//!
//! Implements [`canopy_core::synth::Synthesizer`] for:
//! - **extractive**: the offline [`ExtractiveSynthesizer`] from the core crate.
//! - **[`OpenAISynthesizer`]**: chat completions (`/v1/chat/completions`).
//! - **[`AnthropicSynthesizer`]**: the messages API (`/v1/messages`).
//! - **[`OllamaSynthesizer`]**: a local Ollama `/api/chat`, non-streaming.
//!
//! Every backend sends the strategy's system directive as the system
//! prompt and its user directive as the single user message. Transport
//! errors are not retried here: the engine owns synthesis retries.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use canopy_core::strategy::{Strategy, SynthesisContext};
use canopy_core::synth::{ExtractiveSynthesizer, Synthesizer};

use crate::config::SynthesisConfig;
use crate::http;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Instantiate the synthesizer named by `synthesis.provider`.
pub fn create_synthesizer(config: &SynthesisConfig) -> Result<Arc<dyn Synthesizer>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveSynthesizer)),
        "openai" => Ok(Arc::new(OpenAISynthesizer::new(config)?)),
        "anthropic" => Ok(Arc::new(AnthropicSynthesizer::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaSynthesizer::new(config)?)),
        other => bail!("Unknown synthesis provider: {}", other),
    }
}

/// Settings shared by the remote backends.
struct ModelSettings {
    model: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl ModelSettings {
    fn from_config(config: &SynthesisConfig, provider: &str) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("synthesis.model required for {} provider", provider))?;
        Ok(Self {
            model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            client: http::client(config.timeout_secs)?,
        })
    }
}

fn prompts(texts: &[String], strategy: &Strategy) -> (String, String) {
    (
        strategy.system_directive(),
        strategy.user_directive(&SynthesisContext::new(texts)),
    )
}

// ============ OpenAI ============

pub struct OpenAISynthesizer {
    settings: ModelSettings,
    api_key: String,
    url: String,
}

impl OpenAISynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        Ok(Self {
            settings: ModelSettings::from_config(config, "OpenAI")?,
            api_key: http::api_key("OPENAI_API_KEY")?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_CHAT_URL.to_string()),
        })
    }
}

#[async_trait]
impl Synthesizer for OpenAISynthesizer {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn synthesize(&self, texts: &[String], strategy: &Strategy) -> Result<String> {
        let (system, user) = prompts(texts, strategy);
        let body = serde_json::json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let json = http::post_json(
            &self.settings.client,
            "OpenAI",
            &self.url,
            &[("Authorization", format!("Bearer {}", self.api_key))],
            &body,
            0,
        )
        .await?;
        parse_openai_response(&json)
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content")
        })
}

// ============ Anthropic ============

/// Requires `ANTHROPIC_API_KEY` in the environment.
pub struct AnthropicSynthesizer {
    settings: ModelSettings,
    api_key: String,
    url: String,
}

impl AnthropicSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        Ok(Self {
            settings: ModelSettings::from_config(config, "Anthropic")?,
            api_key: http::api_key("ANTHROPIC_API_KEY")?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_MESSAGES_URL.to_string()),
        })
    }
}

#[async_trait]
impl Synthesizer for AnthropicSynthesizer {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn synthesize(&self, texts: &[String], strategy: &Strategy) -> Result<String> {
        let (system, user) = prompts(texts, strategy);
        let body = serde_json::json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });
        let json = http::post_json(
            &self.settings.client,
            "Anthropic",
            &self.url,
            &[
                ("x-api-key", self.api_key.clone()),
                ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ],
            &body,
            0,
        )
        .await?;
        parse_anthropic_response(&json)
    }
}

/// Concatenate every `text` block of the `content` array.
fn parse_anthropic_response(json: &serde_json::Value) -> Result<String> {
    let content = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Anthropic response: missing content array"))?;
    let text: String = content
        .iter()
        .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.is_empty() {
        bail!("Invalid Anthropic response: no text content");
    }
    Ok(text)
}

// ============ Ollama ============

pub struct OllamaSynthesizer {
    settings: ModelSettings,
    url: String,
}

impl OllamaSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        Ok(Self {
            settings: ModelSettings::from_config(config, "Ollama")?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
        })
    }
}

#[async_trait]
impl Synthesizer for OllamaSynthesizer {
    fn name(&self) -> &str {
        &self.settings.model
    }

    async fn synthesize(&self, texts: &[String], strategy: &Strategy) -> Result<String> {
        let (system, user) = prompts(texts, strategy);
        let body = serde_json::json!({
            "model": self.settings.model,
            "stream": false,
            "options": {
                "temperature": self.settings.temperature,
                "num_predict": self.settings.max_tokens,
            },
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let endpoint = format!("{}/api/chat", self.url.trim_end_matches('/'));
        let json =
            http::post_json(&self.settings.client, "Ollama", &endpoint, &[], &body, 0).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing message.content"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::models::Tier;
    use serde_json::json;

    #[test]
    fn parses_openai_chat_completion() {
        let json = json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Short summary."}}]
        });
        assert_eq!(parse_openai_response(&json).unwrap(), "Short summary.");
    }

    #[test]
    fn openai_without_choices_is_rejected() {
        assert!(parse_openai_response(&json!({"choices": []})).is_err());
    }

    #[test]
    fn parses_anthropic_text_blocks() {
        let json = json!({
            "content": [
                {"type": "text", "text": "First part. "},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "Second part."}
            ]
        });
        assert_eq!(
            parse_anthropic_response(&json).unwrap(),
            "First part. Second part."
        );
    }

    #[test]
    fn anthropic_without_text_is_rejected() {
        assert!(parse_anthropic_response(&json!({"content": []})).is_err());
    }

    #[test]
    fn parses_ollama_chat() {
        let json = json!({"message": {"role": "assistant", "content": "ok"}, "done": true});
        assert_eq!(parse_ollama_response(&json).unwrap(), "ok");
    }

    #[test]
    fn prompts_carry_instruction() {
        let texts = vec!["alpha".to_string()];
        let strategy = Strategy::new(Tier::Structural).with_override("be brief");
        let (system, user) = prompts(&texts, &strategy);
        assert!(system.contains("overrides these defaults"));
        assert!(user.contains("[1]\nalpha"));
        assert!(user.ends_with("be brief"));
    }

    #[tokio::test]
    async fn extractive_is_default() {
        let synth = create_synthesizer(&SynthesisConfig::default()).unwrap();
        let out = synth
            .synthesize(
                &["One sentence here. Another one.".to_string()],
                &Strategy::new(Tier::Structural),
            )
            .await
            .unwrap();
        assert_eq!(out, "One sentence here.");
    }
}
