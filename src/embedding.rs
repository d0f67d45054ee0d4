//! Vectorizer backends selected by configuration.
//!
//! Implements [`canopy_core::embedding::Vectorizer`] for:
//! - **[`DisabledVectorizer`]**: fails every call; for stores that never build.
//! - **hash**: the offline [`HashVectorizer`] from the core crate.
//! - **[`OpenAIVectorizer`]**: `POST https://api.openai.com/v1/embeddings`
//!   (or `embedding.url` for compatible gateways).
//! - **[`OllamaVectorizer`]**: `POST {url}/api/embed` on a local Ollama.
//!
//! Remote backends split large inputs into `batch_size` chunks and retry
//! transient HTTP failures (see [`crate::http`]).
//!
//! ```rust,no_run
//! # use canopy::config::EmbeddingConfig;
//! # use canopy::embedding::create_vectorizer;
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let vectorizer = create_vectorizer(&config).unwrap();
//! assert_eq!(vectorizer.model_name(), "hash");
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use canopy_core::embedding::{HashVectorizer, Vectorizer};

use crate::config::EmbeddingConfig;
use crate::http;

/// Dimensionality of the hash vectorizer when `embedding.dims` is unset.
pub const DEFAULT_HASH_DIMS: usize = 256;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Instantiate the vectorizer named by `embedding.provider`.
pub fn create_vectorizer(config: &EmbeddingConfig) -> Result<Arc<dyn Vectorizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledVectorizer)),
        "hash" => Ok(Arc::new(HashVectorizer::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIVectorizer::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaVectorizer::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled ============

/// A vectorizer that always fails.
pub struct DisabledVectorizer;

#[async_trait]
impl Vectorizer for DisabledVectorizer {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn vectorize(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ OpenAI ============

/// Vectorizer backed by the OpenAI embeddings API.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIVectorizer {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIVectorizer {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        Ok(Self {
            model,
            dims,
            url: openai_endpoint(config),
            api_key: http::api_key("OPENAI_API_KEY")?,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Vectorizer for OpenAIVectorizer {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn vectorize(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size.max(1)) {
            let body = serde_json::json!({
                "model": self.model,
                "input": chunk,
            });
            let json = http::post_json(
                &self.client,
                "OpenAI",
                &self.url,
                &[("Authorization", format!("Bearer {}", self.api_key))],
                &body,
                self.max_retries,
            )
            .await?;
            out.extend(parse_openai_response(&json)?);
        }
        Ok(out)
    }
}

fn openai_endpoint(config: &EmbeddingConfig) -> String {
    config
        .url
        .clone()
        .unwrap_or_else(|| OPENAI_EMBEDDINGS_URL.to_string())
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32_vec(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Vectorizer backed by a local Ollama instance.
pub struct OllamaVectorizer {
    model: String,
    dims: usize,
    url: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaVectorizer {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Ok(Self {
            model,
            dims,
            url,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Vectorizer for OllamaVectorizer {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn vectorize(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let endpoint = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size.max(1)) {
            let body = serde_json::json!({
                "model": self.model,
                "input": chunk,
            });
            let json = http::post_json(
                &self.client,
                "Ollama",
                &endpoint,
                &[],
                &body,
                self.max_retries,
            )
            .await?;
            out.extend(parse_ollama_response(&json)?);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_f32_vec(values))
                .ok_or_else(|| {
                    anyhow::anyhow!("Invalid Ollama response: embedding is not an array")
                })
        })
        .collect()
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}
