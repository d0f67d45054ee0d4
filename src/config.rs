use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use canopy_core::retry::RetryPolicy;
use canopy_core::{BuildOptions, RefineOptions, Tier};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SegmentationConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    350
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildConfig {
    #[serde(default = "default_group_size_hint")]
    pub max_group_size_hint: Option<usize>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Level number (as a TOML key) → tier name.
    #[serde(default)]
    pub levels_to_strategy_override: BTreeMap<String, String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_group_size_hint: default_group_size_hint(),
            retry_count: default_retry_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_concurrency: default_max_concurrency(),
            levels_to_strategy_override: BTreeMap::new(),
        }
    }
}

fn default_group_size_hint() -> Option<usize> {
    Some(8)
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_max_concurrency() -> usize {
    4
}

impl BuildConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, Duration::from_millis(self.retry_backoff_ms))
    }

    pub fn level_overrides(&self) -> Result<BTreeMap<u32, Tier>> {
        let mut out = BTreeMap::new();
        for (level, tier) in &self.levels_to_strategy_override {
            let level: u32 = level.trim().parse().with_context(|| {
                format!("build.levels_to_strategy_override: '{}' is not a level number", level)
            })?;
            let tier: Tier = tier.parse().map_err(|e: String| {
                anyhow::anyhow!("build.levels_to_strategy_override.{}: {}", level, e)
            })?;
            out.insert(level, tier);
        }
        Ok(out)
    }

    pub fn options(&self, label: Option<String>) -> Result<BuildOptions> {
        Ok(BuildOptions {
            max_group_size_hint: self.max_group_size_hint,
            levels_to_strategy_override: self.level_overrides()?,
            retry: self.retry_policy(),
            max_concurrency: self.max_concurrency,
            label,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroupingConfig {
    #[serde(default = "default_grouping_method")]
    pub method: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            method: default_grouping_method(),
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_grouping_method() -> String {
    "kmeans".to_string()
}
fn default_max_iterations() -> usize {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    fn is_remote(&self) -> bool {
        matches!(self.provider.as_str(), "openai" | "ollama")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    #[serde(default = "default_synthesis_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_output_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_synthesis_timeout")]
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_synthesis_provider(),
            model: None,
            url: None,
            max_tokens: default_output_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_synthesis_timeout(),
        }
    }
}

fn default_synthesis_provider() -> String {
    "extractive".to_string()
}
fn default_output_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.2
}
fn default_synthesis_timeout() -> u64 {
    120
}

impl SynthesisConfig {
    pub fn refine_options(&self) -> RefineOptions {
        RefineOptions {
            timeout: Some(Duration::from_secs(self.timeout_secs)),
            ..RefineOptions::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_retries")]
    pub max_retries: u32,
    #[serde(default = "default_store_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: default_store_retries(),
            retry_backoff_ms: default_store_backoff_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_store_retries() -> u32 {
    5
}
fn default_store_backoff_ms() -> u64 {
    50
}
fn default_busy_timeout_ms() -> u64 {
    5000
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_backoff_ms))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate segmentation
    if config.segmentation.max_tokens == 0 {
        bail!("segmentation.max_tokens must be > 0");
    }

    // Validate build
    if let Some(hint) = config.build.max_group_size_hint {
        if hint < 2 {
            bail!("build.max_group_size_hint must be >= 2");
        }
    }
    if config.build.max_concurrency == 0 {
        bail!("build.max_concurrency must be >= 1");
    }
    config.build.level_overrides()?;
    check_retry("build.retry_count", config.build.retry_count)?;
    check_backoff("build.retry_backoff_ms", config.build.retry_backoff_ms)?;

    // Validate grouping
    match config.grouping.method.as_str() {
        "kmeans" | "sequential" => {}
        other => bail!(
            "Unknown grouping method: '{}'. Must be kmeans or sequential.",
            other
        ),
    }
    if config.grouping.max_iterations == 0 {
        bail!("grouping.max_iterations must be > 0");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_remote() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // Validate synthesis
    match config.synthesis.provider.as_str() {
        "extractive" => {}
        "openai" | "anthropic" | "ollama" => {
            if config.synthesis.model.is_none() {
                bail!(
                    "synthesis.model must be specified when provider is '{}'",
                    config.synthesis.provider
                );
            }
        }
        other => bail!(
            "Unknown synthesis provider: '{}'. Must be extractive, openai, anthropic, or ollama.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.synthesis.temperature) {
        bail!("synthesis.temperature must be in [0.0, 2.0]");
    }
    if config.synthesis.max_tokens == 0 {
        bail!("synthesis.max_tokens must be > 0");
    }

    // Validate store
    check_retry("store.max_retries", config.store.max_retries)?;
    check_backoff("store.retry_backoff_ms", config.store.retry_backoff_ms)?;

    Ok(config)
}

const MAX_RETRIES: u32 = 100;
const MAX_BACKOFF_MS: u64 = 600_000;

fn check_retry(key: &str, value: u32) -> Result<()> {
    if value > MAX_RETRIES {
        bail!("{} must be <= {}", key, MAX_RETRIES);
    }
    Ok(())
}

fn check_backoff(key: &str, value: u64) -> Result<()> {
    if value > MAX_BACKOFF_MS {
        bail!("{} must be <= {} ms", key, MAX_BACKOFF_MS);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "[db]\npath = \"./data/canopy.sqlite\"\n";

    #[test]
    fn minimal_config_uses_offline_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.embedding.provider, "hash");
        assert_eq!(cfg.synthesis.provider, "extractive");
        assert_eq!(cfg.grouping.method, "kmeans");
        assert_eq!(cfg.build.max_group_size_hint, Some(8));
        assert_eq!(cfg.build.retry_policy().max_attempts(), 4);
    }

    #[test]
    fn level_overrides_parse() {
        let cfg = parse_config(&format!(
            "{}\n[build.levels_to_strategy_override]\n0 = \"raw\"\n2 = \"Essential\"\n",
            MINIMAL
        ))
        .unwrap();
        let overrides = cfg.build.level_overrides().unwrap();
        assert_eq!(overrides.get(&0), Some(&Tier::Raw));
        assert_eq!(overrides.get(&2), Some(&Tier::Essential));
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            "[segmentation]\nmax_tokens = 0\n",
            "[build]\nmax_group_size_hint = 1\n",
            "[build.levels_to_strategy_override]\nroot = \"raw\"\n",
            "[build.levels_to_strategy_override]\n1 = \"summary\"\n",
            "[grouping]\nmethod = \"dbscan\"\n",
            "[embedding]\nprovider = \"openai\"\n",
            "[synthesis]\nprovider = \"anthropic\"\n",
            "[synthesis]\ntemperature = 3.0\n",
            "[build]\nretry_count = 4294967295\n",
            "[build]\nretry_backoff_ms = 9223372036854775807\n",
            "[store]\nmax_retries = 101\n",
            "[store]\nretry_backoff_ms = 600001\n",
        ];
        for extra in bad {
            let text = format!("{}\n{}", MINIMAL, extra);
            assert!(parse_config(&text).is_err(), "accepted: {}", extra);
        }
    }

    #[test]
    fn remote_providers_need_model() {
        let text = format!(
            r#"{}
[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 768

[synthesis]
provider = "ollama"
model = "llama3"
"#,
            MINIMAL
        );
        let cfg = parse_config(&text).unwrap();
        assert!(cfg.embedding.is_enabled());
        assert_eq!(cfg.synthesis.model.as_deref(), Some("llama3"));
    }
}
