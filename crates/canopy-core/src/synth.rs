//! Synthesizer trait and the offline extractive synthesizer.
//!
//! Model-backed synthesizers (OpenAI, Anthropic, Ollama) live in the
//! `canopy` app crate. The engine applies [`Strategy::postprocess`] to
//! whatever a synthesizer returns.

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::Tier;
use crate::strategy::{sentences, Strategy};

/// Group texts + strategy → one output text.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn synthesize(&self, texts: &[String], strategy: &Strategy) -> Result<String>;
}

/// Deterministic synthesizer that extracts leading sentences.
///
/// Sentence budget per input: all text for `raw`, two for `actionable`,
/// one for `structural` and `essential` (the essential cap is then
/// applied by postprocessing).
#[derive(Debug, Clone, Default)]
pub struct ExtractiveSynthesizer;

impl ExtractiveSynthesizer {
    fn budget(tier: Tier) -> Option<usize> {
        match tier {
            Tier::Raw => None,
            Tier::Actionable => Some(2),
            Tier::Structural | Tier::Essential => Some(1),
        }
    }
}

#[async_trait]
impl Synthesizer for ExtractiveSynthesizer {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn synthesize(&self, texts: &[String], strategy: &Strategy) -> Result<String> {
        let budget = Self::budget(strategy.tier);
        let parts: Vec<String> = texts
            .iter()
            .map(|t| match budget {
                None => t.trim().to_string(),
                Some(n) => sentences(t).into_iter().take(n).collect::<Vec<_>>().join(" "),
            })
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            bail!("nothing to extract from {} empty input(s)", texts.len());
        }
        let sep = if strategy.tier == Tier::Raw { "\n\n" } else { " " };
        Ok(parts.join(sep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts() -> Vec<String> {
        vec![
            "First fact. Second fact. Third fact.".to_string(),
            "Other point. More detail.".to_string(),
        ]
    }

    #[tokio::test]
    async fn budgets_by_tier() {
        let s = ExtractiveSynthesizer;
        let out = s.synthesize(&texts(), &Strategy::new(Tier::Actionable)).await.unwrap();
        assert_eq!(out, "First fact. Second fact. Other point. More detail.");
        let out = s.synthesize(&texts(), &Strategy::new(Tier::Structural)).await.unwrap();
        assert_eq!(out, "First fact. Other point.");
        let out = s.synthesize(&texts(), &Strategy::new(Tier::Raw)).await.unwrap();
        assert!(out.contains("\n\n"));
    }

    #[tokio::test]
    async fn blank_inputs_fail() {
        let s = ExtractiveSynthesizer;
        let err = s
            .synthesize(&["  ".to_string()], &Strategy::new(Tier::Essential))
            .await;
        assert!(err.is_err());
    }
}
