//! Bulk regeneration of a tree.
//!
//! Re-synthesises every unlocked node bottom-up from its children's
//! current text, keeping the node's tier, identifier and children. Each
//! node is written in its own short transaction with the lock re-checked
//! at commit time, so a node locked by a concurrent refinement is left as
//! the refinement wrote it.

use std::sync::Arc;

use crate::embedding::{vectorize_one, Vectorizer};
use crate::error::{Error, Result};
use crate::models::{ChildRef, Node, NodeId};
use crate::retry::RetryPolicy;
use crate::store::{NodeStore, Revision, StoreExt};
use crate::strategy::Strategy;
use crate::synth::Synthesizer;
use crate::tree::DocumentTree;

/// Counts from one [`Regenerator::regenerate`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegenerationReport {
    pub regenerated: usize,
    pub skipped_locked: usize,
}

pub struct Regenerator {
    store: Arc<dyn NodeStore>,
    vectorizer: Arc<dyn Vectorizer>,
    synthesizer: Arc<dyn Synthesizer>,
    retry: RetryPolicy,
}

impl Regenerator {
    pub fn new(
        store: Arc<dyn NodeStore>,
        vectorizer: Arc<dyn Vectorizer>,
        synthesizer: Arc<dyn Synthesizer>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            vectorizer,
            synthesizer,
            retry,
        }
    }

    /// Regenerate every unlocked node of the tree rooted at `root`.
    pub async fn regenerate(&self, root: &NodeId) -> Result<RegenerationReport> {
        let tree = DocumentTree::new(root.clone(), self.store.clone());
        let mut nodes = tree.walk().await?;
        // Children before parents.
        nodes.sort_by_key(|n| n.level);

        let mut report = RegenerationReport::default();
        for node in nodes {
            if node.is_locked() {
                report.skipped_locked += 1;
                continue;
            }
            if self.regenerate_node(&node).await? {
                report.regenerated += 1;
            } else {
                report.skipped_locked += 1;
            }
        }
        tracing::info!(
            root = %root,
            regenerated = report.regenerated,
            skipped_locked = report.skipped_locked,
            "regeneration finished"
        );
        Ok(report)
    }

    /// Returns `false` if the node was locked by the time of the write.
    async fn regenerate_node(&self, node: &Node) -> Result<bool> {
        let mut texts = Vec::with_capacity(node.children.len());
        for child in &node.children {
            texts.push(match child {
                ChildRef::Segment(i) => self.store.get_segment(*i).await?.text,
                ChildRef::Node(c) => self.store.get(c).await?.text,
            });
        }

        let strategy = Strategy::new(node.tier());
        let texts = &texts;
        let strategy = &strategy;
        let (text, vector) = self
            .retry
            .run(
                |attempt| async move {
                    if attempt > 0 {
                        tracing::warn!(node = %node.id, attempt, "retrying regeneration");
                    }
                    let raw = self.synthesizer.synthesize(texts, strategy).await?;
                    let text = strategy.postprocess(&raw);
                    if text.is_empty() {
                        anyhow::bail!("{} returned empty text", self.synthesizer.name());
                    }
                    let vector = vectorize_one(self.vectorizer.as_ref(), &text).await?;
                    Ok::<_, anyhow::Error>((text, vector))
                },
                |_| true,
            )
            .await
            .map_err(|(e, _)| Error::synthesis(format!("regenerating node {}", node.id), e))?;

        let (_, written) = self
            .store
            .transaction(|batch| {
                batch.revise(Revision {
                    id: node.id.clone(),
                    text,
                    vector: Some(vector),
                    lock: false,
                    instruction: None,
                    unless_locked: true,
                });
                Ok(())
            })
            .await?;
        tracing::debug!(node = %node.id, written = !written.is_empty(), "node regenerated");
        Ok(!written.is_empty())
    }
}
