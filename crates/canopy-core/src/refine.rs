//! Targeted single-node rewrites.
//!
//! [`RefinementController::refine`] regenerates one node's text from its
//! children under the node's own tier, decorated with a user instruction,
//! then commits text, vector, lock and edit-log entry in one short
//! transaction. The synthesizer and vectorizer are called before the
//! write, never inside it. Refinement is not retried: the caller is
//! waiting and gets the error straight away, with the node unchanged.

use std::sync::Arc;
use std::time::Duration;

use crate::embedding::{vectorize_one, Vectorizer};
use crate::error::{Error, Result};
use crate::models::{ChildRef, Node, NodeId};
use crate::store::{NodeStore, Revision, StoreExt};
use crate::strategy::Strategy;
use crate::synth::Synthesizer;
use crate::tree::DocumentTree;

/// Refinement configuration.
#[derive(Debug, Clone)]
pub struct RefineOptions {
    /// Upper bound on the synthesizer call; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Longest accepted instruction, in characters.
    pub max_instruction_chars: usize,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(120)),
            max_instruction_chars: 2000,
        }
    }
}

/// Rewrites individual nodes on request.
pub struct RefinementController {
    store: Arc<dyn NodeStore>,
    vectorizer: Arc<dyn Vectorizer>,
    synthesizer: Arc<dyn Synthesizer>,
    options: RefineOptions,
}

impl RefinementController {
    pub fn new(
        store: Arc<dyn NodeStore>,
        vectorizer: Arc<dyn Vectorizer>,
        synthesizer: Arc<dyn Synthesizer>,
        options: RefineOptions,
    ) -> Self {
        Self {
            store,
            vectorizer,
            synthesizer,
            options,
        }
    }

    /// Rewrite `id` following `instruction`, lock it and log the instruction.
    ///
    /// Fails with `NodeNotFound` before any external call if the node is
    /// absent, and with `InvalidInput` for a blank or oversized instruction.
    pub async fn refine(&self, id: &NodeId, instruction: &str) -> Result<Node> {
        let instruction = self.check_instruction(instruction)?;
        let node = self.store.get(id).await?;
        self.rewrite(node, instruction).await
    }

    /// Like [`refine`](Self::refine), but `id` must belong to the tree
    /// rooted at `root`.
    pub async fn refine_in_tree(
        &self,
        root: &NodeId,
        id: &NodeId,
        instruction: &str,
    ) -> Result<Node> {
        let instruction = self.check_instruction(instruction)?;
        let tree = DocumentTree::new(root.clone(), self.store.clone());
        if !tree.contains(id).await? {
            return Err(Error::NodeNotFound(id.clone()));
        }
        let node = self.store.get(id).await?;
        self.rewrite(node, instruction).await
    }

    fn check_instruction<'a>(&self, instruction: &'a str) -> Result<&'a str> {
        let trimmed = instruction.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("refinement instruction is blank".into()));
        }
        let chars = trimmed.chars().count();
        if chars > self.options.max_instruction_chars {
            return Err(Error::InvalidInput(format!(
                "refinement instruction is {} characters, limit is {}",
                chars, self.options.max_instruction_chars
            )));
        }
        Ok(trimmed)
    }

    async fn rewrite(&self, node: Node, instruction: &str) -> Result<Node> {
        let mut texts = Vec::with_capacity(node.children.len());
        for child in &node.children {
            texts.push(match child {
                ChildRef::Segment(i) => self.store.get_segment(*i).await?.text,
                ChildRef::Node(c) => self.store.get(c).await?.text,
            });
        }

        let strategy = Strategy::new(node.tier()).with_override(instruction);
        let context = format!("refining node {}", node.id);
        tracing::debug!(node = %node.id, tier = %strategy.tier, children = texts.len(), "refining");

        let call = self.synthesizer.synthesize(&texts, &strategy);
        let raw = match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                Error::synthesis(&context, anyhow::anyhow!("timed out after {:?}", limit))
            })?,
            None => call.await,
        }
        .map_err(|e| Error::synthesis(&context, e))?;

        let text = strategy.postprocess(&raw);
        if text.is_empty() {
            return Err(Error::synthesis(
                &context,
                anyhow::anyhow!("{} returned empty text", self.synthesizer.name()),
            ));
        }
        let vector = vectorize_one(self.vectorizer.as_ref(), &text)
            .await
            .map_err(|e| Error::vectorize(&context, e))?;

        let id = node.id.clone();
        let (_, written) = self
            .store
            .transaction(|batch| {
                batch.revise(Revision {
                    id: id.clone(),
                    text,
                    vector: Some(vector),
                    lock: true,
                    instruction: Some(instruction.to_string()),
                    unless_locked: false,
                });
                Ok(())
            })
            .await?;

        tracing::info!(node = %id, "node refined and locked");
        match written.into_iter().next() {
            Some(updated) => Ok(updated),
            None => self.store.get(&id).await,
        }
    }
}
