//! Level-by-level tree construction.
//!
//! [`TreeBuilder::build`] turns an ordered set of segments into a tree
//! with a single root:
//!
//! 1. The current set starts as the segments (level 0).
//! 2. Items without a vector are vectorized in one batch.
//! 3. The grouping oracle partitions the set. The partition is
//!    normalised; an empty or identity result is replaced by one group.
//!    A set of one item is a single group without consulting the oracle.
//! 4. Each group becomes one node at the current level, synthesised with
//!    the level's strategy. A round that produces a single group is the
//!    root round and always uses the essential strategy.
//! 5. Otherwise the new nodes become the current set one level up.
//!
//! Synthesis, vectorization and grouping failures are retried under
//! [`BuildOptions::retry`]. Nothing is written until the root exists: the
//! segments, every node and the [`TreeRecord`] are committed as one batch,
//! so a failed build leaves the store untouched.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::embedding::{check_batch, Vectorizer};
use crate::error::{Error, Result};
use crate::grouping::{normalize_partition, Degenerate, GroupingHint, GroupingOracle, Partition};
use crate::models::{ChildRef, Node, NodeId, Segment, Tier, TreeRecord};
use crate::retry::RetryPolicy;
use crate::segment::Segmenter;
use crate::store::{NodeStore, WriteBatch};
use crate::strategy::{Strategy, StrategyTable};
use crate::synth::Synthesizer;

/// Explicit build configuration.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Preferred upper bound on items per group, passed to the oracle.
    pub max_group_size_hint: Option<usize>,
    /// Tier to use at specific non-root levels.
    pub levels_to_strategy_override: BTreeMap<u32, Tier>,
    /// Retry policy for synthesis, vectorization and grouping calls.
    pub retry: RetryPolicy,
    /// Synthesis requests in flight per level.
    pub max_concurrency: usize,
    /// Label stored in the tree registry.
    pub label: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_group_size_hint: None,
            levels_to_strategy_override: BTreeMap::new(),
            retry: RetryPolicy::default(),
            max_concurrency: 4,
            label: None,
        }
    }
}

/// Progress notifications emitted during a build.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildProgressEvent {
    Started { segments: usize },
    LevelStarted { level: u32, items: usize, groups: usize, tier: Tier },
    GroupSynthesized { level: u32, group: usize, groups: usize },
    Committed { root: NodeId, depth: u32, nodes: usize },
}

/// Receives [`BuildProgressEvent`]s.
pub trait BuildObserver: Send + Sync {
    fn on_event(&self, event: &BuildProgressEvent);
}

/// One member of the set being grouped at a level.
#[derive(Debug, Clone)]
struct Item {
    child: ChildRef,
    text: String,
    vector: Option<Vec<f32>>,
}

/// Builds summary trees into a [`NodeStore`].
pub struct TreeBuilder {
    store: Arc<dyn NodeStore>,
    vectorizer: Arc<dyn Vectorizer>,
    oracle: Arc<dyn GroupingOracle>,
    synthesizer: Arc<dyn Synthesizer>,
    options: BuildOptions,
    strategies: StrategyTable,
    observer: Option<Arc<dyn BuildObserver>>,
}

impl TreeBuilder {
    pub fn new(
        store: Arc<dyn NodeStore>,
        vectorizer: Arc<dyn Vectorizer>,
        oracle: Arc<dyn GroupingOracle>,
        synthesizer: Arc<dyn Synthesizer>,
        options: BuildOptions,
    ) -> Self {
        let strategies = StrategyTable::new(options.levels_to_strategy_override.clone());
        Self {
            store,
            vectorizer,
            oracle,
            synthesizer,
            options,
            strategies,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BuildObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Build a tree and return its root identifier.
    pub async fn build(&self, segments: &[Segment]) -> Result<NodeId> {
        self.build_tree(segments).await.map(|record| record.root)
    }

    /// Segment raw text and build.
    ///
    /// Segment indices are reserved from the store before any external
    /// call, so builds running side by side never claim the same index.
    pub async fn build_text(&self, text: &str, segmenter: &dyn Segmenter) -> Result<TreeRecord> {
        let mut segments = segmenter.segment(text, 0);
        if !segments.is_empty() {
            let first = self
                .store
                .reserve_segment_indices(segments.len() as u64)
                .await?;
            for segment in &mut segments {
                segment.index += first;
            }
        }
        self.build_tree(&segments).await
    }

    /// Build a tree and return its registry record.
    pub async fn build_tree(&self, segments: &[Segment]) -> Result<TreeRecord> {
        if segments.is_empty() {
            return Err(Error::InvalidInput("no segments to build from".into()));
        }
        let mut seen = HashSet::with_capacity(segments.len());
        if let Some(dup) = segments.iter().find(|s| !seen.insert(s.index)) {
            return Err(Error::InvalidInput(format!(
                "segment index {} appears more than once",
                dup.index
            )));
        }

        self.emit(BuildProgressEvent::Started {
            segments: segments.len(),
        });
        tracing::info!(segments = segments.len(), "building tree");

        let mut batch = WriteBatch::new();
        for s in segments {
            batch.put_segment(s.clone());
        }

        let mut current: Vec<Item> = segments
            .iter()
            .map(|s| Item {
                child: ChildRef::Segment(s.index),
                text: s.text.clone(),
                vector: s.vector.clone(),
            })
            .collect();
        let mut level = 0u32;
        let mut created = 0usize;

        let root = loop {
            let groups = self.group(level, &mut current).await?;
            let is_root = groups.len() == 1;
            let strategy = self.strategies.strategy_for(level, is_root);

            self.emit(BuildProgressEvent::LevelStarted {
                level,
                items: current.len(),
                groups: groups.len(),
                tier: strategy.tier,
            });
            tracing::info!(
                level,
                items = current.len(),
                groups = groups.len(),
                tier = %strategy.tier,
                "synthesising level"
            );

            let group_count = groups.len();
            let texts: Vec<String> = stream::iter(groups.iter().enumerate())
                .map(|(g, members)| {
                    let inputs: Vec<String> =
                        members.iter().map(|i| current[*i].text.clone()).collect();
                    let strategy = &strategy;
                    async move {
                        let text = self.synthesize_group(level, g, inputs, strategy).await?;
                        self.emit(BuildProgressEvent::GroupSynthesized {
                            level,
                            group: g,
                            groups: group_count,
                        });
                        Ok::<_, Error>(text)
                    }
                })
                .buffered(self.options.max_concurrency.max(1))
                .try_collect()
                .await?;

            let vectors = self.vectorize(level, &texts).await?;

            let mut next = Vec::with_capacity(groups.len());
            for ((members, text), vector) in groups.iter().zip(texts).zip(vectors) {
                let children = members.iter().map(|i| current[*i].child.clone()).collect();
                let node = Node::new(level, text, children, strategy.tier).with_vector(vector);
                next.push(node);
            }
            created += next.len();

            if is_root {
                let root = next.remove(0);
                batch.put(root.clone());
                break root;
            }

            current = next
                .iter()
                .map(|n| Item {
                    child: ChildRef::Node(n.id.clone()),
                    text: n.text.clone(),
                    vector: n.vector.clone(),
                })
                .collect();
            for node in next {
                batch.put(node);
            }
            level += 1;
        };

        let record = TreeRecord {
            root: root.id.clone(),
            label: self.options.label.clone(),
            segment_count: segments.len(),
            depth: root.level + 1,
            created_at: chrono::Utc::now().timestamp(),
        };
        batch.put_tree(record.clone());
        self.store.apply(batch).await?;

        tracing::info!(
            root = %record.root,
            depth = record.depth,
            nodes = created,
            "tree committed"
        );
        self.emit(BuildProgressEvent::Committed {
            root: record.root.clone(),
            depth: record.depth,
            nodes: created,
        });
        Ok(record)
    }

    /// Partition the current set, filling in missing vectors first.
    async fn group(&self, level: u32, items: &mut [Item]) -> Result<Partition> {
        let n = items.len();
        if n == 1 {
            return Ok(vec![vec![0]]);
        }

        let missing: Vec<usize> = (0..n).filter(|i| items[*i].vector.is_none()).collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|i| items[*i].text.clone()).collect();
            let vectors = self.vectorize(level, &texts).await?;
            for (i, v) in missing.into_iter().zip(vectors) {
                items[i].vector = Some(v);
            }
        }
        let vectors: Vec<Vec<f32>> = items
            .iter()
            .map(|it| it.vector.clone().unwrap_or_default())
            .collect();

        let hint = GroupingHint {
            max_group_size: self.options.max_group_size_hint,
            target_groups: None,
        };
        let raw = self
            .options
            .retry
            .run(
                |attempt| {
                    let vectors = &vectors;
                    let hint = &hint;
                    async move {
                        if attempt > 0 {
                            tracing::warn!(
                                level,
                                attempt,
                                oracle = self.oracle.name(),
                                "retrying grouping"
                            );
                        }
                        self.oracle.partition(vectors, hint)
                    }
                },
                |_| true,
            )
            .await
            .map_err(|(e, attempts)| Error::Construction {
                level,
                group: None,
                attempts,
                source: Box::new(Error::Grouping {
                    level,
                    source: e.into(),
                }),
            })?;

        match normalize_partition(raw, n) {
            Ok(groups) => Ok(groups),
            Err(kind) => {
                let reason = match kind {
                    Degenerate::Empty => "empty",
                    Degenerate::Identity => "identity",
                };
                tracing::warn!(
                    level,
                    items = n,
                    reason,
                    "degenerate partition, forcing a single group"
                );
                Ok(vec![(0..n).collect()])
            }
        }
    }

    async fn synthesize_group(
        &self,
        level: u32,
        group: usize,
        inputs: Vec<String>,
        strategy: &Strategy,
    ) -> Result<String> {
        tracing::debug!(level, group, inputs = inputs.len(), "synthesising group");
        self.options
            .retry
            .run(
                |attempt| {
                    let inputs = &inputs;
                    async move {
                        if attempt > 0 {
                            tracing::warn!(level, group, attempt, "retrying synthesis");
                        }
                        let raw = self.synthesizer.synthesize(inputs, strategy).await?;
                        let text = strategy.postprocess(&raw);
                        if text.is_empty() {
                            anyhow::bail!("{} returned empty text", self.synthesizer.name());
                        }
                        Ok::<_, anyhow::Error>(text)
                    }
                },
                |_| true,
            )
            .await
            .map_err(|(e, attempts)| Error::Construction {
                level,
                group: Some(group),
                attempts,
                source: Box::new(Error::synthesis(
                    format!("level {} group {}", level, group),
                    e,
                )),
            })
    }

    async fn vectorize(&self, level: u32, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.options
            .retry
            .run(
                |attempt| async move {
                    if attempt > 0 {
                        tracing::warn!(level, attempt, "retrying vectorization");
                    }
                    let vectors = self.vectorizer.vectorize(texts).await?;
                    check_batch(self.vectorizer.as_ref(), texts.len(), &vectors)?;
                    Ok::<_, anyhow::Error>(vectors)
                },
                |_| true,
            )
            .await
            .map_err(|(e, attempts)| Error::Construction {
                level,
                group: None,
                attempts,
                source: Box::new(Error::vectorize(
                    format!("{} text(s) at level {}", texts.len(), level),
                    e,
                )),
            })
    }

    fn emit(&self, event: BuildProgressEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }
}
