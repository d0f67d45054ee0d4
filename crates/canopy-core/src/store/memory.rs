//! In-memory [`NodeStore`] implementation for tests and embedding.
//!
//! All state sits behind one `std::sync::RwLock`. A batch is staged
//! against a copy-on-write overlay under the write lock and only merged
//! when every write passed its checks, so a failing batch leaves the
//! store untouched and readers only ever see whole nodes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::models::{ChildRef, Node, NodeId, Segment, TreeRecord};

use super::rules::{self, ChildLevel};
use super::{committed_event, NodeStore, StoreEvent, WriteBatch, WriteOp};

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeId, Node>,
    segments: BTreeMap<u64, Segment>,
    /// Child key (`ChildRef::key`) → parent node.
    parents: HashMap<String, NodeId>,
    trees: Vec<TreeRecord>,
    /// End of the highest reserved index range.
    reserved: u64,
}

impl Inner {
    fn next_segment_index(&self) -> u64 {
        let stored = self.segments.keys().next_back().map(|i| i + 1).unwrap_or(0);
        stored.max(self.reserved)
    }
}

/// In-memory store.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    /// Number of stored nodes.
    pub fn node_count(&self) -> usize {
        self.read().nodes.len()
    }

    /// Number of stored segments.
    pub fn segment_count(&self) -> usize {
        self.read().segments.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending writes layered over the committed state.
struct Stage<'a> {
    base: &'a Inner,
    nodes: HashMap<NodeId, Node>,
    segments: BTreeMap<u64, Segment>,
    parents: HashMap<String, NodeId>,
    trees: Vec<TreeRecord>,
    written: Vec<NodeId>,
}

impl<'a> Stage<'a> {
    fn new(base: &'a Inner) -> Self {
        Self {
            base,
            nodes: HashMap::new(),
            segments: BTreeMap::new(),
            parents: HashMap::new(),
            trees: Vec::new(),
            written: Vec::new(),
        }
    }

    fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id).or_else(|| self.base.nodes.get(id))
    }

    fn segment(&self, index: u64) -> Option<&Segment> {
        self.segments
            .get(&index)
            .or_else(|| self.base.segments.get(&index))
    }

    fn parent(&self, key: &str) -> Option<&NodeId> {
        self.parents.get(key).or_else(|| self.base.parents.get(key))
    }

    fn mark_written(&mut self, id: &NodeId) {
        if !self.written.contains(id) {
            self.written.push(id.clone());
        }
    }

    fn stage(&mut self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::PutSegment(segment) => {
                if rules::check_segment(self.segment(segment.index), &segment)? {
                    self.segments.insert(segment.index, segment);
                }
            }
            WriteOp::PutNode(node) => {
                if let Some(existing) = self.node(&node.id) {
                    rules::check_replace(existing, &node)?;
                }
                let mut levels = Vec::with_capacity(node.children.len());
                for child in &node.children {
                    levels.push(match child {
                        ChildRef::Segment(i) => {
                            self.segment(*i).ok_or(Error::SegmentNotFound(*i))?;
                            ChildLevel::Segment
                        }
                        ChildRef::Node(id) => {
                            let c = self
                                .node(id)
                                .ok_or_else(|| Error::NodeNotFound(id.clone()))?;
                            ChildLevel::Node(c.level)
                        }
                    });
                }
                rules::check_children(&node, &levels)?;
                for child in &node.children {
                    let key = child.key();
                    rules::check_parent(child, self.parent(&key), &node.id)?;
                    self.parents.insert(key, node.id.clone());
                }
                self.mark_written(&node.id);
                self.nodes.insert(node.id.clone(), node);
            }
            WriteOp::Revise(rev) => {
                let mut node = self
                    .node(&rev.id)
                    .cloned()
                    .ok_or_else(|| Error::NodeNotFound(rev.id.clone()))?;
                if rules::apply_revision(&mut node, &rev) {
                    self.mark_written(&node.id);
                    self.nodes.insert(node.id.clone(), node);
                }
            }
            WriteOp::PutTree(record) => {
                if self.node(&record.root).is_none() {
                    return Err(Error::NodeNotFound(record.root));
                }
                self.trees.push(record);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NodeStore for InMemoryStore {
    async fn get(&self, id: &NodeId) -> Result<Node> {
        self.read()
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(id.clone()))
    }

    async fn get_segment(&self, index: u64) -> Result<Segment> {
        self.read()
            .segments
            .get(&index)
            .cloned()
            .ok_or(Error::SegmentNotFound(index))
    }

    async fn parent_of(&self, child: &ChildRef) -> Result<Option<NodeId>> {
        Ok(self.read().parents.get(&child.key()).cloned())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<Vec<Node>> {
        let ops = batch.into_ops();
        let mut inner = self.write();

        let (nodes, segments, parents, trees, written) = {
            let mut stage = Stage::new(&inner);
            for op in ops.iter().cloned() {
                stage.stage(op)?;
            }
            (
                stage.nodes,
                stage.segments,
                stage.parents,
                stage.trees,
                stage.written,
            )
        };

        let written_nodes: Vec<Node> = written
            .iter()
            .filter_map(|id| nodes.get(id).cloned())
            .collect();

        inner.nodes.extend(nodes);
        inner.segments.extend(segments);
        inner.parents.extend(parents);
        inner.trees.extend(trees);
        drop(inner);

        tracing::debug!(
            ops = ops.len(),
            nodes = written_nodes.len(),
            "in-memory batch committed"
        );
        let _ = self.events.send(committed_event(&ops, &written_nodes));
        Ok(written_nodes)
    }

    async fn next_segment_index(&self) -> Result<u64> {
        Ok(self.read().next_segment_index())
    }

    async fn reserve_segment_indices(&self, count: u64) -> Result<u64> {
        let mut inner = self.write();
        let first = inner.next_segment_index();
        inner.reserved = first.checked_add(count).ok_or_else(|| {
            Error::InvalidInput(format!("cannot reserve {} segment indices", count))
        })?;
        Ok(first)
    }

    async fn list_trees(&self) -> Result<Vec<TreeRecord>> {
        let mut trees = self.read().trees.clone();
        trees.reverse();
        Ok(trees)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tier;
    use crate::store::Revision;

    fn seg(i: u64, text: &str) -> Segment {
        Segment::new(i, text, 0, text.len())
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let store = InMemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put_segment(seg(0, "a"));
        batch.put(Node::new(0, "sum", vec![ChildRef::Segment(0)], Tier::Actionable));
        batch.put(Node::new(0, "dangling", vec![ChildRef::Segment(9)], Tier::Actionable));
        let err = store.apply(batch).await.unwrap_err();
        assert!(matches!(err, Error::SegmentNotFound(9)));
        assert_eq!(store.node_count(), 0);
        assert_eq!(store.segment_count(), 0);
    }

    #[tokio::test]
    async fn second_parent_is_a_conflict() {
        let store = InMemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put_segment(seg(0, "a"));
        batch.put(Node::new(0, "one", vec![ChildRef::Segment(0)], Tier::Actionable));
        store.apply(batch).await.unwrap();

        let other = Node::new(0, "two", vec![ChildRef::Segment(0)], Tier::Actionable);
        let err = store.put(&other).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn revise_appends_and_locks() {
        let store = InMemoryStore::new();
        let node = Node::new(0, "one", vec![ChildRef::Segment(0)], Tier::Actionable);
        let mut batch = WriteBatch::new();
        batch.put_segment(seg(0, "a")).put(node.clone());
        store.apply(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.revise(Revision {
            id: node.id.clone(),
            text: "two".into(),
            vector: Some(vec![1.0]),
            lock: true,
            instruction: Some("shorter".into()),
            unless_locked: false,
        });
        let written = store.apply(batch).await.unwrap();
        assert_eq!(written.len(), 1);
        let stored = store.get(&node.id).await.unwrap();
        assert_eq!(stored.text, "two");
        assert!(stored.metadata.locked);
        assert_eq!(stored.metadata.edit_log, vec!["shorter".to_string()]);
        assert_eq!(
            store.parent_of(&ChildRef::Segment(0)).await.unwrap(),
            Some(node.id.clone())
        );
    }

    #[tokio::test]
    async fn next_segment_index_follows_highest() {
        let store = InMemoryStore::new();
        assert_eq!(store.next_segment_index().await.unwrap(), 0);
        let mut batch = WriteBatch::new();
        batch.put_segment(seg(0, "a")).put_segment(seg(4, "b"));
        store.apply(batch).await.unwrap();
        assert_eq!(store.next_segment_index().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn reserved_indices_are_not_handed_out_twice() {
        let store = InMemoryStore::new();
        assert_eq!(store.reserve_segment_indices(3).await.unwrap(), 0);
        assert_eq!(store.reserve_segment_indices(2).await.unwrap(), 3);
        assert_eq!(store.next_segment_index().await.unwrap(), 5);

        let mut batch = WriteBatch::new();
        batch.put_segment(seg(9, "a"));
        store.apply(batch).await.unwrap();
        assert_eq!(store.reserve_segment_indices(1).await.unwrap(), 10);
    }
}
