//! Node store abstraction.
//!
//! The [`NodeStore`] trait is the only place node state lives: trees hold
//! identifiers, never node bodies. Reads are single-record lookups; writes
//! go through [`WriteBatch`]es that a backend commits atomically (all
//! visible or none), so readers never observe a half-written node.
//!
//! Implementations must be `Send + Sync` to be shared across tasks.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`get`](NodeStore::get) | Fetch a node, `NodeNotFound` if absent |
//! | [`get_segment`](NodeStore::get_segment) | Fetch a segment, `SegmentNotFound` if absent |
//! | [`children_of`](NodeStore::children_of) | Ordered child references of a node |
//! | [`parent_of`](NodeStore::parent_of) | Parent lookup through the parent index |
//! | [`apply`](NodeStore::apply) | Commit a write batch atomically |
//! | [`put`](NodeStore::put) | Insert-or-replace a single node |
//! | [`next_segment_index`](NodeStore::next_segment_index) | First unused segment index |
//! | [`reserve_segment_indices`](NodeStore::reserve_segment_indices) | Claim a range of segment indices |
//! | [`list_trees`](NodeStore::list_trees) | Registered trees, newest first |
//! | [`subscribe`](NodeStore::subscribe) | Commit notifications |

pub mod memory;
pub mod rules;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::models::{ChildRef, Node, NodeId, Segment, TreeRecord};

/// Text/vector rewrite applied against the node's state at commit time.
///
/// Child list, level and identifier are never touched.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub id: NodeId,
    pub text: String,
    pub vector: Option<Vec<f32>>,
    /// Set `locked = true` (never clears an existing lock).
    pub lock: bool,
    /// Instruction appended to `edit_log`.
    pub instruction: Option<String>,
    /// Skip the revision if the node is locked when the batch commits.
    pub unless_locked: bool,
}

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    PutSegment(Segment),
    PutNode(Node),
    Revise(Revision),
    PutTree(TreeRecord),
}

/// Ordered set of writes committed as one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_segment(&mut self, segment: Segment) -> &mut Self {
        self.ops.push(WriteOp::PutSegment(segment));
        self
    }

    pub fn put(&mut self, node: Node) -> &mut Self {
        self.ops.push(WriteOp::PutNode(node));
        self
    }

    pub fn revise(&mut self, revision: Revision) -> &mut Self {
        self.ops.push(WriteOp::Revise(revision));
        self
    }

    pub fn put_tree(&mut self, record: TreeRecord) -> &mut Self {
        self.ops.push(WriteOp::PutTree(record));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Notification broadcast after every successful commit.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Committed {
        nodes: Vec<NodeId>,
        segments: Vec<u64>,
    },
}

/// Abstract node store.
///
/// All operations are async (via `async-trait`). A backend must commit
/// each [`WriteBatch`] atomically and isolated from concurrent readers,
/// resolve concurrent writers to the same node last-writer-wins, and
/// release any write context on every error path.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch a node by identifier.
    async fn get(&self, id: &NodeId) -> Result<Node>;

    /// Fetch a segment by sequence index.
    async fn get_segment(&self, index: u64) -> Result<Segment>;

    /// Ordered child references of a node.
    async fn children_of(&self, id: &NodeId) -> Result<Vec<ChildRef>> {
        Ok(self.get(id).await?.children)
    }

    /// Parent of a node or segment, if any node lists it as a child.
    async fn parent_of(&self, child: &ChildRef) -> Result<Option<NodeId>>;

    /// Commit a batch atomically. Returns the final state of every node
    /// the batch wrote, in batch order (skipped revisions are omitted).
    async fn apply(&self, batch: WriteBatch) -> Result<Vec<Node>>;

    /// Insert-or-replace a single node.
    ///
    /// Fails with `Conflict` if the node exists with a different child
    /// list or level, or if the new edit log does not extend the stored one.
    async fn put(&self, node: &Node) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(node.clone());
        self.apply(batch).await.map(|_| ())
    }

    /// First segment index neither stored nor reserved.
    async fn next_segment_index(&self) -> Result<u64>;

    /// Atomically claim `count` consecutive segment indices and return the
    /// first. A claimed range is never handed out again, even if the
    /// caller never writes it, so concurrent builds cannot collide.
    async fn reserve_segment_indices(&self, count: u64) -> Result<u64>;

    /// Registered trees, newest first.
    async fn list_trees(&self) -> Result<Vec<TreeRecord>>;

    /// Receive a [`StoreEvent`] for every commit after this call.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Scoped write helper available on every [`NodeStore`].
#[async_trait]
pub trait StoreExt: NodeStore {
    /// Build a batch inside `f` and commit it atomically.
    ///
    /// `f` is synchronous: no external call can happen while the write
    /// context is being assembled. If `f` fails nothing is written.
    async fn transaction<T, F>(&self, f: F) -> Result<(T, Vec<Node>)>
    where
        F: FnOnce(&mut WriteBatch) -> Result<T> + Send,
        T: Send,
    {
        let mut batch = WriteBatch::new();
        let value = f(&mut batch)?;
        if batch.is_empty() {
            return Ok((value, Vec::new()));
        }
        let written = self.apply(batch).await?;
        Ok((value, written))
    }
}

impl<S: NodeStore + ?Sized> StoreExt for S {}

/// Build the [`StoreEvent`] for a committed batch.
pub fn committed_event(ops: &[WriteOp], written: &[Node]) -> StoreEvent {
    let segments = ops
        .iter()
        .filter_map(|op| match op {
            WriteOp::PutSegment(s) => Some(s.index),
            _ => None,
        })
        .collect();
    StoreEvent::Committed {
        nodes: written.iter().map(|n| n.id.clone()).collect(),
        segments,
    }
}
