//! On-demand view of one tree.
//!
//! A [`DocumentTree`] is a root identifier plus a store handle. It holds
//! no node bodies; every traversal fetches from the store.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::{ChildRef, Node, NodeId};
use crate::store::NodeStore;

/// Result of [`DocumentTree::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeReport {
    pub nodes: usize,
    pub segments: usize,
    pub depth: u32,
    pub locked: usize,
    /// Human-readable invariant violations; empty for a valid tree.
    pub problems: Vec<String>,
}

impl TreeReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Clone)]
pub struct DocumentTree {
    root: NodeId,
    store: Arc<dyn NodeStore>,
}

impl DocumentTree {
    pub fn new(root: NodeId, store: Arc<dyn NodeStore>) -> Self {
        Self { root, store }
    }

    pub fn root(&self) -> &NodeId {
        &self.root
    }

    pub async fn root_node(&self) -> Result<Node> {
        self.store.get(&self.root).await
    }

    /// Number of levels (root level + 1).
    pub async fn depth(&self) -> Result<u32> {
        Ok(self.root_node().await?.level + 1)
    }

    /// Every node in pre-order, children in stored order.
    pub async fn walk(&self) -> Result<Vec<Node>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![self.root.clone()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                return Err(Error::conflict(&id, "node reached twice while walking the tree"));
            }
            let node = self.store.get(&id).await?;
            let children: Vec<NodeId> = node.child_nodes().cloned().collect();
            stack.extend(children.into_iter().rev());
            out.push(node);
        }
        Ok(out)
    }

    /// Segment indices in leaf order.
    pub async fn segment_indices(&self) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        for node in self.walk().await? {
            out.extend(node.children.iter().filter_map(|c| match c {
                ChildRef::Segment(i) => Some(*i),
                ChildRef::Node(_) => None,
            }));
        }
        Ok(out)
    }

    /// Identifiers from `id` up to and including the root.
    ///
    /// Fails with `NodeNotFound` when `id` is not in this tree.
    pub async fn path_to_root(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        self.store.get(id).await?;
        let mut path = vec![id.clone()];
        let mut current = id.clone();
        while current != self.root {
            match self.store.parent_of(&ChildRef::Node(current.clone())).await? {
                Some(parent) if !path.contains(&parent) => {
                    path.push(parent.clone());
                    current = parent;
                }
                _ => return Err(Error::NodeNotFound(id.clone())),
            }
        }
        Ok(path)
    }

    pub async fn contains(&self, id: &NodeId) -> Result<bool> {
        match self.path_to_root(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check the structural invariants of the tree.
    ///
    /// Storage errors are returned; invariant violations are collected in
    /// [`TreeReport::problems`].
    pub async fn validate(&self) -> Result<TreeReport> {
        let mut report = TreeReport::default();
        let root = self.root_node().await?;
        report.depth = root.level + 1;
        if let Some(parent) = self.store.parent_of(&ChildRef::Node(root.id.clone())).await? {
            report
                .problems
                .push(format!("root {} has parent {}", root.id, parent));
        }

        let mut seen_nodes = HashSet::from([root.id.clone()]);
        let mut seen_segments = HashSet::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            report.nodes += 1;
            if node.is_locked() {
                report.locked += 1;
            }
            if node.children.is_empty() {
                report.problems.push(format!("node {} has no children", node.id));
            }

            let mut sibling_level = None;
            for child in &node.children {
                match self.store.parent_of(child).await? {
                    Some(p) if p == node.id => {}
                    other => report.problems.push(format!(
                        "parent index for {} is {:?}, expected {}",
                        child, other, node.id
                    )),
                }
                match child {
                    ChildRef::Segment(i) => {
                        if node.level != 0 {
                            report.problems.push(format!(
                                "segment {} under level-{} node {}",
                                i, node.level, node.id
                            ));
                        }
                        if !seen_segments.insert(*i) {
                            report.problems.push(format!("segment {} reached twice", i));
                        }
                        if let Err(e) = self.store.get_segment(*i).await {
                            if !e.is_not_found() {
                                return Err(e);
                            }
                            report.problems.push(format!("segment {} is missing", i));
                        }
                        report.segments += 1;
                    }
                    ChildRef::Node(id) => {
                        if !seen_nodes.insert(id.clone()) {
                            report.problems.push(format!("node {} reached twice", id));
                            continue;
                        }
                        let c = match self.store.get(id).await {
                            Ok(c) => c,
                            Err(e) if e.is_not_found() => {
                                report.problems.push(format!("node {} is missing", id));
                                continue;
                            }
                            Err(e) => return Err(e),
                        };
                        if c.level >= node.level {
                            report.problems.push(format!(
                                "node {} (level {}) is not below parent {} (level {})",
                                c.id, c.level, node.id, node.level
                            ));
                        }
                        match sibling_level {
                            None => sibling_level = Some(c.level),
                            Some(l) if l != c.level => report.problems.push(format!(
                                "children of {} span levels {} and {}",
                                node.id, l, c.level
                            )),
                            Some(_) => {}
                        }
                        stack.push(c);
                    }
                }
            }
        }
        Ok(report)
    }
}
