//! Export a tree as nested JSON.
//!
//! Each node carries its text and metadata; level-0 nodes embed their
//! segments. Vectors are not exported.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use canopy_core::models::{ChildRef, Node, NodeId, Segment};
use canopy_core::store::NodeStore;
use canopy_core::tree::DocumentTree;

use crate::config::Config;
use crate::engine::Engine;

#[derive(Debug, Serialize)]
pub struct ExportNode {
    pub id: String,
    pub level: u32,
    pub tier: String,
    pub locked: bool,
    pub edit_log: Vec<String>,
    pub text: String,
    pub children: Vec<ExportChild>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExportChild {
    Node(ExportNode),
    Segment {
        index: u64,
        span_start: usize,
        span_end: usize,
        text: String,
    },
}

/// Load the whole tree rooted at `root` into its nested export form.
pub async fn export_tree(tree: &DocumentTree, store: &dyn NodeStore) -> Result<ExportNode> {
    let nodes = tree.walk().await?;
    let mut segments = HashMap::new();
    for index in tree.segment_indices().await? {
        segments.insert(index, store.get_segment(index).await?);
    }
    let mut by_id: HashMap<NodeId, Node> = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
    assemble(tree.root(), &mut by_id, &mut segments)
}

fn assemble(
    id: &NodeId,
    nodes: &mut HashMap<NodeId, Node>,
    segments: &mut HashMap<u64, Segment>,
) -> Result<ExportNode> {
    let node = nodes
        .remove(id)
        .with_context(|| format!("node {} missing from walk", id))?;
    let mut children = Vec::with_capacity(node.children.len());
    for child in &node.children {
        children.push(match child {
            ChildRef::Node(c) => ExportChild::Node(assemble(c, nodes, segments)?),
            ChildRef::Segment(i) => {
                let segment = segments
                    .remove(i)
                    .with_context(|| format!("segment {} missing from walk", i))?;
                ExportChild::Segment {
                    index: segment.index,
                    span_start: segment.span_start,
                    span_end: segment.span_end,
                    text: segment.text,
                }
            }
        });
    }
    Ok(ExportNode {
        id: node.id.to_string(),
        level: node.level,
        tier: node.tier().to_string(),
        locked: node.is_locked(),
        edit_log: node.metadata.edit_log,
        text: node.text,
        children,
    })
}

/// Export the tree as JSON.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(config: &Config, root: &str, output: Option<&Path>) -> Result<()> {
    let engine = Engine::open(config).await?;
    let store = engine.store();
    let exported = export_tree(&engine.tree(root), store.as_ref()).await;
    engine.close().await;
    let exported = exported?;

    let json = serde_json::to_string_pretty(&exported)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Exported tree {} to {}", root, path.display());
        }
        None => {
            println!("{}", json);
        }
    }
    Ok(())
}
