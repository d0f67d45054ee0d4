//! Read-only commands: `trees`, `show`, `get` and `check`.
//!
//! Everything here reads through the [`NodeStore`] trait; nothing writes.

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};
use serde::Serialize;

use canopy_core::models::{ChildRef, Node, NodeId};
use canopy_core::store::NodeStore;

use crate::config::Config;
use crate::engine::Engine;

/// Node shape printed by `canopy get` (vectors omitted).
#[derive(Debug, Clone, Serialize)]
pub struct NodeResponse {
    pub id: String,
    pub level: u32,
    pub tier: String,
    pub locked: bool,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub edit_log: Vec<String>,
    pub has_vector: bool,
    pub created_at: String,
    pub updated_at: String,
    pub text: String,
}

pub async fn get_node(store: &dyn NodeStore, id: &str) -> Result<NodeResponse> {
    let node = store.get(&NodeId::from(id)).await?;
    let parent = store.parent_of(&ChildRef::Node(node.id.clone())).await?;
    Ok(NodeResponse {
        id: node.id.to_string(),
        level: node.level,
        tier: node.tier().to_string(),
        locked: node.is_locked(),
        parent: parent.map(|p| p.to_string()),
        children: node.children.iter().map(ChildRef::key).collect(),
        edit_log: node.metadata.edit_log.clone(),
        has_vector: node.vector.is_some(),
        created_at: format_ts(node.created_at),
        updated_at: format_ts(node.updated_at),
        text: node.text,
    })
}

fn format_ts(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

fn preview(text: &str, max_chars: usize) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() <= max_chars {
        return line;
    }
    let cut: String = line.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

fn outline_line(node: &Node, indent: usize) -> String {
    format!(
        "{}[L{} {}{}] {}  {}",
        "  ".repeat(indent),
        node.level,
        node.tier(),
        if node.is_locked() { ", locked" } else { "" },
        node.id,
        preview(&node.text, 80)
    )
}

/// Indented outline of the tree, at most `max_depth` levels below the root.
pub async fn outline(
    store: &dyn NodeStore,
    root: &str,
    max_depth: Option<u32>,
) -> Result<Vec<String>> {
    let root = store.get(&NodeId::from(root)).await?;
    let mut lines = Vec::new();
    let mut stack: Vec<(Node, usize)> = vec![(root, 0)];
    while let Some((node, indent)) = stack.pop() {
        lines.push(outline_line(&node, indent));
        if max_depth.is_some_and(|d| indent as u32 >= d) {
            continue;
        }
        let mut children = Vec::new();
        for child in node.child_nodes() {
            children.push(store.get(child).await?);
        }
        if children.is_empty() && !node.children.is_empty() {
            lines.push(format!(
                "{}({} segments)",
                "  ".repeat(indent + 1),
                node.children.len()
            ));
        }
        stack.extend(children.into_iter().rev().map(|c| (c, indent + 1)));
    }
    Ok(lines)
}

pub async fn run_trees(config: &Config) -> Result<()> {
    let engine = Engine::open(config).await?;
    let trees = engine.store().list_trees().await;
    engine.close().await;
    let trees = trees?;

    if trees.is_empty() {
        println!("No trees. Run `canopy build <file>` to create one.");
        return Ok(());
    }
    for tree in trees {
        println!(
            "{}  depth {}  {} segments  {}  {}",
            tree.root,
            tree.depth,
            tree.segment_count,
            format_ts(tree.created_at),
            tree.label.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_show(config: &Config, root: &str, depth: Option<u32>) -> Result<()> {
    let engine = Engine::open(config).await?;
    let lines = outline(engine.store().as_ref(), root, depth).await;
    engine.close().await;
    for line in lines? {
        println!("{}", line);
    }
    Ok(())
}

pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let node = get_node(engine.store().as_ref(), id).await;
    engine.close().await;
    println!("{}", serde_json::to_string_pretty(&node?)?);
    Ok(())
}

/// Validate a tree; fails (non-zero exit) when any invariant is violated.
pub async fn run_check(config: &Config, root: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let report = engine.tree(root).validate().await;
    engine.close().await;
    let report = report?;

    println!(
        "{} nodes, {} segments, depth {}, {} locked",
        report.nodes, report.segments, report.depth, report.locked
    );
    if !report.is_valid() {
        for problem in &report.problems {
            println!("  problem: {}", problem);
        }
        bail!("tree {} has {} problem(s)", root, report.problems.len());
    }
    println!("OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_collapses_whitespace_and_truncates() {
        assert_eq!(preview("a\n\n b", 80), "a b");
        let long = "word ".repeat(40);
        let p = preview(&long, 20);
        assert!(p.ends_with("..."));
        assert!(p.chars().count() <= 20);
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        assert_eq!(format_ts(0), "1970-01-01T00:00:00+00:00");
    }
}
