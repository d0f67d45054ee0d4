//! Lineage rules shared by every store backend.
//!
//! Backends look up committed state their own way and call these checks
//! per write so that all of them reject the same mutations.

use crate::error::{Error, Result};
use crate::models::{ChildRef, Node, NodeId, Segment};

use super::Revision;

/// Check a segment write against what is stored under the same index.
///
/// Returns `true` when the segment must be inserted, `false` for an
/// identical re-put.
pub fn check_segment(existing: Option<&Segment>, new: &Segment) -> Result<bool> {
    match existing {
        None => Ok(true),
        Some(old) if old.same_content(new) => Ok(false),
        Some(_) => Err(Error::conflict(
            format!("segment {}", new.index),
            "segments are immutable once ingested",
        )),
    }
}

/// Check a node replacement: identifier lineage and edit log are fixed,
/// and a lock is never cleared.
pub fn check_replace(existing: &Node, new: &Node) -> Result<()> {
    if existing.children != new.children {
        return Err(Error::conflict(&new.id, "child list cannot change after creation"));
    }
    if existing.level != new.level {
        return Err(Error::conflict(
            &new.id,
            format!("level cannot change ({} -> {})", existing.level, new.level),
        ));
    }
    let old_log = &existing.metadata.edit_log;
    let new_log = &new.metadata.edit_log;
    if new_log.len() < old_log.len() || new_log[..old_log.len()] != old_log[..] {
        return Err(Error::conflict(&new.id, "edit_log is append-only"));
    }
    if existing.metadata.locked {
        if !new.metadata.locked {
            return Err(Error::conflict(&new.id, "a locked node cannot be unlocked"));
        }
        if existing.text != new.text && new_log.len() == old_log.len() {
            return Err(Error::conflict(
                &new.id,
                "locked text can only change with an edit_log entry",
            ));
        }
    }
    Ok(())
}

/// Level of a child as seen by [`check_children`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildLevel {
    Segment,
    Node(u32),
}

/// Check a node's children against their levels (in `children` order).
pub fn check_children(node: &Node, levels: &[ChildLevel]) -> Result<()> {
    if node.children.is_empty() {
        return Err(Error::conflict(&node.id, "node must have at least one child"));
    }
    let mut sibling_level = None;
    for (child, level) in node.children.iter().zip(levels) {
        match level {
            ChildLevel::Segment if node.level != 0 => {
                return Err(Error::conflict(
                    &node.id,
                    format!("{} can only be a child of a level-0 node", child),
                ));
            }
            ChildLevel::Segment => {}
            ChildLevel::Node(l) => {
                if *l >= node.level {
                    return Err(Error::conflict(
                        &node.id,
                        format!("{} at level {} is not below level {}", child, l, node.level),
                    ));
                }
                match sibling_level {
                    None => sibling_level = Some(*l),
                    Some(s) if s != *l => {
                        return Err(Error::conflict(
                            &node.id,
                            "children of one node must share a level",
                        ));
                    }
                    Some(_) => {}
                }
            }
        }
    }
    Ok(())
}

/// Check that `parent` may claim `child` given its current parent.
pub fn check_parent(child: &ChildRef, current: Option<&NodeId>, parent: &NodeId) -> Result<()> {
    match current {
        Some(p) if p != parent => Err(Error::conflict(
            parent,
            format!("{} already belongs to node {}", child, p),
        )),
        _ => Ok(()),
    }
}

/// Apply a revision to `node` in place. Returns `false` when skipped
/// because the node is locked and the revision asked to spare locked nodes.
pub fn apply_revision(node: &mut Node, rev: &Revision) -> bool {
    if rev.unless_locked && node.metadata.locked {
        return false;
    }
    node.text = rev.text.clone();
    node.vector = rev.vector.clone();
    if rev.lock {
        node.metadata.locked = true;
    }
    if let Some(instruction) = &rev.instruction {
        node.metadata.edit_log.push(instruction.clone());
    }
    node.updated_at = chrono::Utc::now().timestamp();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tier;

    fn leaf(children: Vec<ChildRef>) -> Node {
        Node::new(0, "text", children, Tier::Actionable)
    }

    #[test]
    fn replace_rejects_new_children() {
        let a = leaf(vec![ChildRef::Segment(0)]);
        let mut b = a.clone();
        b.children.push(ChildRef::Segment(1));
        assert!(check_replace(&a, &b).is_err());
    }

    #[test]
    fn replace_rejects_truncated_log() {
        let mut a = leaf(vec![ChildRef::Segment(0)]);
        a.metadata.edit_log = vec!["one".into(), "two".into()];
        let mut b = a.clone();
        b.metadata.edit_log.pop();
        assert!(check_replace(&a, &b).is_err());
        b.metadata.edit_log = vec!["two".into(), "one".into()];
        assert!(check_replace(&a, &b).is_err());
        b.metadata.edit_log = vec!["one".into(), "two".into(), "three".into()];
        assert!(check_replace(&a, &b).is_ok());
    }

    #[test]
    fn replace_keeps_locks() {
        let mut a = leaf(vec![ChildRef::Segment(0)]);
        a.metadata.locked = true;
        a.metadata.edit_log = vec!["shorter".into()];

        let mut unlocked = a.clone();
        unlocked.metadata.locked = false;
        assert!(check_replace(&a, &unlocked).is_err());

        let mut silent = a.clone();
        silent.text = "overwritten".into();
        assert!(check_replace(&a, &silent).is_err());

        let mut logged = silent.clone();
        logged.metadata.edit_log.push("rewrite by hand".into());
        assert!(check_replace(&a, &logged).is_ok());

        let mut revectored = a.clone();
        revectored.vector = Some(vec![1.0]);
        assert!(check_replace(&a, &revectored).is_ok());
    }

    #[test]
    fn children_levels() {
        let mut n = Node::new(
            2,
            "t",
            vec![ChildRef::Node("a".into()), ChildRef::Node("b".into())],
            Tier::Structural,
        );
        assert!(check_children(&n, &[ChildLevel::Node(1), ChildLevel::Node(1)]).is_ok());
        assert!(check_children(&n, &[ChildLevel::Node(1), ChildLevel::Node(0)]).is_err());
        assert!(check_children(&n, &[ChildLevel::Node(2), ChildLevel::Node(2)]).is_err());
        n.level = 1;
        assert!(check_children(&n, &[ChildLevel::Segment, ChildLevel::Segment]).is_err());
    }

    #[test]
    fn revision_respects_lock_guard() {
        let mut n = leaf(vec![ChildRef::Segment(0)]);
        n.metadata.locked = true;
        let rev = Revision {
            id: n.id.clone(),
            text: "new".into(),
            vector: None,
            lock: false,
            instruction: None,
            unless_locked: true,
        };
        assert!(!apply_revision(&mut n, &rev));
        assert_eq!(n.text, "text");
    }
}
