//! Build progress reporting.
//!
//! Implements [`BuildObserver`] so `canopy build` shows which level is
//! being synthesised and how many groups remain. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use canopy_core::builder::{BuildObserver, BuildProgressEvent};

/// Human-friendly progress on stderr: "build level 1  structural  3 / 12 groups".
pub struct StderrProgress;

impl BuildObserver for StderrProgress {
    fn on_event(&self, event: &BuildProgressEvent) {
        let line = match event {
            BuildProgressEvent::Started { segments } => {
                format!("build  {} segments\n", format_number(*segments as u64))
            }
            BuildProgressEvent::LevelStarted {
                level,
                items,
                groups,
                tier,
            } => format!(
                "build level {}  {}  {} items -> {} groups\n",
                level,
                tier,
                format_number(*items as u64),
                format_number(*groups as u64)
            ),
            BuildProgressEvent::GroupSynthesized {
                level,
                group,
                groups,
            } => format!(
                "build level {}  {} / {} groups\n",
                level,
                format_number(*group as u64 + 1),
                format_number(*groups as u64)
            ),
            BuildProgressEvent::Committed { root, depth, nodes } => format!(
                "build  committed {} nodes, depth {}, root {}\n",
                format_number(*nodes as u64),
                depth,
                root
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildObserver for JsonProgress {
    fn on_event(&self, event: &BuildProgressEvent) {
        let obj = json_event(event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

fn json_event(event: &BuildProgressEvent) -> serde_json::Value {
    match event {
        BuildProgressEvent::Started { segments } => serde_json::json!({
            "event": "progress",
            "phase": "started",
            "segments": segments
        }),
        BuildProgressEvent::LevelStarted {
            level,
            items,
            groups,
            tier,
        } => serde_json::json!({
            "event": "progress",
            "phase": "level",
            "level": level,
            "items": items,
            "groups": groups,
            "tier": tier.as_str()
        }),
        BuildProgressEvent::GroupSynthesized {
            level,
            group,
            groups,
        } => serde_json::json!({
            "event": "progress",
            "phase": "group",
            "level": level,
            "n": group + 1,
            "total": groups
        }),
        BuildProgressEvent::Committed { root, depth, nodes } => serde_json::json!({
            "event": "progress",
            "phase": "committed",
            "root": root.as_str(),
            "depth": depth,
            "nodes": nodes
        }),
    }
}

/// No-op observer when progress is disabled.
pub struct NoProgress;

impl BuildObserver for NoProgress {
    fn on_event(&self, _event: &BuildProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn observer(&self) -> Arc<dyn BuildObserver> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
