//! `canopy build`: extract a document, segment it and build its tree.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use canopy_core::builder::BuildObserver;
use canopy_core::models::TreeRecord;

use crate::config::Config;
use crate::engine::Engine;
use crate::extract::load_document;
use crate::progress::ProgressMode;

/// Build a tree for the file at `path` into an open engine.
///
/// The label defaults to the file name.
pub async fn build_document(
    engine: &Engine,
    path: &Path,
    label: Option<String>,
    observer: Arc<dyn BuildObserver>,
) -> Result<TreeRecord> {
    let text = load_document(path)?;
    let label = label.or_else(|| {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
    });
    let builder = engine.builder(label, observer)?;
    let segmenter = engine.segmenter();
    let record = builder
        .build_text(&text, &segmenter)
        .await
        .with_context(|| format!("Failed to build tree for {}", path.display()))?;
    Ok(record)
}

pub async fn run_build(
    config: &Config,
    path: &Path,
    label: Option<String>,
    progress: ProgressMode,
) -> Result<()> {
    let engine = Engine::open(config).await?;
    let result = build_document(&engine, path, label, progress.observer()).await;
    engine.close().await;
    let record = result?;

    println!("Built tree {}", record.root);
    println!(
        "  {} segments, depth {}{}",
        record.segment_count,
        record.depth,
        record
            .label
            .as_deref()
            .map(|l| format!(", label \"{}\"", l))
            .unwrap_or_default()
    );
    Ok(())
}
