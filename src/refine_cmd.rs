//! `canopy refine` and `canopy regenerate`.

use anyhow::Result;

use canopy_core::models::NodeId;

use crate::config::Config;
use crate::engine::Engine;

/// Rewrite one node following `instruction` and lock it.
///
/// With `root`, the node must belong to that tree.
pub async fn run_refine(
    config: &Config,
    id: &str,
    instruction: &str,
    root: Option<&str>,
) -> Result<()> {
    let engine = Engine::open(config).await?;
    let result = async {
        let refiner = engine.refiner()?;
        let id = NodeId::from(id);
        let node = match root {
            Some(root) => {
                refiner
                    .refine_in_tree(&NodeId::from(root), &id, instruction)
                    .await?
            }
            None => refiner.refine(&id, instruction).await?,
        };
        Ok::<_, anyhow::Error>(node)
    }
    .await;
    engine.close().await;
    let node = result?;

    println!(
        "Refined node {} (level {}, {}, locked)",
        node.id,
        node.level,
        node.tier()
    );
    println!();
    println!("{}", node.text);
    Ok(())
}

/// Re-synthesise every unlocked node of a tree.
pub async fn run_regenerate(config: &Config, root: &str) -> Result<()> {
    let engine = Engine::open(config).await?;
    let result = async {
        let regenerator = engine.regenerator()?;
        Ok::<_, anyhow::Error>(regenerator.regenerate(&NodeId::from(root)).await?)
    }
    .await;
    engine.close().await;
    let report = result?;

    println!(
        "Regenerated {} node(s), skipped {} locked node(s)",
        report.regenerated, report.skipped_locked
    );
    Ok(())
}
