//! Wiring between configuration and the core engine.
//!
//! [`Engine::open`] connects to SQLite, applies the schema and builds the
//! collaborators named in the config. Commands then ask it for a
//! [`TreeBuilder`], [`RefinementController`] or [`Regenerator`].

use anyhow::{Context, Result};
use std::sync::Arc;

use canopy_core::builder::{BuildObserver, TreeBuilder};
use canopy_core::embedding::Vectorizer;
use canopy_core::grouping::{GroupingOracle, KMeansOracle, SequentialOracle};
use canopy_core::models::NodeId;
use canopy_core::refine::RefinementController;
use canopy_core::regenerate::Regenerator;
use canopy_core::segment::ParagraphSegmenter;
use canopy_core::store::NodeStore;
use canopy_core::synth::Synthesizer;
use canopy_core::tree::DocumentTree;

use crate::config::{Config, GroupingConfig};
use crate::db;
use crate::embedding::create_vectorizer;
use crate::migrate;
use crate::sqlite_store::SqliteStore;
use crate::synthesis::create_synthesizer;

/// Instantiate the grouping oracle named by `grouping.method`.
pub fn create_oracle(config: &GroupingConfig) -> Result<Arc<dyn GroupingOracle>> {
    match config.method.as_str() {
        "kmeans" => Ok(Arc::new(KMeansOracle::new(config.max_iterations))),
        "sequential" => Ok(Arc::new(SequentialOracle)),
        other => anyhow::bail!("Unknown grouping method: {}", other),
    }
}

pub struct Engine {
    config: Config,
    store: Arc<SqliteStore>,
}

impl Engine {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool)
            .await
            .context("Failed to apply schema migrations")?;
        let store = SqliteStore::new(pool, config.store.retry_policy());
        Ok(Self {
            config: config.clone(),
            store: Arc::new(store),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn NodeStore> {
        self.store.clone()
    }

    pub fn tree(&self, root: &str) -> DocumentTree {
        DocumentTree::new(NodeId::from(root), self.store())
    }

    pub fn segmenter(&self) -> ParagraphSegmenter {
        ParagraphSegmenter::new(self.config.segmentation.max_tokens)
    }

    fn vectorizer(&self) -> Result<Arc<dyn Vectorizer>> {
        create_vectorizer(&self.config.embedding).context("Failed to create vectorizer")
    }

    fn synthesizer(&self) -> Result<Arc<dyn Synthesizer>> {
        create_synthesizer(&self.config.synthesis).context("Failed to create synthesizer")
    }

    pub fn builder(
        &self,
        label: Option<String>,
        observer: Arc<dyn BuildObserver>,
    ) -> Result<TreeBuilder> {
        let builder = TreeBuilder::new(
            self.store(),
            self.vectorizer()?,
            create_oracle(&self.config.grouping)?,
            self.synthesizer()?,
            self.config.build.options(label)?,
        );
        Ok(builder.with_observer(observer))
    }

    pub fn refiner(&self) -> Result<RefinementController> {
        Ok(RefinementController::new(
            self.store(),
            self.vectorizer()?,
            self.synthesizer()?,
            self.config.synthesis.refine_options(),
        ))
    }

    pub fn regenerator(&self) -> Result<Regenerator> {
        Ok(Regenerator::new(
            self.store(),
            self.vectorizer()?,
            self.synthesizer()?,
            self.config.build.retry_policy(),
        ))
    }

    pub async fn close(self) {
        self.store.pool().close().await;
    }
}
