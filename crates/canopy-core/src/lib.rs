//! # Canopy Core
//!
//! Engine for building and maintaining hierarchical summary trees over
//! large documents: leaf segments are recursively grouped and abstracted
//! into fewer, higher-level nodes until a single root remains, and any
//! node can later be rewritten in place without rebuilding the tree.
//!
//! ```text
//!  segments ──▶ level 0 ──▶ level 1 ──▶ … ──▶ root
//!                 ▲            ▲                ▲
//!            Vectorizer · GroupingOracle · Synthesizer
//!                          │
//!                     NodeStore (atomic commits)
//! ```
//!
//! The crate contains no database, HTTP or filesystem code. Concrete
//! stores, vectorizers and synthesizers live in the `canopy` app crate;
//! this crate ships an [`store::memory::InMemoryStore`] plus offline
//! collaborators suitable for tests.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | `Segment`, `Node`, `NodeMetadata`, `Tier`, `ChildRef` |
//! | [`store`] | `NodeStore` trait, write batches, commit events |
//! | [`segment`] | `Segmenter` trait and paragraph segmenter |
//! | [`embedding`] | `Vectorizer` trait, hashing vectorizer, vector utilities |
//! | [`grouping`] | `GroupingOracle` trait, partition normalisation, oracles |
//! | [`strategy`] | Synthesis strategies and the level → tier policy |
//! | [`synth`] | `Synthesizer` trait |
//! | [`builder`] | `TreeBuilder`: level-by-level construction |
//! | [`refine`] | `RefinementController`: single-node rewrites |
//! | [`regenerate`] | Bulk regeneration that respects locked nodes |
//! | [`tree`] | `DocumentTree`: on-demand traversal and validation |

pub mod builder;
pub mod embedding;
pub mod error;
pub mod grouping;
pub mod models;
pub mod refine;
pub mod regenerate;
pub mod retry;
pub mod segment;
pub mod store;
pub mod strategy;
pub mod synth;
pub mod tree;

pub use builder::{BuildObserver, BuildOptions, BuildProgressEvent, TreeBuilder};
pub use error::{Error, ErrorKind, Result};
pub use models::{ChildRef, Node, NodeId, NodeMetadata, Segment, Tier, TreeRecord};
pub use refine::{RefineOptions, RefinementController};
pub use regenerate::{RegenerationReport, Regenerator};
pub use store::{NodeStore, StoreEvent, StoreExt, WriteBatch};
pub use strategy::{Strategy, StrategyTable};
pub use tree::{DocumentTree, TreeReport};
