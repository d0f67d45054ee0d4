//! # Canopy
//!
//! Hierarchical summary trees over large documents.
//!
//! A document is split into segments, and the segments are grouped and
//! summarised level by level until a single root remains. Any node can
//! later be refined in place with an instruction; refined nodes are
//! locked so bulk regeneration leaves them alone.
//!
//! The engine itself lives in `canopy-core`. This crate supplies the
//! SQLite-backed store, HTTP and offline model providers, document
//! extraction and the `canopy` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────┐
//! │  Document   │──▶│   TreeBuilder     │──▶│  SQLite   │
//! │ txt/pdf/docx│   │ group + summarise │   │ NodeStore │
//! └─────────────┘   └──────────────────┘   └────┬─────┘
//!                                                │
//!                     ┌──────────────────────────┤
//!                     ▼                          ▼
//!              ┌─────────────┐           ┌──────────────┐
//!              │  refine /   │           │ show / get / │
//!              │ regenerate  │           │ check/export │
//!              └─────────────┘           └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! canopy init                          # create database
//! canopy build report.pdf              # build a tree
//! canopy trees                         # list trees
//! canopy show <root> --depth 2         # outline
//! canopy refine <id> "focus on costs"  # rewrite and lock one node
//! canopy regenerate <root>             # refresh unlocked nodes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite `NodeStore` |
//! | [`embedding`] | Vectorizer backends |
//! | [`synthesis`] | Synthesizer backends |
//! | [`engine`] | Config → engine wiring |
//! | [`extract`] | Text extraction from input files |
//! | [`progress`] | Build progress on stderr |
//! | [`export`] | Nested JSON export |

pub mod build_cmd;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod export;
pub mod extract;
pub mod http;
pub mod inspect;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod refine_cmd;
pub mod sqlite_store;
pub mod synthesis;
