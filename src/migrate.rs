use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Segments: immutable leaf text keyed by sequence index
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segments (
            seq INTEGER PRIMARY KEY,
            text TEXT NOT NULL,
            span_start INTEGER NOT NULL,
            span_end INTEGER NOT NULL,
            vector BLOB
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Nodes: children stored as a JSON list of tagged references
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            level INTEGER NOT NULL,
            text TEXT NOT NULL,
            children_json TEXT NOT NULL,
            vector BLOB,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Parent index: one parent per child key (`s:<seq>` / `n:<id>`)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS node_parents (
            child_key TEXT PRIMARY KEY,
            parent_id TEXT NOT NULL,
            FOREIGN KEY (parent_id) REFERENCES nodes(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Tree registry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trees (
            root_id TEXT PRIMARY KEY,
            label TEXT,
            segment_count INTEGER NOT NULL,
            depth INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (root_id) REFERENCES nodes(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Segment index reservations: a single row holding the next free index
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS segment_counter (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            next_seq INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_node_parents_parent ON node_parents(parent_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trees_created_at ON trees(created_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
