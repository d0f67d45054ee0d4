//! SQLite-backed [`NodeStore`] implementation.
//!
//! Each [`WriteBatch`] runs inside one SQLite transaction: every write is
//! validated with the shared lineage rules against the transaction's own
//! view, and any failure rolls the whole batch back (the transaction is
//! dropped uncommitted). Writers within one process are serialised by an
//! async mutex; writers across processes are serialised by SQLite itself.
//!
//! Transient failures (`SQLITE_BUSY`, `SQLITE_LOCKED`, pool timeouts, I/O)
//! are retried with bounded backoff and then surfaced as
//! [`Error::StoreIo`] carrying the attempt count.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::{broadcast, Mutex};

use canopy_core::embedding::{blob_to_vec, vec_to_blob};
use canopy_core::error::Error;
use canopy_core::models::{ChildRef, Node, NodeId, NodeMetadata, Segment, TreeRecord};
use canopy_core::retry::RetryPolicy;
use canopy_core::store::rules::{self, ChildLevel};
use canopy_core::store::{committed_event, NodeStore, StoreEvent, WriteBatch, WriteOp};

type CoreResult<T> = canopy_core::Result<T>;

/// Failure inside one attempt of a store operation.
#[derive(Debug)]
enum TxError {
    Db(sqlx::Error),
    Decode(anyhow::Error),
    Rule(Error),
}

impl From<sqlx::Error> for TxError {
    fn from(e: sqlx::Error) -> Self {
        TxError::Db(e)
    }
}

impl From<Error> for TxError {
    fn from(e: Error) -> Self {
        TxError::Rule(e)
    }
}

impl From<serde_json::Error> for TxError {
    fn from(e: serde_json::Error) -> Self {
        TxError::Decode(e.into())
    }
}

impl TxError {
    fn is_transient(&self) -> bool {
        match self {
            TxError::Db(e) => is_transient(e),
            _ => false,
        }
    }

    fn into_error(self, attempts: u32) -> Error {
        match self {
            TxError::Rule(e) => e,
            TxError::Db(e) => Error::StoreIo {
                attempts,
                source: Box::new(e),
            },
            TxError::Decode(e) => Error::StoreIo {
                attempts,
                source: e.into(),
            },
        }
    }
}

/// Busy/locked database, exhausted pool or I/O: worth another attempt.
fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let code = db.code();
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6) with their extended codes
            let primary = code
                .as_deref()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            matches!(primary, Some(5) | Some(6)) || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// SQLite implementation of the [`NodeStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    retry: RetryPolicy,
    write_lock: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            pool,
            retry,
            write_lock: Mutex::new(()),
            events,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, op: F) -> CoreResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, TxError>>,
    {
        self.retry
            .run(op, |e: &TxError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(
                        operation = what,
                        error = ?e,
                        "transient store failure, retrying"
                    );
                }
                retry
            })
            .await
            .map_err(|(e, attempts)| e.into_error(attempts))
    }

    async fn apply_once(&self, ops: &[WriteOp]) -> Result<Vec<Node>, TxError> {
        let mut tx = self.pool.begin().await?;
        let mut written: Vec<Node> = Vec::new();
        for op in ops {
            if let Some(node) = stage(&mut *tx, op).await? {
                match written.iter_mut().find(|n| n.id == node.id) {
                    Some(slot) => *slot = node,
                    None => written.push(node),
                }
            }
        }
        tx.commit().await?;
        Ok(written)
    }

    /// One statement, so the read of the current end and the counter
    /// update happen under the same write lock.
    async fn reserve_once(&self, count: i64) -> Result<i64, TxError> {
        let end: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO segment_counter (id, next_seq)
            SELECT 0, MAX(
                COALESCE((SELECT MAX(seq) + 1 FROM segments), 0),
                COALESCE((SELECT next_seq FROM segment_counter WHERE id = 0), 0)
            ) + ?
            WHERE true
            ON CONFLICT(id) DO UPDATE SET next_seq = excluded.next_seq
            RETURNING next_seq
            "#,
        )
        .bind(count)
        .fetch_one(&self.pool)
        .await?;
        Ok(end - count)
    }
}

/// First segment index that is neither stored nor reserved.
async fn fetch_next_seq(conn: &mut SqliteConnection) -> Result<i64, TxError> {
    let next: i64 = sqlx::query_scalar(
        "SELECT MAX(
             COALESCE((SELECT MAX(seq) + 1 FROM segments), 0),
             COALESCE((SELECT next_seq FROM segment_counter WHERE id = 0), 0)
         )",
    )
    .fetch_one(&mut *conn)
    .await?;
    Ok(next)
}

fn node_from_row(row: &SqliteRow) -> Result<Node, TxError> {
    let children: Vec<ChildRef> = serde_json::from_str(row.try_get::<&str, _>("children_json")?)?;
    let metadata: NodeMetadata = serde_json::from_str(row.try_get::<&str, _>("metadata_json")?)?;
    let vector: Option<Vec<u8>> = row.try_get("vector")?;
    Ok(Node {
        id: NodeId::from(row.try_get::<String, _>("id")?),
        level: row.try_get::<i64, _>("level")? as u32,
        text: row.try_get("text")?,
        children,
        vector: vector.map(|b| blob_to_vec(&b)),
        metadata,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn segment_from_row(row: &SqliteRow) -> Result<Segment, TxError> {
    let vector: Option<Vec<u8>> = row.try_get("vector")?;
    Ok(Segment {
        index: row.try_get::<i64, _>("seq")? as u64,
        text: row.try_get("text")?,
        span_start: row.try_get::<i64, _>("span_start")? as usize,
        span_end: row.try_get::<i64, _>("span_end")? as usize,
        vector: vector.map(|b| blob_to_vec(&b)),
    })
}

async fn fetch_node(conn: &mut SqliteConnection, id: &NodeId) -> Result<Option<Node>, TxError> {
    let row = sqlx::query(
        "SELECT id, level, text, children_json, vector, metadata_json, created_at, updated_at
         FROM nodes WHERE id = ?",
    )
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(node_from_row).transpose()
}

async fn fetch_segment(
    conn: &mut SqliteConnection,
    index: u64,
) -> Result<Option<Segment>, TxError> {
    let row = sqlx::query(
        "SELECT seq, text, span_start, span_end, vector FROM segments WHERE seq = ?",
    )
    .bind(index as i64)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(segment_from_row).transpose()
}

async fn fetch_parent(conn: &mut SqliteConnection, key: &str) -> Result<Option<NodeId>, TxError> {
    let parent: Option<String> =
        sqlx::query_scalar("SELECT parent_id FROM node_parents WHERE child_key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(parent.map(NodeId::from))
}

/// Stage one write inside the open transaction. Returns the node's final
/// state when the op wrote a node.
async fn stage(conn: &mut SqliteConnection, op: &WriteOp) -> Result<Option<Node>, TxError> {
    match op {
        WriteOp::PutSegment(segment) => {
            let existing = fetch_segment(conn, segment.index).await?;
            if rules::check_segment(existing.as_ref(), segment)? {
                sqlx::query(
                    "INSERT INTO segments (seq, text, span_start, span_end, vector)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(segment.index as i64)
                .bind(&segment.text)
                .bind(segment.span_start as i64)
                .bind(segment.span_end as i64)
                .bind(segment.vector.as_deref().map(vec_to_blob))
                .execute(&mut *conn)
                .await?;
            }
            Ok(None)
        }
        WriteOp::PutNode(node) => {
            if let Some(existing) = fetch_node(conn, &node.id).await? {
                rules::check_replace(&existing, node)?;
            }
            let mut levels = Vec::with_capacity(node.children.len());
            for child in &node.children {
                levels.push(match child {
                    ChildRef::Segment(i) => {
                        fetch_segment(conn, *i)
                            .await?
                            .ok_or(Error::SegmentNotFound(*i))?;
                        ChildLevel::Segment
                    }
                    ChildRef::Node(id) => {
                        let level: Option<i64> =
                            sqlx::query_scalar("SELECT level FROM nodes WHERE id = ?")
                                .bind(id.as_str())
                                .fetch_optional(&mut *conn)
                                .await?;
                        let level = level.ok_or_else(|| Error::NodeNotFound(id.clone()))?;
                        ChildLevel::Node(level as u32)
                    }
                });
            }
            rules::check_children(node, &levels)?;

            sqlx::query(
                r#"
                INSERT INTO nodes (id, level, text, children_json, vector, metadata_json,
                                   created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    text = excluded.text,
                    vector = excluded.vector,
                    metadata_json = excluded.metadata_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(node.id.as_str())
            .bind(node.level as i64)
            .bind(&node.text)
            .bind(serde_json::to_string(&node.children)?)
            .bind(node.vector.as_deref().map(vec_to_blob))
            .bind(serde_json::to_string(&node.metadata)?)
            .bind(node.created_at)
            .bind(node.updated_at)
            .execute(&mut *conn)
            .await?;

            for child in &node.children {
                let key = child.key();
                let current = fetch_parent(conn, &key).await?;
                rules::check_parent(child, current.as_ref(), &node.id)?;
                if current.is_none() {
                    sqlx::query("INSERT INTO node_parents (child_key, parent_id) VALUES (?, ?)")
                        .bind(&key)
                        .bind(node.id.as_str())
                        .execute(&mut *conn)
                        .await?;
                }
            }
            Ok(Some(node.clone()))
        }
        WriteOp::Revise(rev) => {
            let mut node = fetch_node(conn, &rev.id)
                .await?
                .ok_or_else(|| Error::NodeNotFound(rev.id.clone()))?;
            if !rules::apply_revision(&mut node, rev) {
                return Ok(None);
            }
            sqlx::query(
                "UPDATE nodes SET text = ?, vector = ?, metadata_json = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(&node.text)
            .bind(node.vector.as_deref().map(vec_to_blob))
            .bind(serde_json::to_string(&node.metadata)?)
            .bind(node.updated_at)
            .bind(node.id.as_str())
            .execute(&mut *conn)
            .await?;
            Ok(Some(node))
        }
        WriteOp::PutTree(record) => {
            if fetch_node(conn, &record.root).await?.is_none() {
                return Err(Error::NodeNotFound(record.root.clone()).into());
            }
            sqlx::query(
                r#"
                INSERT INTO trees (root_id, label, segment_count, depth, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(root_id) DO UPDATE SET
                    label = excluded.label,
                    segment_count = excluded.segment_count,
                    depth = excluded.depth
                "#,
            )
            .bind(record.root.as_str())
            .bind(&record.label)
            .bind(record.segment_count as i64)
            .bind(record.depth as i64)
            .bind(record.created_at)
            .execute(&mut *conn)
            .await?;
            Ok(None)
        }
    }
}

#[async_trait]
impl NodeStore for SqliteStore {
    async fn get(&self, id: &NodeId) -> CoreResult<Node> {
        self.with_retry("get", |_| async move {
            let mut conn = self.pool.acquire().await?;
            fetch_node(&mut *conn, id).await
        })
        .await?
        .ok_or_else(|| Error::NodeNotFound(id.clone()))
    }

    async fn get_segment(&self, index: u64) -> CoreResult<Segment> {
        self.with_retry("get_segment", |_| async move {
            let mut conn = self.pool.acquire().await?;
            fetch_segment(&mut *conn, index).await
        })
        .await?
        .ok_or(Error::SegmentNotFound(index))
    }

    async fn parent_of(&self, child: &ChildRef) -> CoreResult<Option<NodeId>> {
        let key = child.key();
        let key = key.as_str();
        self.with_retry("parent_of", |_| async move {
            let mut conn = self.pool.acquire().await?;
            fetch_parent(&mut *conn, key).await
        })
        .await
    }

    async fn apply(&self, batch: WriteBatch) -> CoreResult<Vec<Node>> {
        let ops = batch.into_ops();
        let _guard = self.write_lock.lock().await;
        let written = self
            .with_retry("apply", |_| self.apply_once(&ops))
            .await?;
        drop(_guard);

        tracing::debug!(ops = ops.len(), nodes = written.len(), "sqlite batch committed");
        let _ = self.events.send(committed_event(&ops, &written));
        Ok(written)
    }

    async fn next_segment_index(&self) -> CoreResult<u64> {
        self.with_retry("next_segment_index", |_| async move {
            let mut conn = self.pool.acquire().await?;
            Ok::<_, TxError>(fetch_next_seq(&mut *conn).await? as u64)
        })
        .await
    }

    async fn reserve_segment_indices(&self, count: u64) -> CoreResult<u64> {
        let count = i64::try_from(count).map_err(|_| {
            Error::InvalidInput(format!("cannot reserve {} segment indices", count))
        })?;
        self.with_retry("reserve_segment_indices", |_| self.reserve_once(count))
            .await
            .map(|first| first as u64)
    }

    async fn list_trees(&self) -> CoreResult<Vec<TreeRecord>> {
        self.with_retry("list_trees", |_| async move {
            let rows = sqlx::query(
                "SELECT root_id, label, segment_count, depth, created_at FROM trees
                 ORDER BY created_at DESC, rowid DESC",
            )
            .fetch_all(&self.pool)
            .await?;
            rows.iter()
                .map(|row| -> Result<TreeRecord, TxError> {
                    Ok(TreeRecord {
                        root: NodeId::from(row.try_get::<String, _>("root_id")?),
                        label: row.try_get("label")?,
                        segment_count: row.try_get::<i64, _>("segment_count")? as usize,
                        depth: row.try_get::<i64, _>("depth")? as u32,
                        created_at: row.try_get("created_at")?,
                    })
                })
                .collect::<Result<Vec<_>, TxError>>()
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
