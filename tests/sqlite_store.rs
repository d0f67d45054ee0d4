use std::sync::Arc;
use std::time::Duration;

use sqlx::{Connection, SqliteConnection};
use tempfile::TempDir;

use canopy::config::parse_config;
use canopy::sqlite_store::SqliteStore;
use canopy::{db, migrate};
use canopy_core::builder::{BuildOptions, TreeBuilder};
use canopy_core::embedding::HashVectorizer;
use canopy_core::grouping::SequentialOracle;
use canopy_core::models::{ChildRef, Node, NodeId, Segment, Tier, TreeRecord};
use canopy_core::refine::{RefineOptions, RefinementController};
use canopy_core::retry::RetryPolicy;
use canopy_core::segment::ParagraphSegmenter;
use canopy_core::store::{NodeStore, Revision, StoreEvent, StoreExt, WriteBatch};
use canopy_core::synth::ExtractiveSynthesizer;
use canopy_core::tree::DocumentTree;
use canopy_core::{Error, ErrorKind};

async fn open_store(tmp: &TempDir) -> SqliteStore {
    open_store_with(tmp, "", RetryPolicy::none()).await
}

async fn open_store_with(tmp: &TempDir, extra: &str, retry: RetryPolicy) -> SqliteStore {
    let config = parse_config(&format!(
        "[db]\npath = \"{}\"\n{}",
        db_path(tmp),
        extra
    ))
    .unwrap();
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    SqliteStore::new(pool, retry)
}

fn db_path(tmp: &TempDir) -> String {
    format!("{}/canopy.sqlite", tmp.path().display())
}

fn document(paragraphs: usize) -> String {
    (0..paragraphs)
        .map(|i| format!("Paragraph {} talks about topic {}. It has a second sentence.", i, i))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn sqlite_builder(store: Arc<dyn NodeStore>, label: &str) -> TreeBuilder {
    TreeBuilder::new(
        store,
        Arc::new(HashVectorizer::new(32)),
        Arc::new(SequentialOracle),
        Arc::new(ExtractiveSynthesizer),
        BuildOptions {
            max_group_size_hint: Some(2),
            retry: RetryPolicy::none(),
            label: Some(label.into()),
            ..BuildOptions::default()
        },
    )
}

fn segment(index: u64, text: &str) -> Segment {
    Segment::new(index, text, 0, text.len())
}

#[tokio::test]
async fn node_and_segment_round_trip() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let node = Node::new(
        0,
        "summary",
        vec![ChildRef::Segment(0), ChildRef::Segment(1)],
        Tier::Actionable,
    )
    .with_vector(vec![0.25, -0.5, 1.0]);
    let mut batch = WriteBatch::new();
    batch
        .put_segment(segment(0, "first"))
        .put_segment(segment(1, "second"))
        .put(node.clone());
    store.apply(batch).await.unwrap();

    assert_eq!(store.get(&node.id).await.unwrap(), node);
    assert_eq!(store.get_segment(1).await.unwrap().text, "second");
    assert_eq!(
        store.parent_of(&ChildRef::Segment(0)).await.unwrap(),
        Some(node.id.clone())
    );
    assert_eq!(store.parent_of(&ChildRef::Node(node.id.clone())).await.unwrap(), None);
    assert_eq!(store.next_segment_index().await.unwrap(), 2);
}

#[tokio::test]
async fn missing_records_are_not_found() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let err = store.get(&NodeId::from("nope")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = store.get_segment(7).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(store.next_segment_index().await.unwrap(), 0);
}

#[tokio::test]
async fn old_rows_load_with_defaults_and_keep_unknown_keys() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    sqlx::query("INSERT INTO segments (seq, text, span_start, span_end) VALUES (0, 'leaf', 0, 4)")
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO nodes (id, level, text, children_json, created_at, updated_at)
         VALUES ('bare', 0, 'old text', '[{\"segment\":0}]', 1, 1)",
    )
    .execute(store.pool())
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO nodes (id, level, text, children_json, metadata_json, created_at, updated_at)
         VALUES ('legacy', 0, 'old text', '[]', '{\"legacy_score\": 0.5}', 1, 1)",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let bare = store.get(&NodeId::from("bare")).await.unwrap();
    assert_eq!(bare.metadata.abstraction_tier, None);
    assert_eq!(bare.tier(), Tier::Raw);
    assert!(!bare.is_locked());
    assert!(bare.metadata.edit_log.is_empty());
    assert_eq!(bare.vector, None);

    let legacy = store.get(&NodeId::from("legacy")).await.unwrap();
    assert!(legacy.metadata.extra.contains_key("legacy_score"));

    store
        .transaction(|batch| {
            batch.revise(Revision {
                id: legacy.id.clone(),
                text: "new text".into(),
                vector: None,
                lock: true,
                instruction: Some("shorter".into()),
                unless_locked: false,
            });
            Ok(())
        })
        .await
        .unwrap();

    let raw: String = sqlx::query_scalar("SELECT metadata_json FROM nodes WHERE id = 'legacy'")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let raw: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(raw["legacy_score"], 0.5);
    assert_eq!(raw["locked"], true);
    assert_eq!(raw["edit_log"][0], "shorter");
}

#[tokio::test]
async fn failed_batch_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let node = Node::new(
        0,
        "summary",
        vec![ChildRef::Segment(0), ChildRef::Segment(99)],
        Tier::Actionable,
    );
    let mut batch = WriteBatch::new();
    batch.put_segment(segment(0, "first")).put(node.clone());
    let err = store.apply(batch).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert!(store.get_segment(0).await.is_err());
    assert!(store.get(&node.id).await.is_err());
    assert_eq!(store.parent_of(&ChildRef::Segment(0)).await.unwrap(), None);
}

#[tokio::test]
async fn second_parent_and_lineage_changes_conflict() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let first = Node::new(0, "a", vec![ChildRef::Segment(0)], Tier::Actionable);
    let mut batch = WriteBatch::new();
    batch.put_segment(segment(0, "leaf")).put(first.clone());
    store.apply(batch).await.unwrap();

    let second = Node::new(0, "b", vec![ChildRef::Segment(0)], Tier::Actionable);
    let err = store.put(&second).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(store.get(&second.id).await.is_err());

    let mut moved = first.clone();
    moved.level = 3;
    assert_eq!(store.put(&moved).await.unwrap_err().kind(), ErrorKind::Conflict);

    let mut rewritten = first.clone();
    rewritten.text = "a, rewritten".into();
    store.put(&rewritten).await.unwrap();
    assert_eq!(store.get(&first.id).await.unwrap().text, "a, rewritten");

    let err = store.apply({
        let mut b = WriteBatch::new();
        b.put_segment(segment(0, "different leaf"));
        b
    })
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn trees_are_listed_newest_first() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    let mut batch = WriteBatch::new();
    let mut roots = Vec::new();
    for (i, created_at) in [100, 300, 200].into_iter().enumerate() {
        let children = vec![ChildRef::Segment(i as u64)];
        let node = Node::new(0, format!("root {}", i), children, Tier::Essential);
        batch.put_segment(segment(i as u64, "leaf")).put(node.clone());
        batch.put_tree(TreeRecord {
            root: node.id.clone(),
            label: Some(format!("doc {}", i)),
            segment_count: 1,
            depth: 1,
            created_at,
        });
        roots.push(node.id);
    }
    store.apply(batch).await.unwrap();

    let listed: Vec<NodeId> = store
        .list_trees()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.root)
        .collect();
    assert_eq!(listed, vec![roots[1].clone(), roots[2].clone(), roots[0].clone()]);
}

#[tokio::test]
async fn commits_are_broadcast() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let mut events = store.subscribe();

    let node = Node::new(0, "a", vec![ChildRef::Segment(0)], Tier::Actionable);
    let mut batch = WriteBatch::new();
    batch.put_segment(segment(0, "leaf")).put(node.clone());
    store.apply(batch).await.unwrap();

    let StoreEvent::Committed { nodes, segments } = events.recv().await.unwrap();
    assert_eq!(nodes, vec![node.id]);
    assert_eq!(segments, vec![0]);
}

#[tokio::test]
async fn build_and_refine_over_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store: Arc<dyn NodeStore> = Arc::new(open_store(&tmp).await);
    let vectorizer = Arc::new(HashVectorizer::new(32));
    let synthesizer = Arc::new(ExtractiveSynthesizer);

    let record = sqlite_builder(store.clone(), "notes")
        .build_text(&document(6), &ParagraphSegmenter::new(20))
        .await
        .unwrap();
    assert_eq!(record.segment_count, 6);

    let tree = DocumentTree::new(record.root.clone(), store.clone());
    let report = tree.validate().await.unwrap();
    assert!(report.is_valid(), "{:?}", report.problems);
    assert_eq!(report.segments, 6);
    assert_eq!(tree.segment_indices().await.unwrap(), (0..6).collect::<Vec<_>>());

    let trees = store.list_trees().await.unwrap();
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0].label.as_deref(), Some("notes"));

    let controller =
        RefinementController::new(store.clone(), vectorizer, synthesizer, RefineOptions::default());
    let leaf = tree
        .walk()
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.level == 0)
        .unwrap();
    let refined = controller
        .refine_in_tree(&record.root, &leaf.id, "only the topic")
        .await
        .unwrap();
    assert!(refined.is_locked());
    assert_eq!(refined.children, leaf.children);
    assert_eq!(store.get(&leaf.id).await.unwrap(), refined);
}

#[tokio::test]
async fn concurrent_builds_from_two_handles_claim_disjoint_segments() {
    let tmp = TempDir::new().unwrap();
    let retry = RetryPolicy::new(5, Duration::from_millis(5));
    let first: Arc<dyn NodeStore> = Arc::new(open_store_with(&tmp, "", retry).await);
    let second: Arc<dyn NodeStore> = Arc::new(open_store_with(&tmp, "", retry).await);
    let text = document(6);
    let segmenter = ParagraphSegmenter::new(20);

    let a = sqlite_builder(first.clone(), "a");
    let b = sqlite_builder(second.clone(), "b");
    let (ra, rb) = tokio::join!(
        a.build_text(&text, &segmenter),
        b.build_text(&text, &segmenter)
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let ia = DocumentTree::new(ra.root.clone(), first.clone())
        .segment_indices()
        .await
        .unwrap();
    let ib = DocumentTree::new(rb.root.clone(), first.clone())
        .segment_indices()
        .await
        .unwrap();
    let mut all: Vec<u64> = ia.iter().chain(&ib).copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..12).collect::<Vec<_>>());
    assert_eq!(first.list_trees().await.unwrap().len(), 2);
    assert_eq!(first.next_segment_index().await.unwrap(), 12);
}

#[tokio::test]
async fn reservations_survive_reopening() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    assert_eq!(store.reserve_segment_indices(4).await.unwrap(), 0);
    store.pool().close().await;

    let store = open_store(&tmp).await;
    assert_eq!(store.next_segment_index().await.unwrap(), 4);
    assert_eq!(store.reserve_segment_indices(2).await.unwrap(), 4);
}

#[tokio::test]
async fn busy_database_is_retried_then_surfaced() {
    let tmp = TempDir::new().unwrap();
    let store = open_store_with(
        &tmp,
        "\n[store]\nbusy_timeout_ms = 10\n",
        RetryPolicy::new(2, Duration::from_millis(1)),
    )
    .await;

    let mut other = SqliteConnection::connect(&format!("sqlite:{}", db_path(&tmp)))
        .await
        .unwrap();
    sqlx::query("BEGIN IMMEDIATE").execute(&mut other).await.unwrap();

    let node = Node::new(0, "a", vec![ChildRef::Segment(0)], Tier::Actionable);
    let mut batch = WriteBatch::new();
    batch.put_segment(segment(0, "leaf")).put(node.clone());

    let err = store.apply(batch.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreIo);
    match err {
        Error::StoreIo { attempts, .. } => assert_eq!(attempts, 3),
        e => panic!("unexpected error: {:?}", e),
    }

    sqlx::query("ROLLBACK").execute(&mut other).await.unwrap();
    store.apply(batch).await.unwrap();
    assert_eq!(store.get(&node.id).await.unwrap(), node);
}
