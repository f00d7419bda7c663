//! Library-level tests of the ingestion pipeline, search and trust over
//! SQLite, driven by a scripted feed and a deterministic gateway.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use credence::app::App;
use credence::config::parse_config;
use credence::ingest::{
    run_with_retry, Checkpoints, Coordinator, EmbedContext, IngestOptions, StopReason, FEED_SOURCE,
};
use credence_core::chunk::{chunk_text, ByteCodec};
use credence_core::embedding::{EmbeddingGateway, StaticGateway};
use credence_core::feed::{Feed, ScriptedFeed};
use credence_core::index::memory::InMemoryIndex;
use credence_core::index::SimilarityIndex;
use credence_core::models::{Document, Embedding, FeedPage, FeedRecord, TrustDirection};
use credence_core::search::{search, SearchFilter, SearchRequest};
use credence_core::store::memory::InMemoryStore;
use credence_core::store::RecordStore;
use credence_core::trust::{adjust_trust, InitialTrust, TrustParams};
use credence_core::{Error, Result};

const DIMS: usize = 8;

async fn open_app() -> (TempDir, App) {
    let tmp = TempDir::new().unwrap();
    let config = parse_config(&format!(
        "[db]\npath = \"{}\"\n[embedding]\ndims = {}\n",
        tmp.path().join("credence.sqlite").display(),
        DIMS
    ))
    .unwrap();
    let app = App::open(&config).await.unwrap();
    (tmp, app)
}

fn rec(id: &str, title: &str, text: &str) -> FeedRecord {
    FeedRecord {
        id: id.to_string(),
        title: title.to_string(),
        text: text.to_string(),
        ..FeedRecord::default()
    }
}

fn page(records: Vec<FeedRecord>) -> FeedPage {
    FeedPage {
        records,
        next_cursor: None,
    }
}

fn two_pages() -> Vec<FeedPage> {
    vec![
        page(vec![rec("1", "one", "first body"), rec("2", "two", "second body")]),
        page(vec![rec("3", "three", "third body"), rec("4", "four", "fourth body")]),
    ]
}

fn options(limit: Option<usize>, full: bool) -> IngestOptions {
    IngestOptions {
        page_size: 100,
        limit,
        full,
        concurrency: 4,
        fetch_timeout: Duration::from_secs(5),
    }
}

fn coordinator(
    app: &App,
    feed: Arc<dyn Feed>,
    gateway: Arc<dyn EmbeddingGateway>,
    options: IngestOptions,
) -> Coordinator {
    Coordinator {
        feed,
        store: app.store.clone(),
        embed: EmbedContext {
            gateway,
            index: app.index.clone(),
            codec: Arc::new(ByteCodec),
            max_tokens: 4000,
            timeout: Duration::from_secs(5),
        },
        initial_trust: InitialTrust::default(),
        checkpoints: Some(Checkpoints::new(app.pool.clone(), FEED_SOURCE)),
        options,
    }
}

fn static_gateway() -> Arc<dyn EmbeddingGateway> {
    Arc::new(StaticGateway::new(DIMS))
}

#[tokio::test]
async fn test_ingest_twice_is_idempotent() {
    let (_tmp, app) = open_app().await;
    let feed: Arc<dyn Feed> = Arc::new(ScriptedFeed::new(two_pages()));

    let first = coordinator(&app, feed.clone(), static_gateway(), options(None, false))
        .run()
        .await
        .unwrap();
    assert_eq!(first.new_documents, 4);
    assert_eq!(first.stop, Some(StopReason::Exhausted));
    assert_eq!(first.embeddings, 4);

    let second = coordinator(&app, feed, static_gateway(), options(None, true))
        .run()
        .await
        .unwrap();
    assert_eq!(second.new_documents, 0);
    assert_eq!(second.skipped_existing, 2);
    assert_eq!(second.stop, Some(StopReason::NoNewRecords));

    assert_eq!(app.store.count().await.unwrap(), 4);
    assert_eq!(app.index.embedding_count().await.unwrap(), 4);
}

#[tokio::test]
async fn test_limit_truncates_page_and_resume_picks_up_remainder() {
    let (_tmp, app) = open_app().await;
    let pages = vec![
        page(vec![rec("a", "a", "alpha"), rec("b", "b", "bravo")]),
        page(vec![rec("c", "c", "charlie"), rec("d", "d", "delta")]),
        page(vec![rec("e", "e", "echo"), rec("f", "f", "foxtrot")]),
    ];
    let feed = Arc::new(ScriptedFeed::new(pages));

    let report = coordinator(&app, feed.clone(), static_gateway(), options(Some(3), false))
        .run()
        .await
        .unwrap();
    assert_eq!(report.new_documents, 3);
    assert_eq!(report.stop, Some(StopReason::LimitReached));
    assert_eq!(app.store.count().await.unwrap(), 3);

    // the truncated page was not checkpointed
    let checkpoints = Checkpoints::new(app.pool.clone(), FEED_SOURCE);
    assert_eq!(checkpoints.load().await.unwrap().as_deref(), Some("1"));

    let report = coordinator(&app, feed.clone(), static_gateway(), options(None, false))
        .run()
        .await
        .unwrap();
    assert_eq!(report.new_documents, 3);
    assert_eq!(report.skipped_existing, 1);
    assert_eq!(report.stop, Some(StopReason::Exhausted));
    assert_eq!(app.store.count().await.unwrap(), 6);
    assert_eq!(
        feed.fetched_cursors(),
        vec![None, Some("1".to_string()), Some("1".to_string()), Some("2".to_string())]
    );
}

#[tokio::test]
async fn test_empty_body_embeds_title() {
    let (_tmp, app) = open_app().await;
    let gateway = Arc::new(StaticGateway::new(DIMS));
    let feed = Arc::new(ScriptedFeed::new(vec![page(vec![rec("t", "Only a title", "")])]));

    coordinator(&app, feed, gateway.clone(), options(None, false))
        .run()
        .await
        .unwrap();

    let doc = app.store.get("t").await.unwrap().unwrap();
    assert_eq!(doc.body, "");
    assert_eq!(doc.trust_factor, 0.5);

    let representative = app.index.representative("t").await.unwrap().unwrap();
    let stored = app.index.get_vector(&representative).await.unwrap().unwrap();
    assert_eq!(stored, gateway.embed_one("Only a title").await.unwrap());
}

#[tokio::test]
async fn test_long_body_yields_one_embedding_per_chunk() {
    let (_tmp, app) = open_app().await;
    let feed = Arc::new(ScriptedFeed::new(vec![page(vec![rec("long", "Long", &"x".repeat(25))])]));
    let mut c = coordinator(&app, feed, static_gateway(), options(None, false));
    c.embed.max_tokens = 10;

    let report = c.run().await.unwrap();
    assert_eq!(report.chunks, 3);
    assert_eq!(app.index.embedding_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_transient_feed_failure_is_retried_from_checkpoint() {
    let (_tmp, app) = open_app().await;
    let feed = Arc::new(
        ScriptedFeed::new(two_pages()).fail_once(1, Error::Transient("503 from feed".into())),
    );

    let report = run_with_retry(options(None, false), 2, Duration::from_millis(1), |opts| {
        coordinator(&app, feed.clone(), static_gateway(), opts)
    })
    .await
    .unwrap();

    assert_eq!(report.new_documents, 4);
    assert_eq!(app.store.count().await.unwrap(), 4);
    assert_eq!(
        feed.fetched_cursors(),
        vec![None, Some("1".to_string()), Some("1".to_string())]
    );
}

#[tokio::test]
async fn test_non_retryable_failure_surfaces_with_progress() {
    let (_tmp, app) = open_app().await;
    let feed = Arc::new(
        ScriptedFeed::new(two_pages()).fail_once(1, Error::Collaborator("401 unauthorized".into())),
    );

    let failure = run_with_retry(options(None, false), 5, Duration::from_millis(1), |opts| {
        coordinator(&app, feed.clone(), static_gateway(), opts)
    })
    .await
    .unwrap_err();

    assert!(matches!(failure.source, Error::Collaborator(_)));
    assert_eq!(failure.partial.new_documents, 2);
    assert_eq!(feed.fetched_cursors().len(), 2);
}

/// Fails the next `failures` batches that contain `poison`.
struct FlakyGateway {
    inner: StaticGateway,
    poison: String,
    failures: AtomicUsize,
}

impl FlakyGateway {
    fn new(inner: StaticGateway, poison: &str, failures: usize) -> Self {
        Self {
            inner,
            poison: poison.to_string(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl EmbeddingGateway for FlakyGateway {
    fn model_name(&self) -> &str {
        "flaky"
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    fn max_batch(&self) -> usize {
        self.inner.max_batch()
    }
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.inner.embed_one(text).await
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains(&self.poison))
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Error::Transient("gateway overloaded".into()));
        }
        self.inner.embed_batch(texts).await
    }
}

#[tokio::test]
async fn test_failed_embedding_is_repaired_on_next_run() {
    let (_tmp, app) = open_app().await;
    let gateway = Arc::new(FlakyGateway::new(StaticGateway::new(DIMS), "bravo", 1));
    let feed = Arc::new(ScriptedFeed::new(vec![page(vec![
        rec("a", "a", "alpha"),
        rec("b", "b", "bravo"),
    ])]));

    let failure = coordinator(&app, feed.clone(), gateway.clone(), options(None, false))
        .run()
        .await
        .unwrap_err();
    assert!(failure.source.is_retryable());
    assert_eq!(app.store.count().await.unwrap(), 2);
    assert_eq!(app.store.count_without_embeddings().await.unwrap(), 1);

    let report = coordinator(&app, feed, gateway, options(None, false))
        .run()
        .await
        .unwrap();
    assert_eq!(report.new_documents, 0);
    assert_eq!(report.repaired, 1);
    assert_eq!(app.store.count_without_embeddings().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failure_mid_document_writes_no_partial_set() {
    let (_tmp, app) = open_app().await;
    // three 10-byte chunks, one per gateway call; the third call fails once
    let gateway = Arc::new(FlakyGateway::new(
        StaticGateway::new(DIMS).with_max_batch(1),
        "cccc",
        1,
    ));
    let body = format!("{}{}{}", "a".repeat(10), "b".repeat(10), "c".repeat(10));
    let feed = Arc::new(ScriptedFeed::new(vec![page(vec![rec("long", "Long", &body)])]));
    let build = |opts| {
        let mut c = coordinator(&app, feed.clone(), gateway.clone(), opts);
        c.embed.max_tokens = 10;
        c
    };

    let failure = build(options(None, false)).run().await.unwrap_err();
    assert!(failure.source.is_retryable());
    assert_eq!(app.index.chunk_count("long").await.unwrap(), 0);

    let report = build(options(None, false)).run().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(app.index.chunk_count("long").await.unwrap(), 3);
    assert_eq!(app.index.embedding_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_retry_after_mid_document_failure_embeds_every_chunk() {
    let (_tmp, app) = open_app().await;
    let gateway = Arc::new(FlakyGateway::new(
        StaticGateway::new(DIMS).with_max_batch(1),
        "cccc",
        1,
    ));
    let body = format!("{}{}{}", "a".repeat(10), "b".repeat(10), "c".repeat(10));
    let feed = Arc::new(ScriptedFeed::new(vec![page(vec![rec("long", "Long", &body)])]));

    let report = run_with_retry(options(None, false), 3, Duration::from_millis(1), |opts| {
        let mut c = coordinator(&app, feed.clone(), gateway.clone(), opts);
        c.embed.max_tokens = 10;
        c
    })
    .await
    .unwrap();

    assert_eq!(report.repaired, 1);
    assert_eq!(app.index.chunk_count("long").await.unwrap(), 3);
}

#[tokio::test]
async fn test_partial_set_from_earlier_run_is_completed() {
    let (_tmp, app) = open_app().await;
    let body = "x".repeat(25);
    let record = rec("long", "Long", &body);
    app.store
        .insert_if_absent(&[Document::from_record(record.clone(), 0.5)])
        .await
        .unwrap();
    let chunks = chunk_text("long", "Long", &body, 10, &ByteCodec).unwrap();
    app.index
        .upsert(&Embedding::for_chunk(&chunks[0], vec![0.1; DIMS]))
        .await
        .unwrap();

    let feed = Arc::new(ScriptedFeed::new(vec![page(vec![record])]));
    let mut c = coordinator(&app, feed, static_gateway(), options(None, false));
    c.embed.max_tokens = 10;
    let report = c.run().await.unwrap();

    assert_eq!(report.new_documents, 0);
    assert_eq!(report.repaired, 1);
    assert_eq!(app.index.chunk_count("long").await.unwrap(), 3);
    assert_eq!(app.index.embedding_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_retry_after_embedding_failure_continues_past_repaired_page() {
    let (_tmp, app) = open_app().await;
    let gateway = Arc::new(FlakyGateway::new(StaticGateway::new(DIMS), "second", 1));
    let feed = Arc::new(ScriptedFeed::new(two_pages()));

    let report = run_with_retry(options(None, false), 3, Duration::from_millis(1), |opts| {
        coordinator(&app, feed.clone(), gateway.clone(), opts)
    })
    .await
    .unwrap();

    assert_eq!(report.stop, Some(StopReason::Exhausted));
    assert_eq!(report.new_documents, 4);
    assert_eq!(report.repaired, 1);
    assert_eq!(app.store.count().await.unwrap(), 4);
    assert_eq!(app.index.embedding_count().await.unwrap(), 4);
    assert_eq!(
        feed.fetched_cursors(),
        vec![None, None, Some("1".to_string())]
    );
}

#[tokio::test]
async fn test_concurrent_runs_do_not_duplicate() {
    let store = Arc::new(InMemoryStore::new());
    let index = Arc::new(InMemoryIndex::new(DIMS));
    let feed: Arc<dyn Feed> = Arc::new(ScriptedFeed::new(two_pages()));

    let make = || Coordinator {
        feed: feed.clone(),
        store: store.clone(),
        embed: EmbedContext {
            gateway: static_gateway(),
            index: index.clone(),
            codec: Arc::new(ByteCodec),
            max_tokens: 4000,
            timeout: Duration::from_secs(5),
        },
        initial_trust: InitialTrust::Hashed,
        checkpoints: None,
        options: options(None, true),
    };
    let (a, b) = (make(), make());
    let (ra, rb) = tokio::join!(a.run(), b.run());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(store.count().await.unwrap(), 4);
    assert_eq!(ra.new_documents + rb.new_documents, 4);
    // a document repaired by one run while the other embeds it still
    // ends up with exactly one set
    assert_eq!(index.embedding_count().await.unwrap(), 4);
    for id in ["1", "2", "3", "4"] {
        assert_eq!(index.chunk_count(id).await.unwrap(), 1);
    }
}

#[tokio::test]
async fn test_trust_scenario_over_sqlite() {
    let (_tmp, app) = open_app().await;
    let mut a = vec![0.0f32; DIMS];
    a[0] = 1.0;
    let mut b = vec![0.0f32; DIMS];
    b[0] = 0.95;
    b[1] = (1.0f32 - 0.95 * 0.95).sqrt();
    let mut far = vec![0.0f32; DIMS];
    far[2] = 1.0;
    let gateway = Arc::new(
        StaticGateway::new(DIMS)
            .with_vector("alpha body", a)
            .with_vector("beta body", b)
            .with_vector("unrelated body", far),
    );
    let feed = Arc::new(ScriptedFeed::new(vec![page(vec![
        rec("A", "A", "alpha body"),
        rec("B", "B", "beta body"),
        rec("C", "C", "unrelated body"),
    ])]));
    coordinator(&app, feed, gateway.clone(), options(None, false))
        .run()
        .await
        .unwrap();

    let params = TrustParams::default();
    let report = adjust_trust(app.store.as_ref(), app.index.as_ref(), "A", TrustDirection::Decrease, &params)
        .await
        .unwrap();
    assert_eq!(report.neighbors.len(), 1);

    let trust = |doc: Option<credence_core::models::Document>| doc.unwrap().trust_factor;
    assert!((trust(app.store.get("A").await.unwrap()) - 0.475).abs() < 1e-9);
    assert!((trust(app.store.get("B").await.unwrap()) - 0.49).abs() < 1e-6);
    assert_eq!(trust(app.store.get("C").await.unwrap()), 0.5);

    let hits = search(
        gateway.as_ref(),
        app.index.as_ref(),
        app.store.as_ref(),
        &SearchRequest {
            query: "alpha body",
            limit: 10,
            threshold: 0.68,
            filter: SearchFilter::default(),
        },
    )
    .await
    .unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.document.id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B"]);
    assert!((hits[0].document.trust_factor - 0.475).abs() < 1e-9);

    let err = adjust_trust(app.store.as_ref(), app.index.as_ref(), "nope", TrustDirection::Increase, &params)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
