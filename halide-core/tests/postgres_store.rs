//! Postgres store behaviour tests. Each test gets its own database via
//! `#[sqlx::test]`, with this crate's migrations applied.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use tokio::task::JoinHandle;

use halide_core::database::{
    BatchStore, CatalogGateway, JobStore, NewImage, PostgresStore, TagPrediction,
};
use halide_model::{
    BatchStatus, BurstRecord, CatalogId, CatalogRecord, DateStamp, DuplicateGroupRecord,
    DuplicateMemberRecord, FileType, ImageId, JobId, JobRecord, JobStatus, SelectionMethod,
    SimilarityType,
};

async fn seed_catalog(store: &PostgresStore) -> CatalogId {
    let id = CatalogId::new();
    store
        .create_catalog(&CatalogRecord {
            id,
            name: format!("Test Catalog {id}"),
            source_directories: vec!["/photos".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .expect("seed catalog");
    id
}

fn new_image(catalog_id: CatalogId, id: &str, path: &str) -> NewImage {
    NewImage {
        id: ImageId::from(id),
        catalog_id,
        source_path: path.to_string(),
        checksum: format!("{:0>64}", id),
        size_bytes: 1000,
        file_type: FileType::Image,
        dates: BTreeMap::new(),
        metadata: Map::new(),
        thumbnail_path: None,
    }
}

fn job_record(id: &str, job_type: &str, catalog_id: CatalogId) -> JobRecord {
    JobRecord {
        id: JobId::from(id),
        catalog_id: Some(catalog_id),
        job_type: job_type.to_string(),
        status: JobStatus::Pending,
        parameters: json!({}),
        progress: json!({}),
        result: json!({}),
        error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        completed_at: None,
    }
}

async fn seed_job(store: &PostgresStore, id: &str, catalog_id: CatalogId) -> JobRecord {
    let job = job_record(id, "test_job", catalog_id);
    store.create_job(&job).await.expect("seed job");
    job
}

#[sqlx::test]
async fn upsert_image_is_idempotent_per_source_path(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;

    let record = new_image(catalog_id, "img-a", "/photos/a.jpg");
    store.upsert_image(&record).await.expect("first upsert");
    store.upsert_image(&record).await.expect("second upsert");

    let ids = store.list_all_image_ids(catalog_id).await.expect("list");
    assert_eq!(ids.len(), 1);

    let stored = store
        .get_image(catalog_id, &record.id)
        .await
        .expect("get image");
    assert_eq!(stored.checksum, record.checksum);
    assert_eq!(stored.source_path, "/photos/a.jpg");
}

#[sqlx::test]
async fn hash_updates_move_images_between_discovery_lists(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;

    for (id, path) in [("img-a", "/photos/a.jpg"), ("img-b", "/photos/b.jpg")] {
        store
            .upsert_image(&new_image(catalog_id, id, path))
            .await
            .expect("upsert");
    }

    let unhashed = store
        .list_images_without_hashes(catalog_id)
        .await
        .expect("unhashed");
    assert_eq!(unhashed.len(), 2);

    store
        .update_image_hashes(
            &ImageId::from("img-a"),
            "00000000000000ff",
            "0000000000000001",
            "0000000000000002",
        )
        .await
        .expect("update hashes");

    let unhashed = store
        .list_images_without_hashes(catalog_id)
        .await
        .expect("unhashed");
    assert_eq!(unhashed, vec![ImageId::from("img-b")]);

    let hashed = store
        .list_images_with_hashes(catalog_id)
        .await
        .expect("hashed");
    assert_eq!(hashed.len(), 1);
    assert_eq!(hashed[0].dhash.as_deref(), Some("00000000000000ff"));
}

#[sqlx::test]
async fn concurrent_claims_hand_each_batch_to_exactly_one_worker(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;
    let job = seed_job(&store, "j-claims", catalog_id).await;

    let items: Vec<Value> = (0..20).map(Value::from).collect();
    let total = store
        .create_batches(&job, catalog_id, &items, 2)
        .await
        .expect("create batches");
    assert_eq!(total, 10);

    // Several workers race the claim loop; every batch must be observed by
    // exactly one of them.
    let mut handles: Vec<JoinHandle<Vec<(uuid::Uuid, String)>>> = Vec::new();
    for w in 0..4 {
        let store = store.clone();
        let job_id = job.id.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("w{w}");
            let mut seen = Vec::new();
            loop {
                match BatchStore::claim_next(&store, &job_id, &worker).await.expect("claim") {
                    Some(batch) => {
                        seen.push((batch.id.to_uuid(), worker.clone()));
                        BatchStore::complete(&store, batch.id, &[]).await.expect("complete");
                    }
                    None => return seen,
                }
            }
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.expect("worker task"));
    }
    assert_eq!(claimed.len(), 10);
    let distinct: HashSet<uuid::Uuid> = claimed.iter().map(|(id, _)| *id).collect();
    assert_eq!(distinct.len(), 10, "a batch was claimed twice");

    let agg = store.aggregate(&job.id).await.expect("aggregate");
    assert_eq!(agg.completed, 10);
    assert!(agg.all_terminal());
}

#[sqlx::test]
async fn terminal_batches_reject_further_transitions(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;
    let job = seed_job(&store, "j-terminal", catalog_id).await;

    store
        .create_batches(&job, catalog_id, &[Value::from(1)], 10)
        .await
        .expect("create");
    let batch = store
        .claim_next(&job.id, "w0")
        .await
        .expect("claim")
        .expect("one batch");

    store
        .complete(batch.id, &[json!({"ok": true, "result": {}})])
        .await
        .expect("complete");
    store.fail(batch.id, "late failure").await.expect("fail is a no-op");
    store.cancel_job_batches(&job.id).await.expect("cancel is a no-op");

    let stored = store
        .get_batch(batch.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(stored.status, BatchStatus::Completed);
    assert!(stored.error_message.is_none());
    assert!(stored.completed_at.is_some());
}

#[sqlx::test]
async fn progress_reports_are_monotonic_and_feed_the_aggregate(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;
    let job = seed_job(&store, "j-progress", catalog_id).await;

    let items: Vec<Value> = (0..4).map(Value::from).collect();
    store
        .create_batches(&job, catalog_id, &items, 2)
        .await
        .expect("create");

    let batch = store
        .claim_next(&job.id, "w0")
        .await
        .expect("claim")
        .expect("batch");
    store.report_progress(batch.id, 2, 1, 1).await.expect("report");
    // A lagging report must not wind the counters back.
    store.report_progress(batch.id, 1, 1, 0).await.expect("report");

    let agg = store.aggregate(&job.id).await.expect("aggregate");
    assert_eq!((agg.processed, agg.success, agg.error), (2, 1, 1));
    assert_eq!(agg.items, 4);
    assert_eq!(agg.pending, 1);
    assert_eq!(agg.running, 1);
}

#[sqlx::test]
async fn stale_running_batches_are_reclaimed_for_redispatch(pool: PgPool) {
    let store = PostgresStore::new(pool.clone()).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;
    let job = seed_job(&store, "j-stale", catalog_id).await;

    let items: Vec<Value> = (0..2).map(Value::from).collect();
    store
        .create_batches(&job, catalog_id, &items, 1)
        .await
        .expect("create");
    let dead = store
        .claim_next(&job.id, "dead-worker")
        .await
        .expect("claim")
        .expect("batch");
    let alive = store
        .claim_next(&job.id, "live-worker")
        .await
        .expect("claim")
        .expect("batch");

    // Age the dead worker's heartbeat behind the reclaim window.
    sqlx::query("UPDATE job_batches SET updated_at = NOW() - INTERVAL '5 minutes' WHERE id = $1")
        .bind(dead.id.to_uuid())
        .execute(&pool)
        .await
        .expect("age heartbeat");

    let reclaimed = store
        .reclaim_stale(&job.id, Duration::from_secs(60))
        .await
        .expect("reclaim");
    assert_eq!(reclaimed, 1);

    let requeued = store
        .get_batch(dead.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(requeued.status, BatchStatus::Pending);
    assert!(requeued.worker_id.is_none());

    let untouched = store
        .get_batch(alive.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(untouched.status, BatchStatus::Running);
    assert_eq!(untouched.worker_id.as_deref(), Some("live-worker"));

    // The reclaimed batch is claimable again.
    let reclaimed_batch = store
        .claim_next(&job.id, "recovery-worker")
        .await
        .expect("claim")
        .expect("batch");
    assert_eq!(reclaimed_batch.id, dead.id);
}

#[sqlx::test]
async fn replace_duplicate_groups_is_atomic_per_catalog(pool: PgPool) {
    let store = PostgresStore::new(pool.clone()).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;
    for (id, path) in [
        ("img-a", "/photos/a.jpg"),
        ("img-b", "/photos/b.jpg"),
        ("img-c", "/photos/c.jpg"),
    ] {
        store
            .upsert_image(&new_image(catalog_id, id, path))
            .await
            .expect("upsert");
    }

    let group = |primary: &str, members: Vec<&str>| DuplicateGroupRecord {
        primary_image_id: ImageId::from(primary),
        similarity_type: SimilarityType::Exact,
        confidence: 100,
        reviewed: false,
        members: members
            .into_iter()
            .map(|id| DuplicateMemberRecord {
                image_id: ImageId::from(id),
                similarity_score: 100,
            })
            .collect(),
    };

    store
        .replace_duplicate_groups(catalog_id, &[group("img-a", vec!["img-a", "img-b"])])
        .await
        .expect("first replace");
    store
        .replace_duplicate_groups(catalog_id, &[group("img-b", vec!["img-b", "img-c"])])
        .await
        .expect("second replace");

    let group_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*)::bigint FROM duplicate_groups WHERE catalog_id = $1")
            .bind(catalog_id.to_uuid())
            .fetch_one(&pool)
            .await
            .expect("count groups");
    assert_eq!(group_count, 1);

    let member_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*)::bigint FROM duplicate_members dm JOIN duplicate_groups dg ON dm.group_id = dg.id WHERE dg.catalog_id = $1",
    )
    .bind(catalog_id.to_uuid())
    .fetch_one(&pool)
    .await
    .expect("count members");
    assert_eq!(member_count, 2);
}

#[sqlx::test]
async fn replace_burst_groups_rewrites_image_linkage(pool: PgPool) {
    let store = PostgresStore::new(pool.clone()).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;
    for (id, path) in [("img-a", "/p/a.jpg"), ("img-b", "/p/b.jpg"), ("img-c", "/p/c.jpg")] {
        store
            .upsert_image(&new_image(catalog_id, id, path))
            .await
            .expect("upsert");
    }

    let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    let burst = BurstRecord {
        image_ids: vec![ImageId::from("img-a"), ImageId::from("img-b")],
        start_time: start,
        end_time: start + chrono::Duration::milliseconds(1400),
        duration_seconds: 1.4,
        camera_make: Some("Canon".to_string()),
        camera_model: Some("EOS R5".to_string()),
        best_image_id: Some(ImageId::from("img-b")),
        selection_method: SelectionMethod::Quality,
    };

    store
        .replace_burst_groups(catalog_id, &[burst])
        .await
        .expect("replace bursts");

    let linked = store
        .get_image(catalog_id, &ImageId::from("img-a"))
        .await
        .expect("get");
    assert!(linked.burst_id.is_some());
    assert_eq!(linked.burst_sequence, Some(0));
    let second = store
        .get_image(catalog_id, &ImageId::from("img-b"))
        .await
        .expect("get");
    assert_eq!(second.burst_sequence, Some(1));

    // A new run clears prior linkage.
    store
        .replace_burst_groups(catalog_id, &[])
        .await
        .expect("clear bursts");
    let cleared = store
        .get_image(catalog_id, &ImageId::from("img-a"))
        .await
        .expect("get");
    assert!(cleared.burst_id.is_none());
    let burst_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*)::bigint FROM bursts WHERE catalog_id = $1")
            .bind(catalog_id.to_uuid())
            .fetch_one(&pool)
            .await
            .expect("count bursts");
    assert_eq!(burst_count, 0);
}

#[sqlx::test]
async fn burst_discovery_orders_by_selected_timestamp(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;

    let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    for (id, path, offset_ms) in [
        ("img-late", "/p/late.jpg", 900),
        ("img-early", "/p/early.jpg", 0),
        ("img-mid", "/p/mid.jpg", 400),
    ] {
        let mut record = new_image(catalog_id, id, path);
        record.dates.insert(
            "selected".to_string(),
            DateStamp {
                timestamp: base + chrono::Duration::milliseconds(offset_ms),
                confidence: 90,
            },
        );
        record
            .metadata
            .insert("camera_make".to_string(), Value::from("Canon"));
        store.upsert_image(&record).await.expect("upsert");
    }
    // No selected date: invisible to burst discovery.
    store
        .upsert_image(&new_image(catalog_id, "img-undated", "/p/undated.jpg"))
        .await
        .expect("upsert");

    let images = store
        .list_images_with_timestamps(catalog_id)
        .await
        .expect("list");
    let ids: Vec<&str> = images.iter().map(|img| img.id.as_str()).collect();
    assert_eq!(ids, vec!["img-early", "img-mid", "img-late"]);
    assert!(images.iter().all(|img| img.timestamp.is_some()));
    assert_eq!(images[0].camera_make.as_deref(), Some("Canon"));
}

#[sqlx::test]
async fn job_lifecycle_is_monotonic(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;
    let job = seed_job(&store, "j-lifecycle", catalog_id).await;

    store.mark_running(&job.id).await.expect("mark running");
    store
        .complete_job(&job.id, JobStatus::Cancelled, None, None)
        .await
        .expect("cancel");
    // A late success report must not resurrect the job.
    store
        .complete_job(&job.id, JobStatus::Success, Some(&json!({"late": true})), None)
        .await
        .expect("late complete is a no-op");

    let stored = store.get_job(&job.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert!(stored.result.get("late").is_none());
    assert!(stored.completed_at.is_some());

    let running = store
        .list_jobs(Some(catalog_id), Some(JobStatus::Running))
        .await
        .expect("list");
    assert!(running.is_empty());
    let cancelled = store
        .list_jobs(Some(catalog_id), Some(JobStatus::Cancelled))
        .await
        .expect("list");
    assert_eq!(cancelled.len(), 1);
}

#[sqlx::test]
async fn tags_are_upserted_and_linked(pool: PgPool) {
    let store = PostgresStore::new(pool.clone()).await.expect("store init");
    let catalog_id = seed_catalog(&store).await;
    store
        .upsert_image(&new_image(catalog_id, "img-a", "/p/a.jpg"))
        .await
        .expect("upsert");

    let tags = vec![
        TagPrediction {
            label: "canon".to_string(),
            confidence: 0.9,
        },
        TagPrediction {
            label: "image".to_string(),
            confidence: 1.0,
        },
    ];
    store
        .add_image_tags(catalog_id, &ImageId::from("img-a"), &tags)
        .await
        .expect("tag once");
    // Re-tagging only updates confidences.
    store
        .add_image_tags(catalog_id, &ImageId::from("img-a"), &tags)
        .await
        .expect("tag twice");

    let tag_count: i64 = sqlx::query_scalar("SELECT COUNT(*)::bigint FROM tags")
        .fetch_one(&pool)
        .await
        .expect("count tags");
    assert_eq!(tag_count, 2);
    let link_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*)::bigint FROM image_tags WHERE image_id = 'img-a'")
            .fetch_one(&pool)
            .await
            .expect("count links");
    assert_eq!(link_count, 2);
}
