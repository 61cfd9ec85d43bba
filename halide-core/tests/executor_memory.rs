//! End-to-end job framework tests over the in-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use halide_core::database::{BatchStore, CatalogGateway, JobStore, MemoryStore};
use halide_core::jobs::{
    ItemOutcome, JobContext, JobController, JobExecutor, JobHandler, JobRegistry, JobSpec,
};
use halide_core::RuntimeConfig;
use halide_model::{
    BatchStatus, CatalogEvent, CatalogId, DuplicateGroupRecord, DuplicateMemberRecord, ImageId,
    JobId, JobRecord, JobStatus, SimilarityType,
};

#[derive(Clone, Copy)]
enum Mode {
    Succeed,
    AlwaysFail,
    FailFirstAttempt,
    SleepPerItem(Duration),
}

struct TestJob {
    spec: JobSpec,
    item_count: usize,
    mode: Mode,
    discover_calls: Arc<AtomicUsize>,
    finalize_results: Arc<Mutex<Vec<usize>>>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    with_finalizer: bool,
    /// When set, the finalizer writes this group set through the gateway.
    finalizer_groups: Option<Vec<DuplicateGroupRecord>>,
}

impl TestJob {
    fn new(name: &'static str, item_count: usize, mode: Mode) -> Self {
        Self {
            spec: JobSpec::new(name).batch_size(2).max_workers(3),
            item_count,
            mode,
            discover_calls: Arc::new(AtomicUsize::new(0)),
            finalize_results: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(Mutex::new(HashMap::new())),
            with_finalizer: true,
            finalizer_groups: None,
        }
    }
}

#[async_trait]
impl JobHandler for TestJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn discover(&self, _ctx: &JobContext) -> halide_core::Result<Vec<Value>> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..self.item_count)
            .map(|i| Value::String(format!("item-{i}")))
            .collect())
    }

    async fn process(&self, item: &Value, _ctx: &JobContext) -> ItemOutcome {
        let key = item.as_str().unwrap_or_default().to_string();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        match self.mode {
            Mode::Succeed => ItemOutcome::success(json!({"item": key})),
            Mode::AlwaysFail => ItemOutcome::failure(format!("{key} is cursed")),
            Mode::FailFirstAttempt => {
                if attempt == 1 {
                    ItemOutcome::failure(format!("{key} transient failure"))
                } else {
                    ItemOutcome::success(json!({"item": key, "attempt": attempt}))
                }
            }
            Mode::SleepPerItem(delay) => {
                tokio::time::sleep(delay).await;
                ItemOutcome::success(json!({"item": key}))
            }
        }
    }

    async fn finalize(&self, results: &[Value], ctx: &JobContext) -> halide_core::Result<Value> {
        self.finalize_results.lock().unwrap().push(results.len());
        if let Some(ref groups) = self.finalizer_groups {
            ctx.gateway
                .replace_duplicate_groups(ctx.catalog_id, groups)
                .await?;
        }
        Ok(json!({"finalized": results.len()}))
    }

    fn has_finalizer(&self) -> bool {
        self.with_finalizer
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    executor: JobExecutor,
    catalog_id: CatalogId,
}

fn harness(handler: Arc<dyn JobHandler>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let mut registry = JobRegistry::new();
    registry.register(handler).unwrap();
    let registry = Arc::new(registry);

    let gateway: Arc<dyn CatalogGateway> = store.clone();
    let batches: Arc<dyn BatchStore> = store.clone();
    let jobs: Arc<dyn JobStore> = store.clone();
    let executor = JobExecutor::new(
        gateway,
        batches,
        jobs,
        registry,
        RuntimeConfig::default(),
    );
    Harness {
        store,
        executor,
        catalog_id: CatalogId::new(),
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

async fn run_to_completion(h: &Harness, job: JobRecord) -> JobRecord {
    h.store.create_job(&job).await.unwrap();
    let _ = h.executor.run(job.clone(), CancellationToken::new()).await;
    h.store.get_job(&job.id).await.unwrap().expect("job exists")
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_completes_all_batches_and_finalizes() {
    let job_impl = Arc::new(TestJob::new("test_job", 7, Mode::Succeed));
    let h = harness(job_impl.clone());
    let job = run_to_completion(&h, job_record("j-happy", "test_job", h.catalog_id)).await;

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.result["total_items"], 7);
    assert_eq!(job.result["success_count"], 7);
    assert_eq!(job.result["error_count"], 0);
    assert_eq!(job.result["finalized"], 7);
    assert_eq!(job.result["errors"].as_array().unwrap().len(), 0);

    // 7 items at batch_size 2 -> 4 batches, all completed, counters exact.
    let batches = h.store.batches_for(&job.id);
    assert_eq!(batches.len(), 4);
    for batch in &batches {
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(
            batch.processed_count,
            batch.success_count + batch.error_count
        );
    }
    let processed: i32 = batches.iter().map(|b| b.processed_count).sum();
    assert_eq!(processed, 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_discovery_succeeds_without_batches_or_finalizer() {
    let job_impl = Arc::new(TestJob::new("test_job", 0, Mode::Succeed));
    let h = harness(job_impl.clone());
    let job = run_to_completion(&h, job_record("j-empty", "test_job", h.catalog_id)).await;

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.result["total_items"], 0);
    assert!(h.store.batches_for(&job.id).is_empty());
    assert!(job_impl.finalize_results.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn all_items_failing_still_ends_in_success_with_empty_finalize() {
    let job_impl = Arc::new(TestJob::new("test_job", 5, Mode::AlwaysFail));
    let h = harness(job_impl.clone());
    let job = run_to_completion(&h, job_record("j-fail", "test_job", h.catalog_id)).await;

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.result["success_count"], 0);
    assert_eq!(job.result["error_count"], 5);
    let errors = job.result["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 5);
    assert!(errors[0].as_str().unwrap().contains("cursed"));

    // Finalizer ran, with zero successful results.
    assert_eq!(*job_impl.finalize_results.lock().unwrap(), vec![0]);

    // Per-item failures never fail a batch.
    for batch in h.store.batches_for(&job.id) {
        assert_eq!(batch.status, BatchStatus::Completed);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_items_are_retried_with_backoff() {
    let job_impl = Arc::new(TestJob::new("test_job", 3, Mode::FailFirstAttempt));
    let h = harness(job_impl.clone());
    let job = run_to_completion(&h, job_record("j-retry", "test_job", h.catalog_id)).await;

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.result["success_count"], 3);
    assert_eq!(job.result["error_count"], 0);
    for (_, attempts) in job_impl.attempts.lock().unwrap().iter() {
        assert_eq!(*attempts, 2);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_disabled_surface_first_attempt_failures() {
    let mut inner = TestJob::new("test_job", 3, Mode::FailFirstAttempt);
    inner.spec = JobSpec::new("test_job").batch_size(2).retry_on_failure(false);
    let job_impl = Arc::new(inner);
    let h = harness(job_impl.clone());
    let job = run_to_completion(&h, job_record("j-noretry", "test_job", h.catalog_id)).await;

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.result["error_count"], 3);
    for (_, attempts) in job_impl.attempts.lock().unwrap().iter() {
        assert_eq!(*attempts, 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn per_item_timeout_marks_the_item_as_error() {
    let mut inner = TestJob::new(
        "test_job",
        2,
        Mode::SleepPerItem(Duration::from_millis(200)),
    );
    inner.spec = JobSpec::new("test_job")
        .batch_size(10)
        .timeout_per_item(Duration::from_millis(20));
    let job_impl = Arc::new(inner);
    let h = harness(job_impl);
    let job = run_to_completion(&h, job_record("j-timeout", "test_job", h.catalog_id)).await;

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.result["error_count"], 2);
    let errors = job.result["errors"].as_array().unwrap();
    assert!(errors[0].as_str().unwrap().contains("timed out"));
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_skips_discovery_when_batches_exist() {
    let job_impl = Arc::new(TestJob::new("test_job", 4, Mode::Succeed));
    let h = harness(job_impl.clone());
    let catalog_id = h.catalog_id;
    let job = job_record("j-resume", "test_job", catalog_id);
    h.store.create_job(&job).await.unwrap();

    // Simulate a prior run that persisted batches and completed the first.
    let items: Vec<Value> = (0..4).map(|i| Value::String(format!("item-{i}"))).collect();
    h.store
        .create_batches(&job, catalog_id, &items, 2)
        .await
        .unwrap();
    let first = h.store.claim_next(&job.id, "old-run").await.unwrap().unwrap();
    h.store.report_progress(first.id, 2, 2, 0).await.unwrap();
    h.store
        .complete(
            first.id,
            &[
                json!({"ok": true, "result": {"item": "item-0"}}),
                json!({"ok": true, "result": {"item": "item-1"}}),
            ],
        )
        .await
        .unwrap();

    let _ = h
        .executor
        .run(job.clone(), CancellationToken::new())
        .await;

    let stored = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Success);
    // Discovery must not run again on resume.
    assert_eq!(job_impl.discover_calls.load(Ordering::SeqCst), 0);
    // The finalizer sees results from the prior run's batch too.
    assert_eq!(stored.result["success_count"], 4);
    assert_eq!(*job_impl.finalize_results.lock().unwrap(), vec![4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_events_are_monotonic_and_batch_transitions_emitted() {
    let job_impl = Arc::new(TestJob::new("test_job", 6, Mode::Succeed));
    let h = harness(job_impl);
    let job = run_to_completion(&h, job_record("j-events", "test_job", h.catalog_id)).await;
    assert_eq!(job.status, JobStatus::Success);

    let events = h.store.published_events();
    assert!(!events.is_empty());

    let mut last = (0u64, 0u64, 0u64);
    let mut batch_events = 0;
    for (_, event) in &events {
        match event {
            CatalogEvent::Progress(p) => {
                let tuple = (p.processed, p.success, p.error);
                assert!(tuple > last, "progress regressed: {tuple:?} after {last:?}");
                last = tuple;
            }
            CatalogEvent::Batch(b) => {
                assert!(b.status.is_terminal());
                batch_events += 1;
            }
            CatalogEvent::Job(_) => {}
        }
    }
    // One terminal transition per batch (6 items, batch_size 2).
    assert_eq!(batch_events, 3);

    // Lifecycle events bracket the run.
    let job_statuses: Vec<JobStatus> = events
        .iter()
        .filter_map(|(_, e)| match e {
            CatalogEvent::Job(j) => Some(j.status),
            _ => None,
        })
        .collect();
    assert_eq!(job_statuses.first(), Some(&JobStatus::Running));
    assert_eq!(job_statuses.last(), Some(&JobStatus::Success));
}

fn controller(h: &Harness, handler: Arc<dyn JobHandler>) -> JobController {
    let mut registry = JobRegistry::new();
    registry.register(handler).unwrap();
    JobController::new(
        h.store.clone(),
        h.store.clone(),
        h.store.clone(),
        Arc::new(registry),
        RuntimeConfig::default(),
    )
}

async fn wait_terminal(store: &MemoryStore, job_id: &JobId) -> JobRecord {
    for _ in 0..200 {
        if let Some(job) = store.get_job(job_id).await.unwrap() {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_skips_finalizer_and_preserves_prior_groups() {
    let prior_groups = vec![DuplicateGroupRecord {
        primary_image_id: ImageId::from("keep-a"),
        similarity_type: SimilarityType::Exact,
        confidence: 100,
        reviewed: true,
        members: vec![
            DuplicateMemberRecord {
                image_id: ImageId::from("keep-a"),
                similarity_score: 100,
            },
            DuplicateMemberRecord {
                image_id: ImageId::from("keep-b"),
                similarity_score: 100,
            },
        ],
    }];

    let mut inner = TestJob::new(
        "slow_job",
        40,
        Mode::SleepPerItem(Duration::from_millis(25)),
    );
    inner.spec = JobSpec::new("slow_job").batch_size(2).max_workers(2);
    inner.finalizer_groups = Some(vec![]); // would wipe the groups if run
    let job_impl = Arc::new(inner);

    let h = harness(job_impl.clone());
    h.store
        .replace_duplicate_groups(h.catalog_id, &prior_groups)
        .await
        .unwrap();

    let ctl = controller(&h, job_impl.clone());
    let job_id = ctl.submit("slow_job", h.catalog_id, json!({})).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    ctl.cancel(&job_id).await.unwrap();

    let job = wait_terminal(&h.store, &job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);

    // The finalizer never ran, so the pre-run groups are intact.
    assert!(job_impl.finalize_results.lock().unwrap().is_empty());
    assert_eq!(h.store.duplicate_groups(h.catalog_id), prior_groups);

    // Every batch is terminal and none is left pending or running.
    for batch in h.store.batches_for(&job_id) {
        assert!(batch.status.is_terminal());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn controller_submit_rejects_unknown_job_types() {
    let job_impl = Arc::new(TestJob::new("real_job", 1, Mode::Succeed));
    let h = harness(job_impl.clone());
    let ctl = controller(&h, job_impl);

    let err = ctl
        .submit("no_such_job", h.catalog_id, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, halide_core::HalideError::UnknownJobType(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn recover_reclaims_stale_batches_and_finishes_the_job() {
    let job_impl = Arc::new(TestJob::new("test_job", 6, Mode::Succeed));
    let h = harness(job_impl.clone());
    let catalog_id = h.catalog_id;

    // A prior process died mid-job: batches exist, job is `running`, one
    // batch completed, one is `running` with a stale heartbeat.
    let job = job_record("j-recover", "test_job", catalog_id);
    h.store.create_job(&job).await.unwrap();
    h.store.mark_running(&job.id).await.unwrap();
    let items: Vec<Value> = (0..6).map(|i| Value::String(format!("item-{i}"))).collect();
    h.store
        .create_batches(&job, catalog_id, &items, 2)
        .await
        .unwrap();
    let done = h.store.claim_next(&job.id, "dead-0").await.unwrap().unwrap();
    h.store.report_progress(done.id, 2, 2, 0).await.unwrap();
    h.store
        .complete(
            done.id,
            &[
                json!({"ok": true, "result": {"item": "item-0"}}),
                json!({"ok": true, "result": {"item": "item-1"}}),
            ],
        )
        .await
        .unwrap();
    let stuck = h.store.claim_next(&job.id, "dead-1").await.unwrap().unwrap();
    h.store.age_batch_heartbeat(stuck.id, Duration::from_secs(300));

    let ctl = controller(&h, job_impl.clone());
    let resumed = ctl.recover().await.unwrap();
    assert_eq!(resumed, 1);

    let finished = wait_terminal(&h.store, &job.id).await;
    assert_eq!(finished.status, JobStatus::Success);
    // Equal to an uninterrupted run over the same inputs.
    assert_eq!(finished.result["success_count"], 6);
    assert_eq!(finished.result["total_items"], 6);
    for batch in h.store.batches_for(&job.id) {
        assert_eq!(batch.status, BatchStatus::Completed);
    }
    assert_eq!(job_impl.discover_calls.load(Ordering::SeqCst), 0);
}
