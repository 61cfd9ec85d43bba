//! End-to-end execution of one job instance.
//!
//! Discover -> partition into durable batches -> parallel claim-next worker
//! loop -> aggregate -> finalize. Batch state transitions are owned by the
//! batch store; this module only requests them. Per-item failures never
//! fail a batch; batch failures never stop the other batches; the job fails
//! only when the executor or the finalizer fails, or when no batch
//! completed at all.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use halide_model::{BatchRecord, JobId, JobRecord, JobStatus};

use crate::config::RuntimeConfig;
use crate::database::{BatchStore, CatalogGateway, JobStore};
use crate::error::{HalideError, Result};
use crate::jobs::definition::{ItemOutcome, JobContext, JobHandler, JobParams, JobSpec};
use crate::jobs::progress::ProgressPublisher;
use crate::jobs::registry::JobRegistry;

/// Base delay of the per-item retry backoff (doubles per attempt).
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
/// Backoff ceiling.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
/// Per-item errors carried on the job result are truncated to this many.
const MAX_CARRIED_ERRORS: usize = 100;

/// Retry a store call once when the failure looks transient; anything past
/// that is batch-fatal and propagates.
macro_rules! retry_transient {
    ($call:expr) => {
        match $call {
            Err(e) if e.is_transient() => {
                warn!("transient store failure, retrying once: {e}");
                $call
            }
            other => other,
        }
    };
}

pub struct JobExecutor {
    gateway: Arc<dyn CatalogGateway>,
    batches: Arc<dyn BatchStore>,
    jobs: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    config: RuntimeConfig,
}

impl JobExecutor {
    pub fn new(
        gateway: Arc<dyn CatalogGateway>,
        batches: Arc<dyn BatchStore>,
        jobs: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            gateway,
            batches,
            jobs,
            registry,
            config,
        }
    }

    /// Run one job to a terminal state. The terminal status and result are
    /// persisted here; the returned error exists for the caller's logs.
    pub async fn run(&self, job: JobRecord, cancel: CancellationToken) -> Result<()> {
        let job_id = job.id.clone();
        let job_type = job.job_type.clone();

        let Some(catalog_id) = job.catalog_id else {
            let err = HalideError::Internal(format!("job {job_id} has no catalog"));
            self.jobs
                .complete_job(&job_id, JobStatus::Failed, None, Some(&err.to_string()))
                .await?;
            return Err(err);
        };
        let publisher = Arc::new(ProgressPublisher::new(
            self.gateway.clone(),
            catalog_id,
            job_id.clone(),
            self.config.progress_debounce,
        ));

        match self.execute(job, catalog_id, cancel, publisher.clone()).await {
            Ok(status) => {
                publisher.publish_job(&job_type, status, None).await;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                error!("job {job_id} failed: {message}");
                self.jobs
                    .complete_job(&job_id, JobStatus::Failed, None, Some(&message))
                    .await
                    .ok();
                publisher
                    .publish_job(&job_type, JobStatus::Failed, Some(message))
                    .await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        job: JobRecord,
        catalog_id: halide_model::CatalogId,
        cancel: CancellationToken,
        publisher: Arc<ProgressPublisher>,
    ) -> Result<JobStatus> {
        let handler = self
            .registry
            .get(&job.job_type)
            .ok_or_else(|| HalideError::UnknownJobType(job.job_type.clone()))?;
        let spec = handler.spec();

        let ctx = Arc::new(JobContext {
            job_id: job.id.clone(),
            catalog_id,
            params: JobParams::new(job.parameters.clone()),
            gateway: self.gateway.clone(),
            cancel: cancel.clone(),
            config: self.config.clone(),
        });

        self.jobs.mark_running(&job.id).await?;
        publisher
            .publish_job(&job.job_type, JobStatus::Running, None)
            .await;

        // Resume dispatch when batches already exist (process restart);
        // otherwise discover and partition.
        let existing = self.batches.count_for_job(&job.id).await?;
        let total_batches = if existing > 0 {
            info!("job {} resuming with {existing} existing batches", job.id);
            existing
        } else {
            let items = handler.discover(ctx.as_ref()).await?;
            info!("job {} discovered {} items", job.id, items.len());
            if items.is_empty() {
                let result = json!({
                    "success_count": 0,
                    "error_count": 0,
                    "total_items": 0,
                    "errors": [],
                });
                self.jobs
                    .complete_job(&job.id, JobStatus::Success, Some(&result), None)
                    .await?;
                return Ok(JobStatus::Success);
            }
            i64::from(
                self.batches
                    .create_batches(&job, catalog_id, &items, spec.batch_size)
                    .await?,
            )
        };

        let worker_count = spec.max_workers.clamp(1, total_batches.max(1) as usize);
        let mut workers = JoinSet::new();
        for index in 0..worker_count {
            workers.spawn(worker_loop(
                index,
                job.id.clone(),
                handler.clone(),
                ctx.clone(),
                self.batches.clone(),
                publisher.clone(),
            ));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                // The worker loop itself panicked; its running batch (if
                // any) was failed inside the loop or will be reclaimed.
                error!("worker task for job {} aborted: {e}", job.id);
            }
        }

        if cancel.is_cancelled() {
            let swept = self.batches.cancel_job_batches(&job.id).await?;
            info!("job {} cancelled; {swept} batches swept", job.id);
            self.jobs
                .complete_job(&job.id, JobStatus::Cancelled, None, None)
                .await?;
            return Ok(JobStatus::Cancelled);
        }

        let agg = self.batches.aggregate(&job.id).await?;
        if !agg.all_terminal() {
            return Err(HalideError::Internal(format!(
                "job {} finished dispatch with non-terminal batches: {agg:?}",
                job.id
            )));
        }

        publisher
            .publish_progress(
                "aggregating",
                agg.processed as u64,
                agg.items as u64,
                agg.success as u64,
                agg.error as u64,
                true,
            )
            .await;

        let errors = self.batches.collect_errors(&job.id, MAX_CARRIED_ERRORS).await?;
        let mut result = json!({
            "success_count": agg.success,
            "error_count": agg.error,
            "total_items": agg.items,
            "errors": errors,
        });

        // A job fails outright only when nothing completed; isolated batch
        // failures leave a degraded but successful job.
        let job_failed = agg.completed == 0 && agg.failed > 0;
        if job_failed {
            self.jobs
                .complete_job(
                    &job.id,
                    JobStatus::Failed,
                    Some(&result),
                    Some("all batches failed"),
                )
                .await?;
            return Ok(JobStatus::Failed);
        }

        if handler.has_finalizer() {
            let successes = self.batches.collect_results(&job.id).await?;
            // Finalizer failures are job-fatal; the `?` routes them through
            // run()'s failure path.
            let summary = handler.finalize(&successes, ctx.as_ref()).await?;
            merge_result(&mut result, summary);
        }

        self.jobs
            .complete_job(&job.id, JobStatus::Success, Some(&result), None)
            .await?;
        Ok(JobStatus::Success)
    }
}

/// Claim-next loop for one worker. Exits when no pending batch remains, on
/// cancellation, or after a batch-fatal store failure.
async fn worker_loop(
    index: usize,
    job_id: JobId,
    handler: Arc<dyn JobHandler>,
    ctx: Arc<JobContext>,
    batches: Arc<dyn BatchStore>,
    publisher: Arc<ProgressPublisher>,
) {
    let worker_id = format!("{}-worker-{index}", job_id);
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        let claimed = retry_transient!(batches.claim_next(&job_id, &worker_id).await);
        let batch = match claimed {
            Ok(Some(batch)) => batch,
            Ok(None) => return,
            Err(e) => {
                error!("[{worker_id}] claim failed, exiting: {e}");
                return;
            }
        };

        info!(
            "[{worker_id}] processing batch {}/{} ({} items)",
            batch.batch_number + 1,
            batch.total_batches,
            batch.items_count
        );

        let task = tokio::spawn(process_batch(
            batch.clone(),
            handler.clone(),
            ctx.clone(),
            batches.clone(),
            publisher.clone(),
        ));

        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(HalideError::Cancelled(_))) => {
                // Swept to cancelled by the executor after workers drain.
                return;
            }
            Ok(Err(e)) => {
                warn!("[{worker_id}] batch {} failed: {e}", batch.id);
                if let Err(store_err) = batches.fail(batch.id, &e.to_string()).await {
                    error!("[{worker_id}] could not record batch failure: {store_err}");
                    return;
                }
                if let Ok(Some(updated)) = batches.get_batch(batch.id).await {
                    publisher.publish_batch(&updated).await;
                }
            }
            Err(join_err) => {
                let message = format!("unhandled panic in processor: {join_err}");
                error!("[{worker_id}] {message}");
                if batches.fail(batch.id, &message).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Process every item of one claimed batch. Returns `Err` only for
/// batch-fatal conditions (cancellation, store failures); per-item errors
/// are tallied and carried in the stored outcomes.
async fn process_batch(
    batch: BatchRecord,
    handler: Arc<dyn JobHandler>,
    ctx: Arc<JobContext>,
    batches: Arc<dyn BatchStore>,
    publisher: Arc<ProgressPublisher>,
) -> Result<()> {
    let spec = handler.spec();
    let mut outcomes: Vec<Value> = Vec::with_capacity(batch.work_items.len());
    let mut success = 0i32;
    let mut error = 0i32;

    for item in &batch.work_items {
        if ctx.cancel.is_cancelled() {
            return Err(HalideError::Cancelled(format!(
                "batch {} interrupted after {} items",
                batch.id,
                success + error
            )));
        }

        let outcome = process_with_retry(handler.as_ref(), spec, item, ctx.as_ref()).await;
        if outcome.ok {
            success += 1;
        } else {
            error += 1;
        }
        outcomes.push(serde_json::to_value(&outcome)?);

        retry_transient!(
            batches
                .report_progress(batch.id, success + error, success, error)
                .await
        )?;

        if publisher.should_emit() {
            let agg = batches.aggregate(&batch.parent_job_id).await?;
            publisher
                .publish_progress(
                    "processing",
                    agg.processed as u64,
                    agg.items as u64,
                    agg.success as u64,
                    agg.error as u64,
                    false,
                )
                .await;
        }
    }

    retry_transient!(batches.complete(batch.id, &outcomes).await)?;

    if let Ok(Some(updated)) = batches.get_batch(batch.id).await {
        publisher.publish_batch(&updated).await;
    }
    let agg = batches.aggregate(&batch.parent_job_id).await?;
    publisher
        .publish_progress(
            "processing",
            agg.processed as u64,
            agg.items as u64,
            agg.success as u64,
            agg.error as u64,
            true,
        )
        .await;

    Ok(())
}

/// One item through the processor, with timeout and retry policy applied.
async fn process_with_retry(
    handler: &dyn JobHandler,
    spec: &JobSpec,
    item: &Value,
    ctx: &JobContext,
) -> ItemOutcome {
    let max_retries = if spec.retry_on_failure {
        spec.max_retries
    } else {
        0
    };

    let mut attempt = 0u32;
    loop {
        let outcome = match spec.timeout_per_item {
            Some(limit) => match timeout(limit, handler.process(item, ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Timed-out items count as errors and are not retried.
                    return ItemOutcome::failure(format!(
                        "processing timed out after {:.1}s",
                        limit.as_secs_f64()
                    ));
                }
            },
            None => handler.process(item, ctx).await,
        };

        if outcome.ok || attempt >= max_retries || ctx.cancel.is_cancelled() {
            return outcome;
        }

        let backoff = RETRY_BASE_DELAY
            .saturating_mul(1u32 << attempt.min(16))
            .min(RETRY_MAX_DELAY);
        sleep(backoff).await;
        attempt += 1;
    }
}

fn merge_result(result: &mut Value, summary: Value) {
    match summary {
        Value::Null => {}
        Value::Object(map) => {
            if let Value::Object(target) = result {
                for (key, value) in map {
                    target.insert(key, value);
                }
            }
        }
        other => {
            if let Value::Object(target) = result {
                target.insert("finalize".to_string(), other);
            }
        }
    }
}
