//! Job submission, querying, cancellation, and restart recovery.
//!
//! The controller owns the outer concurrency bound (a semaphore over
//! executing jobs) and the per-job cancellation tokens. Execution itself is
//! the executor's business.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use halide_model::{CatalogId, JobId, JobRecord, JobStatus};

use crate::config::RuntimeConfig;
use crate::database::{BatchStore, CatalogGateway, JobStore};
use crate::error::{HalideError, Result};
use crate::jobs::executor::JobExecutor;
use crate::jobs::registry::JobRegistry;

pub struct JobController {
    registry: Arc<JobRegistry>,
    batches: Arc<dyn BatchStore>,
    jobs: Arc<dyn JobStore>,
    executor: Arc<JobExecutor>,
    config: RuntimeConfig,
    permits: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl JobController {
    pub fn new(
        gateway: Arc<dyn CatalogGateway>,
        batches: Arc<dyn BatchStore>,
        jobs: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let executor = Arc::new(JobExecutor::new(
            gateway,
            batches.clone(),
            jobs.clone(),
            registry.clone(),
            config.clone(),
        ));
        Self {
            registry,
            batches,
            jobs,
            executor,
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate, persist as `pending`, and hand to the executor pool.
    /// Returns immediately with the job id.
    pub async fn submit(
        &self,
        job_type: &str,
        catalog_id: CatalogId,
        parameters: Value,
    ) -> Result<JobId> {
        self.submit_with_id(JobId::generate(), job_type, catalog_id, parameters)
            .await
    }

    /// Same as [`submit`](Self::submit) with an externally supplied id.
    pub async fn submit_with_id(
        &self,
        job_id: JobId,
        job_type: &str,
        catalog_id: CatalogId,
        parameters: Value,
    ) -> Result<JobId> {
        if !self.registry.contains(job_type) {
            return Err(HalideError::UnknownJobType(job_type.to_string()));
        }

        let now = Utc::now();
        let job = JobRecord {
            id: job_id.clone(),
            catalog_id: Some(catalog_id),
            job_type: job_type.to_string(),
            status: JobStatus::Pending,
            parameters,
            progress: Value::Object(Default::default()),
            result: Value::Object(Default::default()),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.jobs.create_job(&job).await?;
        info!("submitted job {job_id} ({job_type}) for catalog {catalog_id}");

        self.dispatch(job);
        Ok(job_id)
    }

    /// Request cancellation: flag the executor, sweep non-terminal batches,
    /// and terminate the job row. Irreversible and idempotent.
    pub async fn cancel(&self, job_id: &JobId) -> Result<()> {
        if let Some(token) = self.active.lock().unwrap().get(job_id) {
            token.cancel();
        }
        let swept = self.batches.cancel_job_batches(job_id).await?;
        self.jobs
            .complete_job(job_id, JobStatus::Cancelled, None, None)
            .await?;
        info!("cancelled job {job_id} ({swept} batches swept)");
        Ok(())
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        self.jobs.get_job(job_id).await
    }

    pub async fn list(
        &self,
        catalog_id: Option<CatalogId>,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobRecord>> {
        self.jobs.list_jobs(catalog_id, status).await
    }

    /// Startup recovery: reclaim stale batches of jobs left in `running` by
    /// a dead process and resume their dispatch. Per-item side-effects are
    /// idempotent by contract, so at-least-once re-processing is safe.
    pub async fn recover(&self) -> Result<usize> {
        let interrupted = self.jobs.list_jobs(None, Some(JobStatus::Running)).await?;
        let count = interrupted.len();
        for job in interrupted {
            let reclaimed = self
                .batches
                .reclaim_stale(&job.id, self.config.batch_reclaim_after)
                .await?;
            warn!(
                "resuming interrupted job {} ({reclaimed} stale batches reclaimed)",
                job.id
            );
            self.dispatch(job);
        }
        Ok(count)
    }

    /// Jobs currently tracked by this process.
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.active.lock().unwrap().keys().cloned().collect()
    }

    fn dispatch(&self, job: JobRecord) {
        let token = CancellationToken::new();
        self.active
            .lock()
            .unwrap()
            .insert(job.id.clone(), token.clone());

        let executor = self.executor.clone();
        let permits = self.permits.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let job_id = job.id.clone();
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            // Cancelled while queued behind the pool: the row is already
            // terminal, skip execution entirely.
            if token.is_cancelled() {
                active.lock().unwrap().remove(&job_id);
                return;
            }
            if let Err(e) = executor.run(job, token).await {
                error!("job {job_id} terminated with error: {e}");
            }
            active.lock().unwrap().remove(&job_id);
        });
    }
}
