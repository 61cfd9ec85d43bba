//! In-process implementation of the storage ports.
//!
//! Backs tests and database-free operation. A single mutex over the whole
//! state gives the same atomicity the Postgres row locks provide; the lock
//! is never held across an await point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use halide_model::{
    BatchAggregate, BatchId, BatchRecord, BatchStatus, BurstRecord, CatalogEvent, CatalogId,
    CatalogRecord, DuplicateGroupRecord, ImageId, ImageRecord, ImageStatus, JobId, JobRecord,
    JobStatus,
};

use crate::analysis::bursts::BurstImage;
use crate::analysis::duplicates::HashedImage;
use crate::database::gateway::{BatchStore, CatalogGateway, JobStore, NewImage, TagPrediction};
use crate::error::{HalideError, Result};

#[derive(Default)]
struct MemoryState {
    catalogs: HashMap<CatalogId, CatalogRecord>,
    images: HashMap<ImageId, ImageRecord>,
    jobs: HashMap<JobId, JobRecord>,
    batches: HashMap<BatchId, BatchRecord>,
    duplicate_groups: HashMap<CatalogId, Vec<DuplicateGroupRecord>>,
    bursts: HashMap<CatalogId, Vec<BurstRecord>>,
    tags: HashMap<ImageId, Vec<TagPrediction>>,
    published: Vec<(String, CatalogEvent)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_catalog(&self, catalog: CatalogRecord) {
        self.state
            .lock()
            .unwrap()
            .catalogs
            .insert(catalog.id, catalog);
    }

    pub fn insert_image(&self, image: ImageRecord) {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(image.id.clone(), image);
    }

    pub fn image(&self, image_id: &ImageId) -> Option<ImageRecord> {
        self.state.lock().unwrap().images.get(image_id).cloned()
    }

    pub fn image_count(&self, catalog_id: CatalogId) -> usize {
        self.state
            .lock()
            .unwrap()
            .images
            .values()
            .filter(|img| img.catalog_id == catalog_id)
            .count()
    }

    pub fn duplicate_groups(&self, catalog_id: CatalogId) -> Vec<DuplicateGroupRecord> {
        self.state
            .lock()
            .unwrap()
            .duplicate_groups
            .get(&catalog_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn bursts(&self, catalog_id: CatalogId) -> Vec<BurstRecord> {
        self.state
            .lock()
            .unwrap()
            .bursts
            .get(&catalog_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tags_for(&self, image_id: &ImageId) -> Vec<TagPrediction> {
        self.state
            .lock()
            .unwrap()
            .tags
            .get(image_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn published_events(&self) -> Vec<(String, CatalogEvent)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn batches_for(&self, parent_job_id: &JobId) -> Vec<BatchRecord> {
        let mut batches: Vec<BatchRecord> = self
            .state
            .lock()
            .unwrap()
            .batches
            .values()
            .filter(|b| &b.parent_job_id == parent_job_id)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.batch_number);
        batches
    }

    /// Test hook: force a batch into a given state, e.g. to simulate a
    /// worker that died mid-batch.
    pub fn set_batch_status(&self, batch_id: BatchId, status: BatchStatus) {
        if let Some(batch) = self.state.lock().unwrap().batches.get_mut(&batch_id) {
            batch.status = status;
        }
    }

    /// Test hook: age a batch's heartbeat.
    pub fn age_batch_heartbeat(&self, batch_id: BatchId, age: Duration) {
        if let Some(batch) = self.state.lock().unwrap().batches.get_mut(&batch_id) {
            batch.updated_at = Utc::now() - chrono::Duration::from_std(age).unwrap();
        }
    }

    fn list_image_ids_matching<F>(&self, catalog_id: CatalogId, predicate: F) -> Vec<ImageId>
    where
        F: Fn(&ImageRecord) -> bool,
    {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<ImageId> = state
            .images
            .values()
            .filter(|img| {
                img.catalog_id == catalog_id
                    && img.file_type == halide_model::FileType::Image
                    && predicate(img)
            })
            .map(|img| img.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl CatalogGateway for MemoryStore {
    async fn get_catalog(&self, catalog_id: CatalogId) -> Result<CatalogRecord> {
        self.state
            .lock()
            .unwrap()
            .catalogs
            .get(&catalog_id)
            .cloned()
            .ok_or_else(|| HalideError::NotFound(format!("catalog {catalog_id}")))
    }

    async fn list_source_directories(&self, catalog_id: CatalogId) -> Result<Vec<String>> {
        Ok(self.get_catalog(catalog_id).await?.source_directories)
    }

    async fn list_images_without_hashes(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>> {
        Ok(self.list_image_ids_matching(catalog_id, |img| img.dhash.is_none()))
    }

    async fn list_all_image_ids(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>> {
        Ok(self.list_image_ids_matching(catalog_id, |_| true))
    }

    async fn list_images_without_thumbnails(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>> {
        Ok(self.list_image_ids_matching(catalog_id, |img| img.thumbnail_path.is_none()))
    }

    async fn list_unscored_images(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>> {
        Ok(self.list_image_ids_matching(catalog_id, |img| img.quality_score.is_none()))
    }

    async fn list_untagged_images(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>> {
        Ok(self.list_image_ids_matching(catalog_id, |img| {
            img.processing_flags.get("auto_tagged") != Some(&Value::Bool(true))
        }))
    }

    async fn list_images_with_hashes(&self, catalog_id: CatalogId) -> Result<Vec<HashedImage>> {
        let state = self.state.lock().unwrap();
        let mut images: Vec<HashedImage> = state
            .images
            .values()
            .filter(|img| img.catalog_id == catalog_id && img.dhash.is_some())
            .map(|img| HashedImage {
                id: img.id.clone(),
                checksum: img.checksum.clone(),
                dhash: img.dhash.clone(),
                ahash: img.ahash.clone(),
                whash: img.whash.clone(),
                quality_score: img.quality_score,
                size_bytes: Some(img.size_bytes),
            })
            .collect();
        images.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(images)
    }

    async fn list_images_with_timestamps(&self, catalog_id: CatalogId) -> Result<Vec<BurstImage>> {
        let state = self.state.lock().unwrap();
        let mut images: Vec<BurstImage> = state
            .images
            .values()
            .filter(|img| img.catalog_id == catalog_id)
            .filter_map(|img| {
                let selected = img.dates.get("selected")?;
                Some(BurstImage {
                    id: img.id.clone(),
                    timestamp: Some(selected.timestamp),
                    camera_make: img
                        .metadata
                        .get("camera_make")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    camera_model: img
                        .metadata
                        .get("camera_model")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    quality_score: img.quality_score,
                })
            })
            .collect();
        images.sort_by_key(|img| img.timestamp);
        Ok(images)
    }

    async fn get_image(&self, catalog_id: CatalogId, image_id: &ImageId) -> Result<ImageRecord> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(image_id)
            .filter(|img| img.catalog_id == catalog_id)
            .cloned()
            .ok_or_else(|| HalideError::NotFound(format!("image {image_id}")))
    }

    async fn get_image_path(&self, catalog_id: CatalogId, image_id: &ImageId) -> Result<String> {
        Ok(self.get_image(catalog_id, image_id).await?.source_path)
    }

    async fn upsert_image(&self, record: &NewImage) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        let existing_id = state
            .images
            .values()
            .find(|img| {
                img.catalog_id == record.catalog_id && img.source_path == record.source_path
            })
            .map(|img| img.id.clone());

        match existing_id {
            Some(id) => {
                let img = state.images.get_mut(&id).expect("image present");
                img.checksum = record.checksum.clone();
                img.size_bytes = record.size_bytes;
                img.file_type = record.file_type;
                img.dates = record.dates.clone();
                for (key, value) in record.metadata.clone() {
                    img.metadata.insert(key, value);
                }
                if record.thumbnail_path.is_some() {
                    img.thumbnail_path = record.thumbnail_path.clone();
                }
                img.updated_at = now;
            }
            None => {
                state.images.insert(
                    record.id.clone(),
                    ImageRecord {
                        id: record.id.clone(),
                        catalog_id: record.catalog_id,
                        source_path: record.source_path.clone(),
                        checksum: record.checksum.clone(),
                        size_bytes: record.size_bytes,
                        file_type: record.file_type,
                        dhash: None,
                        ahash: None,
                        whash: None,
                        quality_score: None,
                        thumbnail_path: record.thumbnail_path.clone(),
                        dates: record.dates.clone(),
                        metadata: record.metadata.clone(),
                        status: ImageStatus::Pending,
                        processing_flags: Map::new(),
                        burst_id: None,
                        burst_sequence: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn update_image_hashes(
        &self,
        image_id: &ImageId,
        dhash: &str,
        ahash: &str,
        whash: &str,
    ) -> Result<()> {
        for hash in [dhash, ahash, whash] {
            halide_model::image::validate_hash_hex(hash)?;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(img) = state.images.get_mut(image_id) {
            img.dhash = Some(dhash.to_string());
            img.ahash = Some(ahash.to_string());
            img.whash = Some(whash.to_string());
            img.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_image_quality(&self, image_id: &ImageId, quality_score: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(img) = state.images.get_mut(image_id) {
            img.quality_score = Some(quality_score);
            img.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_image_thumbnail(
        &self,
        image_id: &ImageId,
        thumbnail_path: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(img) = state.images.get_mut(image_id) {
            img.thumbnail_path = Some(thumbnail_path.to_string());
            img.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn merge_image_metadata(
        &self,
        image_id: &ImageId,
        metadata: &Map<String, Value>,
        processing_flags: &Map<String, Value>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(img) = state.images.get_mut(image_id) {
            for (key, value) in metadata.clone() {
                img.metadata.insert(key, value);
            }
            for (key, value) in processing_flags.clone() {
                img.processing_flags.insert(key, value);
            }
            img.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn replace_duplicate_groups(
        &self,
        catalog_id: CatalogId,
        groups: &[DuplicateGroupRecord],
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .duplicate_groups
            .insert(catalog_id, groups.to_vec());
        Ok(())
    }

    async fn replace_burst_groups(
        &self,
        catalog_id: CatalogId,
        bursts: &[BurstRecord],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let image_ids: Vec<ImageId> = state
            .images
            .values()
            .filter(|img| img.catalog_id == catalog_id)
            .map(|img| img.id.clone())
            .collect();
        for id in image_ids {
            let img = state.images.get_mut(&id).expect("image present");
            img.burst_id = None;
            img.burst_sequence = None;
        }
        for burst in bursts {
            let burst_id = halide_model::BurstId::new();
            for (sequence, image_id) in burst.image_ids.iter().enumerate() {
                if let Some(img) = state.images.get_mut(image_id) {
                    img.burst_id = Some(burst_id);
                    img.burst_sequence = Some(sequence as i32);
                }
            }
        }
        state.bursts.insert(catalog_id, bursts.to_vec());
        Ok(())
    }

    async fn add_image_tags(
        &self,
        _catalog_id: CatalogId,
        image_id: &ImageId,
        tags: &[TagPrediction],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.tags.entry(image_id.clone()).or_default();
        for tag in tags {
            match entry.iter_mut().find(|t| t.label == tag.label) {
                Some(existing) => existing.confidence = tag.confidence,
                None => entry.push(tag.clone()),
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, event: &CatalogEvent) -> Result<()> {
        debug!("publish on {channel}: {event:?}");
        self.state
            .lock()
            .unwrap()
            .published
            .push((channel.to_string(), event.clone()));
        Ok(())
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn create_batches(
        &self,
        job: &JobRecord,
        catalog_id: CatalogId,
        items: &[Value],
        batch_size: usize,
    ) -> Result<i32> {
        if batch_size == 0 {
            return Err(HalideError::Internal("batch_size must be positive".into()));
        }
        let total_batches = items.len().div_ceil(batch_size) as i32;
        let now = Utc::now();

        let mut state = self.state.lock().unwrap();
        for (number, chunk) in items.chunks(batch_size).enumerate() {
            let id = BatchId::new();
            state.batches.insert(
                id,
                BatchRecord {
                    id,
                    parent_job_id: job.id.clone(),
                    catalog_id,
                    batch_number: number as i32,
                    total_batches,
                    job_type: job.job_type.clone(),
                    status: BatchStatus::Pending,
                    work_items: chunk.to_vec(),
                    items_count: chunk.len() as i32,
                    worker_id: None,
                    processed_count: 0,
                    success_count: 0,
                    error_count: 0,
                    results: Vec::new(),
                    error_message: None,
                    started_at: None,
                    completed_at: None,
                    updated_at: now,
                },
            );
        }
        Ok(total_batches)
    }

    async fn claim_next(
        &self,
        parent_job_id: &JobId,
        worker_id: &str,
    ) -> Result<Option<BatchRecord>> {
        let mut state = self.state.lock().unwrap();
        let next_id = state
            .batches
            .values()
            .filter(|b| &b.parent_job_id == parent_job_id && b.status == BatchStatus::Pending)
            .min_by_key(|b| b.batch_number)
            .map(|b| b.id);

        let Some(id) = next_id else {
            return Ok(None);
        };
        let batch = state.batches.get_mut(&id).expect("batch present");
        batch.status = BatchStatus::Running;
        batch.worker_id = Some(worker_id.to_string());
        batch.started_at = Some(Utc::now());
        batch.updated_at = Utc::now();
        Ok(Some(batch.clone()))
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<BatchRecord>> {
        Ok(self.state.lock().unwrap().batches.get(&batch_id).cloned())
    }

    async fn report_progress(
        &self,
        batch_id: BatchId,
        processed: i32,
        success: i32,
        error: i32,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(batch) = state.batches.get_mut(&batch_id) {
            if batch.status == BatchStatus::Running {
                batch.processed_count = batch.processed_count.max(processed);
                batch.success_count = batch.success_count.max(success);
                batch.error_count = batch.error_count.max(error);
                batch.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn complete(&self, batch_id: BatchId, results: &[Value]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(batch) = state.batches.get_mut(&batch_id) {
            if batch.status == BatchStatus::Running {
                batch.status = BatchStatus::Completed;
                batch.results = results.to_vec();
                batch.completed_at = Some(Utc::now());
                batch.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn fail(&self, batch_id: BatchId, error_message: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(batch) = state.batches.get_mut(&batch_id) {
            if !batch.status.is_terminal() {
                batch.status = BatchStatus::Failed;
                batch.error_message = Some(error_message.to_string());
                batch.completed_at = Some(Utc::now());
                batch.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn cancel_job_batches(&self, parent_job_id: &JobId) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut cancelled = 0u64;
        for batch in state
            .batches
            .values_mut()
            .filter(|b| &b.parent_job_id == parent_job_id && !b.status.is_terminal())
        {
            batch.status = BatchStatus::Cancelled;
            batch.completed_at = Some(Utc::now());
            batch.updated_at = Utc::now();
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn aggregate(&self, parent_job_id: &JobId) -> Result<BatchAggregate> {
        let state = self.state.lock().unwrap();
        let mut agg = BatchAggregate::default();
        for batch in state
            .batches
            .values()
            .filter(|b| &b.parent_job_id == parent_job_id)
        {
            agg.total += 1;
            match batch.status {
                BatchStatus::Pending => agg.pending += 1,
                BatchStatus::Running => agg.running += 1,
                BatchStatus::Completed => agg.completed += 1,
                BatchStatus::Failed => agg.failed += 1,
                BatchStatus::Cancelled => agg.cancelled += 1,
            }
            agg.processed += i64::from(batch.processed_count);
            agg.success += i64::from(batch.success_count);
            agg.error += i64::from(batch.error_count);
            agg.items += i64::from(batch.items_count);
        }
        Ok(agg)
    }

    async fn count_for_job(&self, parent_job_id: &JobId) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .batches
            .values()
            .filter(|b| &b.parent_job_id == parent_job_id)
            .count() as i64)
    }

    async fn collect_results(&self, parent_job_id: &JobId) -> Result<Vec<Value>> {
        let mut batches = self.batches_for(parent_job_id);
        batches.retain(|b| b.status == BatchStatus::Completed);

        let mut out = Vec::new();
        for batch in batches {
            for outcome in batch.results {
                if outcome.get("ok").and_then(Value::as_bool) == Some(true) {
                    out.push(outcome.get("result").cloned().unwrap_or(Value::Null));
                }
            }
        }
        Ok(out)
    }

    async fn collect_errors(&self, parent_job_id: &JobId, limit: usize) -> Result<Vec<String>> {
        let mut batches = self.batches_for(parent_job_id);
        batches.retain(|b| b.status.is_terminal());

        let mut out = Vec::new();
        for batch in batches {
            for outcome in batch.results {
                if out.len() >= limit {
                    return Ok(out);
                }
                if outcome.get("ok").and_then(Value::as_bool) == Some(false) {
                    if let Some(msg) = outcome.get("error").and_then(Value::as_str) {
                        out.push(msg.to_string());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn reclaim_stale(&self, parent_job_id: &JobId, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| HalideError::Internal(format!("invalid reclaim window: {e}")))?;
        let mut state = self.state.lock().unwrap();
        let mut reclaimed = 0u64;
        for batch in state.batches.values_mut().filter(|b| {
            &b.parent_job_id == parent_job_id
                && b.status == BatchStatus::Running
                && b.updated_at < cutoff
        }) {
            batch.status = BatchStatus::Pending;
            batch.worker_id = None;
            batch.started_at = None;
            batch.updated_at = Utc::now();
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.contains_key(&job.id) {
            return Err(HalideError::Conflict(format!("job {} already exists", job.id)));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn mark_running(&self, job_id: &JobId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(job_id) {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Running;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_progress(&self, job_id: &JobId, progress: &Value) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.progress = progress.clone();
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: &JobId,
        status: JobStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(HalideError::Internal(format!(
                "complete_job called with non-terminal status {status}"
            )));
        }
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(job_id) {
            if !job.status.is_terminal() {
                job.status = status;
                if let Some(result) = result {
                    job.result = result.clone();
                }
                if let Some(error) = error {
                    job.error = Some(error.to_string());
                }
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.state.lock().unwrap().jobs.get(job_id).cloned())
    }

    async fn list_jobs(
        &self,
        catalog_id: Option<CatalogId>,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobRecord>> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| catalog_id.is_none_or(|c| job.catalog_id == Some(c)))
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}
