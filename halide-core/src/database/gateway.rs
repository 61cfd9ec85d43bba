//! Storage ports consumed by the job framework.
//!
//! Three seams: `CatalogGateway` for catalog/image state and pub/sub,
//! `BatchStore` for the durable batch protocol, `JobStore` for job
//! lifecycle rows. `PostgresStore` implements all three against the
//! catalog database; `MemoryStore` mirrors them in-process for tests and
//! database-free operation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use halide_model::{
    BatchAggregate, BatchId, BatchRecord, BurstRecord, CatalogEvent, CatalogId, CatalogRecord,
    DateStamp, DuplicateGroupRecord, FileType, ImageId, ImageRecord, JobId, JobRecord, JobStatus,
};

use crate::analysis::bursts::BurstImage;
use crate::analysis::duplicates::HashedImage;
use crate::error::Result;

/// Payload for `upsert_image`. Conflicts on `(catalog_id, source_path)`
/// update the existing row, so repeated scans are idempotent.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub id: ImageId,
    pub catalog_id: CatalogId,
    pub source_path: String,
    pub checksum: String,
    pub size_bytes: i64,
    pub file_type: FileType,
    pub dates: BTreeMap<String, DateStamp>,
    pub metadata: Map<String, Value>,
    pub thumbnail_path: Option<String>,
}

/// One predicted tag for an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagPrediction {
    pub label: String,
    /// 0.0-1.0
    pub confidence: f32,
}

/// Read/write surface over catalog state. Every operation may fail with a
/// transient I/O error (retried by callers) or a constraint violation
/// (fatal for the batch or item it originated from).
#[async_trait]
pub trait CatalogGateway: Send + Sync {
    async fn get_catalog(&self, catalog_id: CatalogId) -> Result<CatalogRecord>;

    async fn list_source_directories(&self, catalog_id: CatalogId) -> Result<Vec<String>>;

    /// Image-typed rows still lacking perceptual hashes.
    async fn list_images_without_hashes(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>>;

    /// Every image-typed row, for recompute runs.
    async fn list_all_image_ids(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>>;

    /// Image-typed rows lacking a thumbnail.
    async fn list_images_without_thumbnails(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>>;

    /// Image-typed rows lacking a quality score.
    async fn list_unscored_images(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>>;

    /// Image-typed rows not yet auto-tagged.
    async fn list_untagged_images(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>>;

    /// Hashed rows with the fields grouping needs.
    async fn list_images_with_hashes(&self, catalog_id: CatalogId) -> Result<Vec<HashedImage>>;

    /// Rows with a selected capture time, for burst detection.
    async fn list_images_with_timestamps(&self, catalog_id: CatalogId) -> Result<Vec<BurstImage>>;

    async fn get_image(&self, catalog_id: CatalogId, image_id: &ImageId) -> Result<ImageRecord>;

    async fn get_image_path(&self, catalog_id: CatalogId, image_id: &ImageId) -> Result<String>;

    async fn upsert_image(&self, record: &NewImage) -> Result<()>;

    async fn update_image_hashes(
        &self,
        image_id: &ImageId,
        dhash: &str,
        ahash: &str,
        whash: &str,
    ) -> Result<()>;

    async fn update_image_quality(&self, image_id: &ImageId, quality_score: i32) -> Result<()>;

    async fn update_image_thumbnail(&self, image_id: &ImageId, thumbnail_path: &str)
        -> Result<()>;

    /// Shallow-merge entries into the image's `metadata` and
    /// `processing_flags` maps.
    async fn merge_image_metadata(
        &self,
        image_id: &ImageId,
        metadata: &Map<String, Value>,
        processing_flags: &Map<String, Value>,
    ) -> Result<()>;

    /// Atomically delete the catalog's prior duplicate groups and members
    /// and insert the new ones.
    async fn replace_duplicate_groups(
        &self,
        catalog_id: CatalogId,
        groups: &[DuplicateGroupRecord],
    ) -> Result<()>;

    /// Atomically delete the catalog's prior bursts (including per-image
    /// linkage) and insert the new ones.
    async fn replace_burst_groups(
        &self,
        catalog_id: CatalogId,
        bursts: &[BurstRecord],
    ) -> Result<()>;

    async fn add_image_tags(
        &self,
        catalog_id: CatalogId,
        image_id: &ImageId,
        tags: &[TagPrediction],
    ) -> Result<()>;

    /// Best-effort pub/sub emit; implementations log and swallow transport
    /// failures.
    async fn publish(&self, channel: &str, event: &CatalogEvent) -> Result<()>;
}

/// Durable batch protocol. Terminal transitions are idempotent; a batch in
/// `completed | failed | cancelled` never leaves that state.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Partition `items` into `ceil(n / batch_size)` rows in one
    /// transaction, all `pending`. Returns the number of batches created.
    async fn create_batches(
        &self,
        job: &JobRecord,
        catalog_id: CatalogId,
        items: &[Value],
        batch_size: usize,
    ) -> Result<i32>;

    /// Atomically claim one `pending` batch for the job, transitioning it to
    /// `running` and stamping the worker. At most one caller observes a
    /// given batch in `running`.
    async fn claim_next(&self, parent_job_id: &JobId, worker_id: &str)
        -> Result<Option<BatchRecord>>;

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<BatchRecord>>;

    /// Monotonic counter update; also refreshes the worker heartbeat.
    async fn report_progress(
        &self,
        batch_id: BatchId,
        processed: i32,
        success: i32,
        error: i32,
    ) -> Result<()>;

    /// `running -> completed`, storing per-item outcome values.
    async fn complete(&self, batch_id: BatchId, results: &[Value]) -> Result<()>;

    /// `running -> failed` with a batch-fatal message.
    async fn fail(&self, batch_id: BatchId, error_message: &str) -> Result<()>;

    /// Move every non-terminal batch of the job to `cancelled`. Returns the
    /// number of batches transitioned.
    async fn cancel_job_batches(&self, parent_job_id: &JobId) -> Result<u64>;

    async fn aggregate(&self, parent_job_id: &JobId) -> Result<BatchAggregate>;

    async fn count_for_job(&self, parent_job_id: &JobId) -> Result<i64>;

    /// Successful per-item result payloads across completed batches, in
    /// batch order.
    async fn collect_results(&self, parent_job_id: &JobId) -> Result<Vec<Value>>;

    /// Per-item error strings across terminal batches, in batch order,
    /// truncated to `limit`.
    async fn collect_errors(&self, parent_job_id: &JobId, limit: usize) -> Result<Vec<String>>;

    /// Return `running` batches whose heartbeat is older than `older_than`
    /// to `pending`, clearing the worker. Returns the number reclaimed.
    async fn reclaim_stale(&self, parent_job_id: &JobId, older_than: Duration) -> Result<u64>;
}

/// Job lifecycle rows. Status transitions are monotonic; terminal writes
/// against an already-terminal row are no-ops.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &JobRecord) -> Result<()>;

    async fn mark_running(&self, job_id: &JobId) -> Result<()>;

    async fn update_progress(&self, job_id: &JobId, progress: &Value) -> Result<()>;

    /// Terminal transition. `result` of `None` leaves the stored result
    /// untouched (used by cancellation).
    async fn complete_job(
        &self,
        job_id: &JobId,
        status: JobStatus,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()>;

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>>;

    async fn list_jobs(
        &self,
        catalog_id: Option<CatalogId>,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobRecord>>;
}
