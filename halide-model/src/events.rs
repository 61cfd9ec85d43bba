use serde::{Deserialize, Serialize};

use crate::ids::{BatchId, JobId};
use crate::job::{BatchStatus, JobStatus};

/// Throughput-aware progress snapshot for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub phase: String,
    pub processed: u64,
    pub total: u64,
    pub success: u64,
    pub error: u64,
    /// Items/sec, exponentially smoothed.
    pub rate_per_sec_ewma: f64,
    pub eta_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTransitionEvent {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub batch_number: i32,
    pub total_batches: i32,
    pub status: BatchStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLifecycleEvent {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event envelope emitted on a catalog's pub/sub channel, one JSON object
/// per line. The `type` tag distinguishes the three shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CatalogEvent {
    Progress(ProgressEvent),
    Batch(BatchTransitionEvent),
    Job(JobLifecycleEvent),
}

impl CatalogEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            CatalogEvent::Progress(e) => &e.job_id,
            CatalogEvent::Batch(e) => &e.job_id,
            CatalogEvent::Job(e) => &e.job_id,
        }
    }
}
