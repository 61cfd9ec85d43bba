//! Burst detection job.
//!
//! Single-pass by construction: one work item carrying the whole catalog
//! snapshot, one worker, no finalizer. The processor clusters, picks the
//! best shot per burst, and atomically replaces the catalog's burst rows.

use async_trait::async_trait;
use serde_json::{json, Value};

use halide_model::{BurstRecord, ImageId};

use crate::analysis::bursts::{detect_bursts, select_best, BurstImage, BurstParams};
use crate::error::Result;
use crate::jobs::definition::{ItemOutcome, JobContext, JobHandler, JobSpec};

pub struct DetectBurstsJob {
    spec: JobSpec,
}

impl DetectBurstsJob {
    pub fn new() -> Self {
        Self {
            // One batch, one worker: the gap clustering is order-sensitive
            // and must see the whole timeline at once.
            spec: JobSpec::new("detect_bursts")
                .batch_size(250_000)
                .max_workers(1),
        }
    }
}

impl Default for DetectBurstsJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for DetectBurstsJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn discover(&self, ctx: &JobContext) -> Result<Vec<Value>> {
        let images = ctx
            .gateway
            .list_images_with_timestamps(ctx.catalog_id)
            .await?;
        if images.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![json!({ "images": images })])
    }

    async fn process(&self, item: &Value, ctx: &JobContext) -> ItemOutcome {
        let images: Vec<BurstImage> = match item
            .get("images")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(images)) => images,
            _ => return ItemOutcome::failure("burst work item is not a catalog snapshot"),
        };

        let params = BurstParams {
            gap_threshold: ctx.params.float("gap_threshold", 1.0),
            min_size: ctx.params.int("min_size", 3).max(2) as usize,
            min_duration: ctx.params.float("min_duration", 0.5),
        };
        let method = ctx.params.selection_method();

        let candidates = detect_bursts(&images, &params);

        let mut records = Vec::with_capacity(candidates.len());
        let mut images_in_bursts = 0usize;
        for candidate in candidates {
            // Keep capture order when pulling the members back out.
            let members: Vec<BurstImage> = candidate
                .image_ids
                .iter()
                .filter_map(|id| images.iter().find(|img| &img.id == id).cloned())
                .collect();
            let best_image_id: Option<ImageId> = select_best(&members, method);

            images_in_bursts += candidate.image_ids.len();
            records.push(BurstRecord {
                image_ids: candidate.image_ids,
                start_time: candidate.start_time,
                end_time: candidate.end_time,
                duration_seconds: candidate.duration_seconds,
                camera_make: candidate.camera_make,
                camera_model: candidate.camera_model,
                best_image_id,
                selection_method: method,
            });
        }

        if let Err(e) = ctx
            .gateway
            .replace_burst_groups(ctx.catalog_id, &records)
            .await
        {
            return ItemOutcome::failure(format!("burst persist failed: {e}"));
        }

        ItemOutcome::success(json!({
            "bursts_detected": records.len(),
            "images_in_bursts": images_in_bursts,
        }))
    }
}
