//! Quality scoring job.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use halide_model::ImageId;

use crate::analysis::quality::score_path;
use crate::error::Result;
use crate::jobs::definition::{ItemOutcome, JobContext, JobHandler, JobSpec};

pub struct ScoreQualityJob {
    spec: JobSpec,
}

impl ScoreQualityJob {
    pub fn new() -> Self {
        Self {
            spec: JobSpec::new("score_quality"),
        }
    }
}

impl Default for ScoreQualityJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for ScoreQualityJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn discover(&self, ctx: &JobContext) -> Result<Vec<Value>> {
        let ids = ctx.gateway.list_unscored_images(ctx.catalog_id).await?;
        Ok(ids.into_iter().map(|id| Value::String(id.0)).collect())
    }

    async fn process(&self, item: &Value, ctx: &JobContext) -> ItemOutcome {
        let Some(image_id) = item.as_str().map(ImageId::from) else {
            return ItemOutcome::failure("quality work item is not an image id");
        };

        let path = match ctx.gateway.get_image_path(ctx.catalog_id, &image_id).await {
            Ok(path) => PathBuf::from(path),
            Err(e) => return ItemOutcome::failure(format!("{image_id}: {e}")),
        };

        let breakdown = match tokio::task::spawn_blocking(move || score_path(&path)).await {
            Ok(Ok(breakdown)) => breakdown,
            Ok(Err(e)) => return ItemOutcome::failure(format!("{image_id}: {e}")),
            Err(join_err) => {
                return ItemOutcome::failure(format!("{image_id}: scoring task failed: {join_err}"))
            }
        };

        match ctx
            .gateway
            .update_image_quality(&image_id, breakdown.overall)
            .await
        {
            Ok(()) => ItemOutcome::success(json!({
                "image_id": image_id,
                "quality_score": breakdown.overall,
                "sharpness": breakdown.sharpness,
                "exposure": breakdown.exposure,
            })),
            Err(e) => ItemOutcome::failure(format!("{image_id}: score persist failed: {e}")),
        }
    }
}
