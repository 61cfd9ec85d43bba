//! Thumbnail generation job.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use halide_model::ImageId;

use crate::error::Result;
use crate::jobs::definition::{ItemOutcome, JobContext, JobHandler, JobSpec};
use crate::media::thumbnails::{generate_thumbnail, ThumbnailOptions};

pub struct GenerateThumbnailsJob {
    spec: JobSpec,
}

impl GenerateThumbnailsJob {
    pub fn new() -> Self {
        Self {
            spec: JobSpec::new("generate_thumbnails"),
        }
    }
}

impl Default for GenerateThumbnailsJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for GenerateThumbnailsJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn discover(&self, ctx: &JobContext) -> Result<Vec<Value>> {
        let ids = ctx
            .gateway
            .list_images_without_thumbnails(ctx.catalog_id)
            .await?;
        Ok(ids.into_iter().map(|id| Value::String(id.0)).collect())
    }

    async fn process(&self, item: &Value, ctx: &JobContext) -> ItemOutcome {
        let Some(image_id) = item.as_str().map(ImageId::from) else {
            return ItemOutcome::failure("thumbnail work item is not an image id");
        };

        let source = match ctx.gateway.get_image_path(ctx.catalog_id, &image_id).await {
            Ok(path) => PathBuf::from(path),
            Err(e) => return ItemOutcome::failure(format!("{image_id}: {e}")),
        };

        let opts = ThumbnailOptions {
            size_px: ctx.params.int("size_px", 256).clamp(16, 4096) as u32,
            quality: ctx.params.int("quality", 85).clamp(1, 100) as u8,
        };
        let dest = ctx.config.thumbnail_root.join(format!("{image_id}.jpg"));

        let generated = {
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || generate_thumbnail(&source, &dest, &opts)).await
        };
        match generated {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return ItemOutcome::failure(format!("{image_id}: {e}")),
            Err(join_err) => {
                return ItemOutcome::failure(format!(
                    "{image_id}: thumbnail task failed: {join_err}"
                ))
            }
        }

        let thumbnail_path = dest.to_string_lossy().into_owned();
        match ctx
            .gateway
            .update_image_thumbnail(&image_id, &thumbnail_path)
            .await
        {
            Ok(()) => ItemOutcome::success(json!({
                "image_id": image_id,
                "thumbnail_path": thumbnail_path,
            })),
            Err(e) => ItemOutcome::failure(format!("{image_id}: thumbnail persist failed: {e}")),
        }
    }
}
