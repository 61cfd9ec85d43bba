//! Auto-tagging job.
//!
//! The model is a pluggable seam: content-based tagging (CLIP-style
//! embeddings and the like) lives outside this crate and plugs in through
//! [`TagModel`]. The built-in heuristic derives tags from metadata the
//! catalog already holds, which keeps the job useful without any model
//! runtime.

use async_trait::async_trait;
use chrono::Datelike;
use serde_json::{json, Map, Value};

use halide_model::{ImageId, ImageRecord};

use crate::database::TagPrediction;
use crate::error::Result;
use crate::jobs::definition::{ItemOutcome, JobContext, JobHandler, JobSpec};

/// A tagging backend. Implementations must be cheap to call per image or do
/// their own batching internally.
pub trait TagModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn predict(&self, image: &ImageRecord, top_k: usize) -> Result<Vec<TagPrediction>>;
}

/// Metadata-driven stand-in model: file kind, camera, capture year.
pub struct HeuristicTagModel;

impl TagModel for HeuristicTagModel {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn predict(&self, image: &ImageRecord, top_k: usize) -> Result<Vec<TagPrediction>> {
        let mut tags = vec![TagPrediction {
            label: image.file_type.as_str().to_string(),
            confidence: 1.0,
        }];

        let extension = image
            .source_path
            .rsplit('.')
            .next()
            .map(str::to_lowercase)
            .unwrap_or_default();
        if matches!(extension.as_str(), "raw" | "cr2" | "nef" | "arw" | "dng") {
            tags.push(TagPrediction {
                label: "raw".to_string(),
                confidence: 0.95,
            });
        }

        if let Some(make) = image.metadata.get("camera_make").and_then(Value::as_str) {
            tags.push(TagPrediction {
                label: make.trim().to_lowercase(),
                confidence: 0.9,
            });
        }
        if let Some(model) = image.metadata.get("camera_model").and_then(Value::as_str) {
            tags.push(TagPrediction {
                label: model.trim().to_lowercase(),
                confidence: 0.8,
            });
        }

        if let Some(selected) = image.dates.get("selected") {
            tags.push(TagPrediction {
                label: selected.timestamp.year().to_string(),
                confidence: 0.85,
            });
        }

        tags.retain(|tag| !tag.label.is_empty());
        tags.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        tags.truncate(top_k);
        Ok(tags)
    }
}

pub struct AutoTagJob {
    spec: JobSpec,
    model: std::sync::Arc<dyn TagModel>,
}

impl AutoTagJob {
    pub fn new(model: std::sync::Arc<dyn TagModel>) -> Self {
        Self {
            spec: JobSpec::new("auto_tag").batch_size(500),
            model,
        }
    }
}

#[async_trait]
impl JobHandler for AutoTagJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn discover(&self, ctx: &JobContext) -> Result<Vec<Value>> {
        let ids = ctx.gateway.list_untagged_images(ctx.catalog_id).await?;
        Ok(ids.into_iter().map(|id| Value::String(id.0)).collect())
    }

    async fn process(&self, item: &Value, ctx: &JobContext) -> ItemOutcome {
        let Some(image_id) = item.as_str().map(ImageId::from) else {
            return ItemOutcome::failure("tagging work item is not an image id");
        };

        let image = match ctx.gateway.get_image(ctx.catalog_id, &image_id).await {
            Ok(image) => image,
            Err(e) => return ItemOutcome::failure(format!("{image_id}: {e}")),
        };

        let top_k = ctx.params.int("top_k", 10).clamp(1, 100) as usize;
        let predictions = match self.model.predict(&image, top_k) {
            Ok(predictions) => predictions,
            Err(e) => return ItemOutcome::failure(format!("{image_id}: model failed: {e}")),
        };

        if let Err(e) = ctx
            .gateway
            .add_image_tags(ctx.catalog_id, &image_id, &predictions)
            .await
        {
            return ItemOutcome::failure(format!("{image_id}: tag persist failed: {e}"));
        }

        let labels: Vec<&str> = predictions.iter().map(|t| t.label.as_str()).collect();
        let mut metadata = Map::new();
        metadata.insert("tags".to_string(), json!(labels));
        let mut flags = Map::new();
        flags.insert("auto_tagged".to_string(), Value::Bool(true));
        if let Err(e) = ctx
            .gateway
            .merge_image_metadata(&image_id, &metadata, &flags)
            .await
        {
            return ItemOutcome::failure(format!("{image_id}: metadata merge failed: {e}"));
        }

        ItemOutcome::success(json!({
            "image_id": image_id,
            "tags": labels,
            "model": self.model.name(),
            "requested_model": ctx.params.str("model"),
        }))
    }
}
