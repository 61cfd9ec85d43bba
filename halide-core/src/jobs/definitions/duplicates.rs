//! Duplicate detection job: per-image hash computation, then a grouping
//! finalizer that atomically replaces the catalog's duplicate groups.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use halide_model::{
    DuplicateGroupRecord, DuplicateMemberRecord, HashKind, ImageId, SimilarityType,
};

use crate::analysis::duplicates::{
    group_by_exact, group_by_similarity, select_primary, GroupCandidate, HashedImage,
};
use crate::analysis::hashing::{compute_all_hashes, similarity_score_hex};
use crate::error::{HalideError, Result};
use crate::jobs::definition::{ItemOutcome, JobContext, JobHandler, JobSpec};

pub struct DetectDuplicatesJob {
    spec: JobSpec,
}

impl DetectDuplicatesJob {
    pub fn new() -> Self {
        Self {
            spec: JobSpec::new("detect_duplicates"),
        }
    }
}

impl Default for DetectDuplicatesJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for DetectDuplicatesJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn discover(&self, ctx: &JobContext) -> Result<Vec<Value>> {
        let ids = if ctx.params.bool("recompute_hashes", false) {
            ctx.gateway.list_all_image_ids(ctx.catalog_id).await?
        } else {
            ctx.gateway.list_images_without_hashes(ctx.catalog_id).await?
        };
        Ok(ids
            .into_iter()
            .map(|id| Value::String(id.0))
            .collect())
    }

    async fn process(&self, item: &Value, ctx: &JobContext) -> ItemOutcome {
        let Some(image_id) = item.as_str().map(ImageId::from) else {
            return ItemOutcome::failure("hash work item is not an image id");
        };

        let path = match ctx.gateway.get_image_path(ctx.catalog_id, &image_id).await {
            Ok(path) => PathBuf::from(path),
            Err(e) => return ItemOutcome::failure(format!("{image_id}: {e}")),
        };

        let hashes = match tokio::task::spawn_blocking(move || compute_all_hashes(&path)).await {
            Ok(Ok(hashes)) => hashes,
            Ok(Err(e)) => return ItemOutcome::failure(format!("{image_id}: {e}")),
            Err(join_err) => {
                return ItemOutcome::failure(format!("{image_id}: hash task failed: {join_err}"))
            }
        };

        if let Err(e) = ctx
            .gateway
            .update_image_hashes(&image_id, &hashes.dhash, &hashes.ahash, &hashes.whash)
            .await
        {
            return ItemOutcome::failure(format!("{image_id}: hash persist failed: {e}"));
        }

        ItemOutcome::success(json!({
            "image_id": image_id,
            "dhash": hashes.dhash,
            "ahash": hashes.ahash,
            "whash": hashes.whash,
        }))
    }

    async fn finalize(&self, _results: &[Value], ctx: &JobContext) -> Result<Value> {
        let images = ctx.gateway.list_images_with_hashes(ctx.catalog_id).await?;
        let kind = ctx.params.hash_kind();
        let threshold = ctx.params.int("similarity_threshold", 5).clamp(0, 64) as u32;

        let exact = group_by_exact(&images);
        let perceptual = group_by_similarity(&images, kind, threshold)?;

        let by_id: HashMap<&ImageId, &HashedImage> =
            images.iter().map(|img| (&img.id, img)).collect();

        let mut groups = Vec::with_capacity(exact.len() + perceptual.len());
        for candidate in exact.iter().chain(perceptual.iter()) {
            if let Some(group) = assemble_group(candidate, &by_id, kind)? {
                groups.push(group);
            }
        }

        ctx.gateway
            .replace_duplicate_groups(ctx.catalog_id, &groups)
            .await?;

        Ok(json!({
            "exact_groups": exact.len(),
            "perceptual_groups": perceptual.len(),
            "groups_created": groups.len(),
            "total_duplicates": groups.iter().map(|g| g.members.len()).sum::<usize>(),
        }))
    }

    fn has_finalizer(&self) -> bool {
        true
    }
}

/// Turn a grouping candidate into a persisted record: pick the primary and
/// score each member against it.
fn assemble_group(
    candidate: &GroupCandidate,
    by_id: &HashMap<&ImageId, &HashedImage>,
    kind: HashKind,
) -> Result<Option<DuplicateGroupRecord>> {
    let members_data: Vec<HashedImage> = candidate
        .image_ids
        .iter()
        .filter_map(|id| by_id.get(id).map(|img| (*img).clone()))
        .collect();
    if members_data.len() < 2 {
        return Ok(None);
    }

    let primary_image_id = select_primary(&members_data)
        .ok_or_else(|| HalideError::Internal("primary selection on empty group".into()))?;
    let primary_hash = by_id
        .get(&primary_image_id)
        .and_then(|img| img.hash(kind))
        .map(str::to_string);

    let mut members = Vec::with_capacity(members_data.len());
    for img in &members_data {
        let similarity_score = if candidate.similarity_type == SimilarityType::Exact
            || img.id == primary_image_id
        {
            100
        } else {
            match (img.hash(kind), primary_hash.as_deref()) {
                (Some(a), Some(b)) => similarity_score_hex(a, b)?,
                _ => candidate.confidence,
            }
        };
        members.push(DuplicateMemberRecord {
            image_id: img.id.clone(),
            similarity_score,
        });
    }

    Ok(Some(DuplicateGroupRecord {
        primary_image_id,
        similarity_type: candidate.similarity_type,
        confidence: candidate.confidence,
        reviewed: false,
        members,
    }))
}
