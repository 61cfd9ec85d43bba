//! Scan job: walk source directories and populate image rows.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::warn;

use halide_model::{DateStamp, FileType, ImageId};

use crate::database::NewImage;
use crate::error::{HalideError, Result};
use crate::jobs::definition::{ItemOutcome, JobContext, JobHandler, JobSpec};
use crate::media::exif::{read_exif, ExifSummary};
use crate::media::scan::{classify, file_checksum, image_id_for_path, walk_media_files};
use crate::media::thumbnails::{generate_thumbnail, ThumbnailOptions};

/// Confidence assigned to EXIF capture dates.
const EXIF_DATE_CONFIDENCE: i32 = 90;
/// Confidence assigned to filesystem mtime fallback dates.
const MTIME_DATE_CONFIDENCE: i32 = 30;

pub struct ScanJob {
    spec: JobSpec,
}

impl ScanJob {
    pub fn new() -> Self {
        Self {
            spec: JobSpec::new("scan").batch_size(500),
        }
    }
}

impl Default for ScanJob {
    fn default() -> Self {
        Self::new()
    }
}

struct ScannedFile {
    record: NewImage,
    summary: Value,
}

/// Blocking half of per-file processing: checksum, EXIF, thumbnail.
fn scan_file(
    source_path: String,
    image_id: ImageId,
    extract_metadata: bool,
    thumbnail_dest: Option<PathBuf>,
    catalog_id: halide_model::CatalogId,
) -> Result<ScannedFile> {
    let path = PathBuf::from(&source_path);
    let checksum = file_checksum(&path)?;
    let file_meta = std::fs::metadata(&path)?;
    let file_type = classify(&path);

    let mut dates: BTreeMap<String, DateStamp> = BTreeMap::new();
    let mut metadata = Map::new();

    let exif = if extract_metadata {
        read_exif(&path)
    } else {
        None
    };
    if let Some(ref exif) = exif {
        apply_exif_metadata(&mut metadata, exif);
        if let Some(taken_at) = exif.taken_at {
            dates.insert(
                "exif".to_string(),
                DateStamp {
                    timestamp: taken_at,
                    confidence: EXIF_DATE_CONFIDENCE,
                },
            );
        }
    }

    if let Ok(modified) = file_meta.modified() {
        let mtime: DateTime<Utc> = modified.into();
        dates.insert(
            "file_mtime".to_string(),
            DateStamp {
                timestamp: mtime,
                confidence: MTIME_DATE_CONFIDENCE,
            },
        );
    }
    if let Some(selected) = dates
        .values()
        .max_by_key(|stamp| stamp.confidence)
        .copied()
    {
        dates.insert("selected".to_string(), selected);
    }

    let mut thumbnail_path = None;
    if let Some(dest) = thumbnail_dest {
        if file_type == FileType::Image {
            match generate_thumbnail(&path, &dest, &ThumbnailOptions::default()) {
                Ok(()) => thumbnail_path = Some(dest.to_string_lossy().into_owned()),
                // A bad preview is not worth losing the row over.
                Err(e) => warn!("thumbnail generation failed for {source_path}: {e}"),
            }
        }
    }

    let record = NewImage {
        id: image_id,
        catalog_id,
        source_path,
        checksum,
        size_bytes: file_meta.len() as i64,
        file_type,
        dates,
        metadata,
        thumbnail_path,
    };
    let summary = json!({
        "image_id": record.id,
        "source_path": record.source_path,
        "checksum": record.checksum,
        "size_bytes": record.size_bytes,
        "file_type": record.file_type,
    });

    Ok(ScannedFile { record, summary })
}

fn apply_exif_metadata(metadata: &mut Map<String, Value>, exif: &ExifSummary) {
    if let Some(ref make) = exif.camera_make {
        metadata.insert("camera_make".to_string(), Value::from(make.clone()));
    }
    if let Some(ref model) = exif.camera_model {
        metadata.insert("camera_model".to_string(), Value::from(model.clone()));
    }
    if let Some(ref lens) = exif.lens {
        metadata.insert("lens".to_string(), Value::from(lens.clone()));
    }
    if let Some(iso) = exif.iso {
        metadata.insert("iso".to_string(), Value::from(iso));
    }
    if let Some(aperture) = exif.aperture {
        metadata.insert("aperture".to_string(), Value::from(aperture));
    }
    if let Some(ref shutter) = exif.shutter_speed {
        metadata.insert("shutter_speed".to_string(), Value::from(shutter.clone()));
    }
}

#[async_trait]
impl JobHandler for ScanJob {
    fn spec(&self) -> &JobSpec {
        &self.spec
    }

    async fn discover(&self, ctx: &JobContext) -> Result<Vec<Value>> {
        let dirs = ctx.gateway.list_source_directories(ctx.catalog_id).await?;
        let mut items = Vec::new();
        for dir in dirs {
            let root = PathBuf::from(&dir);
            let files = tokio::task::spawn_blocking(move || walk_media_files(&root))
                .await
                .map_err(|e| HalideError::Internal(format!("directory walk task failed: {e}")))?;
            items.extend(
                files
                    .into_iter()
                    .map(|p| Value::String(p.to_string_lossy().into_owned())),
            );
        }
        Ok(items)
    }

    async fn process(&self, item: &Value, ctx: &JobContext) -> ItemOutcome {
        let Some(source_path) = item.as_str().map(str::to_string) else {
            return ItemOutcome::failure("scan work item is not a path string");
        };

        let image_id = image_id_for_path(&source_path);
        let extract_metadata = ctx.params.bool("extract_metadata", true);
        let thumbnail_dest = ctx.params.bool("generate_thumbnail", true).then(|| {
            ctx.config
                .thumbnail_root
                .join(format!("{image_id}.jpg"))
        });
        let catalog_id = ctx.catalog_id;

        let scanned = {
            let source_path = source_path.clone();
            tokio::task::spawn_blocking(move || {
                scan_file(
                    source_path,
                    image_id,
                    extract_metadata,
                    thumbnail_dest,
                    catalog_id,
                )
            })
            .await
        };

        let scanned = match scanned {
            Ok(Ok(scanned)) => scanned,
            Ok(Err(e)) => return ItemOutcome::failure(format!("{source_path}: {e}")),
            Err(join_err) => {
                return ItemOutcome::failure(format!("{source_path}: scan task failed: {join_err}"))
            }
        };

        match ctx.gateway.upsert_image(&scanned.record).await {
            Ok(()) => ItemOutcome::success(scanned.summary),
            Err(e) => ItemOutcome::failure(format!("{source_path}: upsert failed: {e}")),
        }
    }

    async fn finalize(&self, results: &[Value], _ctx: &JobContext) -> Result<Value> {
        let total_size: u64 = results
            .iter()
            .filter_map(|r| r.get("size_bytes").and_then(Value::as_u64))
            .sum();
        let images = results
            .iter()
            .filter(|r| r.get("file_type").and_then(Value::as_str) == Some("image"))
            .count();
        let videos = results
            .iter()
            .filter(|r| r.get("file_type").and_then(Value::as_str) == Some("video"))
            .count();

        Ok(json!({
            "total_files": results.len(),
            "total_images": images,
            "total_videos": videos,
            "total_size_bytes": total_size,
        }))
    }

    fn has_finalizer(&self) -> bool {
        true
    }
}
