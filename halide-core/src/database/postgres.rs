//! Postgres-backed implementation of the storage ports.
//!
//! All multi-row mutations run inside a single transaction; batch claims
//! use `FOR UPDATE SKIP LOCKED` so at most one worker observes a given
//! batch in `running`; pub/sub rides on `pg_notify`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use halide_model::image::validate_hash_hex;
use halide_model::{
    BatchAggregate, BatchId, BatchRecord, BatchStatus, BurstId, BurstRecord, CatalogEvent,
    CatalogId, CatalogRecord, DuplicateGroupRecord, FileType, ImageId, ImageRecord, ImageStatus,
    JobId, JobRecord, JobStatus,
};

use crate::analysis::bursts::BurstImage;
use crate::analysis::duplicates::HashedImage;
use crate::database::gateway::{BatchStore, CatalogGateway, JobStore, NewImage, TagPrediction};
use crate::error::{HalideError, Result};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool and verify connectivity.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| HalideError::Internal(format!("store failed Postgres health check: {e}")))?;
        info!("catalog store connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a catalog row. Mostly used by tests and provisioning code;
    /// job execution never creates catalogs.
    pub async fn create_catalog(&self, catalog: &CatalogRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO catalogs (id, name, source_directories, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            "#,
        )
        .bind(catalog.id.to_uuid())
        .bind(&catalog.name)
        .bind(&catalog.source_directories)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_image_ids_where(&self, catalog_id: CatalogId, predicate: &str) -> Result<Vec<ImageId>> {
        let sql = format!(
            "SELECT id FROM images WHERE catalog_id = $1 AND file_type = 'image' AND {predicate} ORDER BY id"
        );
        let rows = sqlx::query_scalar::<_, String>(&sql)
            .bind(catalog_id.to_uuid())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ImageId::from).collect())
    }
}

#[async_trait]
impl CatalogGateway for PostgresStore {
    async fn get_catalog(&self, catalog_id: CatalogId) -> Result<CatalogRecord> {
        let row = sqlx::query_as::<_, CatalogRow>(
            "SELECT id, name, source_directories, created_at, updated_at FROM catalogs WHERE id = $1",
        )
        .bind(catalog_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HalideError::NotFound(format!("catalog {catalog_id}")))?;
        Ok(row.into_record())
    }

    async fn list_source_directories(&self, catalog_id: CatalogId) -> Result<Vec<String>> {
        let dirs = sqlx::query_scalar::<_, Vec<String>>(
            "SELECT source_directories FROM catalogs WHERE id = $1",
        )
        .bind(catalog_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HalideError::NotFound(format!("catalog {catalog_id}")))?;
        Ok(dirs)
    }

    async fn list_images_without_hashes(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>> {
        self.list_image_ids_where(catalog_id, "dhash IS NULL").await
    }

    async fn list_all_image_ids(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>> {
        self.list_image_ids_where(catalog_id, "TRUE").await
    }

    async fn list_images_without_thumbnails(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>> {
        self.list_image_ids_where(catalog_id, "thumbnail_path IS NULL")
            .await
    }

    async fn list_unscored_images(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>> {
        self.list_image_ids_where(catalog_id, "quality_score IS NULL")
            .await
    }

    async fn list_untagged_images(&self, catalog_id: CatalogId) -> Result<Vec<ImageId>> {
        self.list_image_ids_where(
            catalog_id,
            "(processing_flags ->> 'auto_tagged') IS DISTINCT FROM 'true'",
        )
        .await
    }

    async fn list_images_with_hashes(&self, catalog_id: CatalogId) -> Result<Vec<HashedImage>> {
        let rows = sqlx::query_as::<_, HashedImageRow>(
            r#"
            SELECT id, checksum, dhash, ahash, whash, quality_score, size_bytes
            FROM images
            WHERE catalog_id = $1 AND dhash IS NOT NULL
            ORDER BY id
            "#,
        )
        .bind(catalog_id.to_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(HashedImageRow::into_projection).collect())
    }

    async fn list_images_with_timestamps(&self, catalog_id: CatalogId) -> Result<Vec<BurstImage>> {
        let rows = sqlx::query_as::<_, BurstImageRow>(
            r#"
            SELECT id,
                   dates #>> '{selected,timestamp}' AS taken_at,
                   metadata ->> 'camera_make' AS camera_make,
                   metadata ->> 'camera_model' AS camera_model,
                   quality_score
            FROM images
            WHERE catalog_id = $1
              AND dates #>> '{selected,timestamp}' IS NOT NULL
            ORDER BY (dates #>> '{selected,timestamp}')::timestamptz
            "#,
        )
        .bind(catalog_id.to_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BurstImageRow::into_projection).collect())
    }

    async fn get_image(&self, catalog_id: CatalogId, image_id: &ImageId) -> Result<ImageRecord> {
        let row = sqlx::query_as::<_, ImageRow>(
            r#"
            SELECT id, catalog_id, source_path, checksum, size_bytes, file_type,
                   dhash, ahash, whash, quality_score, thumbnail_path,
                   dates, metadata, status, processing_flags,
                   burst_id, burst_sequence, created_at, updated_at
            FROM images
            WHERE catalog_id = $1 AND id = $2
            "#,
        )
        .bind(catalog_id.to_uuid())
        .bind(image_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HalideError::NotFound(format!("image {image_id}")))?;
        row.into_record()
    }

    async fn get_image_path(&self, catalog_id: CatalogId, image_id: &ImageId) -> Result<String> {
        sqlx::query_scalar::<_, String>(
            "SELECT source_path FROM images WHERE catalog_id = $1 AND id = $2",
        )
        .bind(catalog_id.to_uuid())
        .bind(image_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HalideError::NotFound(format!("image {image_id}")))
    }

    async fn upsert_image(&self, record: &NewImage) -> Result<()> {
        let dates = serde_json::to_value(&record.dates)?;
        sqlx::query(
            r#"
            INSERT INTO images (
                id, catalog_id, source_path, checksum, size_bytes, file_type,
                dates, metadata, thumbnail_path, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
            ON CONFLICT (catalog_id, source_path) DO UPDATE SET
                checksum = EXCLUDED.checksum,
                size_bytes = EXCLUDED.size_bytes,
                file_type = EXCLUDED.file_type,
                dates = EXCLUDED.dates,
                metadata = images.metadata || EXCLUDED.metadata,
                thumbnail_path = COALESCE(EXCLUDED.thumbnail_path, images.thumbnail_path),
                updated_at = NOW()
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.catalog_id.to_uuid())
        .bind(&record.source_path)
        .bind(&record.checksum)
        .bind(record.size_bytes)
        .bind(record.file_type.as_str())
        .bind(dates)
        .bind(Value::Object(record.metadata.clone()))
        .bind(record.thumbnail_path.as_deref())
        .execute(&self.pool)
        .await?;
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
            validate_hash_hex(hash)?;
        }
        sqlx::query(
            "UPDATE images SET dhash = $2, ahash = $3, whash = $4, updated_at = NOW() WHERE id = $1",
        )
        .bind(image_id.as_str())
        .bind(dhash)
        .bind(ahash)
        .bind(whash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_image_quality(&self, image_id: &ImageId, quality_score: i32) -> Result<()> {
        sqlx::query("UPDATE images SET quality_score = $2, updated_at = NOW() WHERE id = $1")
            .bind(image_id.as_str())
            .bind(quality_score)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_image_thumbnail(
        &self,
        image_id: &ImageId,
        thumbnail_path: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE images SET thumbnail_path = $2, updated_at = NOW() WHERE id = $1")
            .bind(image_id.as_str())
            .bind(thumbnail_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn merge_image_metadata(
        &self,
        image_id: &ImageId,
        metadata: &Map<String, Value>,
        processing_flags: &Map<String, Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE images
            SET metadata = metadata || $2,
                processing_flags = processing_flags || $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(image_id.as_str())
        .bind(Value::Object(metadata.clone()))
        .bind(Value::Object(processing_flags.clone()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_duplicate_groups(
        &self,
        catalog_id: CatalogId,
        groups: &[DuplicateGroupRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM duplicate_members
            WHERE group_id IN (SELECT id FROM duplicate_groups WHERE catalog_id = $1)
            "#,
        )
        .bind(catalog_id.to_uuid())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM duplicate_groups WHERE catalog_id = $1")
            .bind(catalog_id.to_uuid())
            .execute(&mut *tx)
            .await?;

        for group in groups {
            let group_id = Uuid::now_v7();
            sqlx::query(
                r#"
                INSERT INTO duplicate_groups
                    (id, catalog_id, primary_image_id, similarity_type, confidence, reviewed)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(group_id)
            .bind(catalog_id.to_uuid())
            .bind(group.primary_image_id.as_str())
            .bind(group.similarity_type.as_str())
            .bind(group.confidence)
            .bind(group.reviewed)
            .execute(&mut *tx)
            .await?;

            for member in &group.members {
                sqlx::query(
                    r#"
                    INSERT INTO duplicate_members (group_id, image_id, similarity_score)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(group_id)
                .bind(member.image_id.as_str())
                .bind(member.similarity_score)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        info!("replaced duplicate groups for catalog {catalog_id}: {} groups", groups.len());
        Ok(())
    }

    async fn replace_burst_groups(
        &self,
        catalog_id: CatalogId,
        bursts: &[BurstRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE images SET burst_id = NULL, burst_sequence = NULL WHERE catalog_id = $1",
        )
        .bind(catalog_id.to_uuid())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM bursts WHERE catalog_id = $1")
            .bind(catalog_id.to_uuid())
            .execute(&mut *tx)
            .await?;

        for burst in bursts {
            let burst_id = BurstId::new();
            sqlx::query(
                r#"
                INSERT INTO bursts (
                    id, catalog_id, image_count, start_time, end_time, duration_seconds,
                    camera_make, camera_model, best_image_id, selection_method
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(burst_id.to_uuid())
            .bind(catalog_id.to_uuid())
            .bind(burst.image_ids.len() as i32)
            .bind(burst.start_time)
            .bind(burst.end_time)
            .bind(burst.duration_seconds)
            .bind(burst.camera_make.as_deref())
            .bind(burst.camera_model.as_deref())
            .bind(burst.best_image_id.as_ref().map(|id| id.as_str().to_string()))
            .bind(burst.selection_method.as_str())
            .execute(&mut *tx)
            .await?;

            for (sequence, image_id) in burst.image_ids.iter().enumerate() {
                sqlx::query(
                    "UPDATE images SET burst_id = $1, burst_sequence = $2 WHERE id = $3",
                )
                .bind(burst_id.to_uuid())
                .bind(sequence as i32)
                .bind(image_id.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        info!("replaced burst groups for catalog {catalog_id}: {} bursts", bursts.len());
        Ok(())
    }

    async fn add_image_tags(
        &self,
        _catalog_id: CatalogId,
        image_id: &ImageId,
        tags: &[TagPrediction],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for tag in tags {
            sqlx::query("INSERT INTO tags (id, name) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING")
                .bind(Uuid::now_v7())
                .bind(&tag.label)
                .execute(&mut *tx)
                .await?;
            let tag_id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM tags WHERE name = $1")
                .bind(&tag.label)
                .fetch_one(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO image_tags (image_id, tag_id, confidence)
                VALUES ($1, $2, $3)
                ON CONFLICT (image_id, tag_id) DO UPDATE SET confidence = EXCLUDED.confidence
                "#,
            )
            .bind(image_id.as_str())
            .bind(tag_id)
            .bind(tag.confidence)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, event: &CatalogEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
        {
            // Best-effort by contract; readers fall back to polling.
            warn!("pg_notify on {channel} failed: {e}");
        }
        Ok(())
    }
}

#[async_trait]
impl BatchStore for PostgresStore {
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

        let mut tx = self.pool.begin().await?;
        for (number, chunk) in items.chunks(batch_size).enumerate() {
            sqlx::query(
                r#"
                INSERT INTO job_batches (
                    id, parent_job_id, catalog_id, batch_number, total_batches,
                    job_type, status, work_items, items_count
                )
                VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8)
                "#,
            )
            .bind(BatchId::new().to_uuid())
            .bind(job.id.as_str())
            .bind(catalog_id.to_uuid())
            .bind(number as i32)
            .bind(total_batches)
            .bind(&job.job_type)
            .bind(Value::Array(chunk.to_vec()))
            .bind(chunk.len() as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(
            "created {total_batches} batches for job {} ({} items)",
            job.id,
            items.len()
        );
        Ok(total_batches)
    }

    async fn claim_next(
        &self,
        parent_job_id: &JobId,
        worker_id: &str,
    ) -> Result<Option<BatchRecord>> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            WITH next AS (
                SELECT id FROM job_batches
                WHERE parent_job_id = $1 AND status = 'pending'
                ORDER BY batch_number
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE job_batches jb
            SET status = 'running',
                worker_id = $2,
                started_at = NOW(),
                updated_at = NOW()
            FROM next
            WHERE jb.id = next.id
            RETURNING jb.id, jb.parent_job_id, jb.catalog_id, jb.batch_number,
                      jb.total_batches, jb.job_type, jb.status, jb.work_items,
                      jb.items_count, jb.worker_id, jb.processed_count,
                      jb.success_count, jb.error_count, jb.results,
                      jb.error_message, jb.started_at, jb.completed_at, jb.updated_at
            "#,
        )
        .bind(parent_job_id.as_str())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BatchRow::into_record).transpose()
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<Option<BatchRecord>> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT id, parent_job_id, catalog_id, batch_number, total_batches,
                   job_type, status, work_items, items_count, worker_id,
                   processed_count, success_count, error_count, results,
                   error_message, started_at, completed_at, updated_at
            FROM job_batches WHERE id = $1
            "#,
        )
        .bind(batch_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(BatchRow::into_record).transpose()
    }

    async fn report_progress(
        &self,
        batch_id: BatchId,
        processed: i32,
        success: i32,
        error: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_batches
            SET processed_count = GREATEST(processed_count, $2),
                success_count = GREATEST(success_count, $3),
                error_count = GREATEST(error_count, $4),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(batch_id.to_uuid())
        .bind(processed)
        .bind(success)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(&self, batch_id: BatchId, results: &[Value]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_batches
            SET status = 'completed',
                results = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(batch_id.to_uuid())
        .bind(Value::Array(results.to_vec()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, batch_id: BatchId, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_batches
            SET status = 'failed',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(batch_id.to_uuid())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_job_batches(&self, parent_job_id: &JobId) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE job_batches
            SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
            WHERE parent_job_id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(parent_job_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn aggregate(&self, parent_job_id: &JobId) -> Result<BatchAggregate> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::bigint AS total,
                COUNT(*) FILTER (WHERE status = 'pending')::bigint AS pending,
                COUNT(*) FILTER (WHERE status = 'running')::bigint AS running,
                COUNT(*) FILTER (WHERE status = 'completed')::bigint AS completed,
                COUNT(*) FILTER (WHERE status = 'failed')::bigint AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled')::bigint AS cancelled,
                COALESCE(SUM(processed_count), 0)::bigint AS processed,
                COALESCE(SUM(success_count), 0)::bigint AS success,
                COALESCE(SUM(error_count), 0)::bigint AS error,
                COALESCE(SUM(items_count), 0)::bigint AS items
            FROM job_batches
            WHERE parent_job_id = $1
            "#,
        )
        .bind(parent_job_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(BatchAggregate {
            total: row.get("total"),
            pending: row.get("pending"),
            running: row.get("running"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            cancelled: row.get("cancelled"),
            processed: row.get("processed"),
            success: row.get("success"),
            error: row.get("error"),
            items: row.get("items"),
        })
    }

    async fn count_for_job(&self, parent_job_id: &JobId) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)::bigint FROM job_batches WHERE parent_job_id = $1",
        )
        .bind(parent_job_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn collect_results(&self, parent_job_id: &JobId) -> Result<Vec<Value>> {
        let rows = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT results FROM job_batches
            WHERE parent_job_id = $1 AND status = 'completed'
            ORDER BY batch_number
            "#,
        )
        .bind(parent_job_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(flatten_successful_results(rows))
    }

    async fn collect_errors(&self, parent_job_id: &JobId, limit: usize) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT results FROM job_batches
            WHERE parent_job_id = $1
              AND status IN ('completed', 'failed', 'cancelled')
            ORDER BY batch_number
            "#,
        )
        .bind(parent_job_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(flatten_errors(rows, limit))
    }

    async fn reclaim_stale(&self, parent_job_id: &JobId, older_than: Duration) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE job_batches
            SET status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE parent_job_id = $1
              AND status = 'running'
              AND updated_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(parent_job_id.as_str())
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let reclaimed = res.rows_affected();
        if reclaimed > 0 {
            warn!("reclaimed {reclaimed} stale batches for job {parent_job_id}");
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, catalog_id, job_type, status, parameters, progress, result, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, '{}', '{}', NOW(), NOW())
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.catalog_id.map(|c| c.to_uuid()))
        .bind(&job.job_type)
        .bind(job.status.as_str())
        .bind(&job.parameters)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_running(&self, job_id: &JobId) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'running', updated_at = NOW() WHERE id = $1 AND status = 'pending'",
        )
        .bind(job_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_progress(&self, job_id: &JobId, progress: &Value) -> Result<()> {
        sqlx::query("UPDATE jobs SET progress = $2, updated_at = NOW() WHERE id = $1")
            .bind(job_id.as_str())
            .bind(progress)
            .execute(&self.pool)
            .await?;
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
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(job_id.as_str())
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, catalog_id, job_type, status, parameters, progress, result,
                   error, created_at, updated_at, completed_at
            FROM jobs WHERE id = $1
            "#,
        )
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_record).transpose()
    }

    async fn list_jobs(
        &self,
        catalog_id: Option<CatalogId>,
        status: Option<JobStatus>,
    ) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, catalog_id, job_type, status, parameters, progress, result,
                   error, created_at, updated_at, completed_at
            FROM jobs
            WHERE ($1::uuid IS NULL OR catalog_id = $1)
              AND ($2::varchar IS NULL OR status = $2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(catalog_id.map(|c| c.to_uuid()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_record).collect()
    }
}

fn value_to_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Flatten stored per-batch outcome arrays to the successful result payloads.
fn flatten_successful_results(batches: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::new();
    for batch in batches {
        if let Value::Array(outcomes) = batch {
            for outcome in outcomes {
                if outcome.get("ok").and_then(Value::as_bool) == Some(true) {
                    out.push(outcome.get("result").cloned().unwrap_or(Value::Null));
                }
            }
        }
    }
    out
}

/// Flatten stored per-batch outcome arrays to error strings, truncated.
fn flatten_errors(batches: Vec<Value>, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    for batch in batches {
        let Value::Array(outcomes) = batch else {
            continue;
        };
        for outcome in outcomes {
            if out.len() >= limit {
                return out;
            }
            if outcome.get("ok").and_then(Value::as_bool) == Some(false) {
                if let Some(msg) = outcome.get("error").and_then(Value::as_str) {
                    out.push(msg.to_string());
                }
            }
        }
    }
    out
}

#[derive(sqlx::FromRow)]
struct CatalogRow {
    id: Uuid,
    name: String,
    source_directories: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CatalogRow {
    fn into_record(self) -> CatalogRecord {
        CatalogRecord {
            id: CatalogId(self.id),
            name: self.name,
            source_directories: self.source_directories,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HashedImageRow {
    id: String,
    checksum: String,
    dhash: Option<String>,
    ahash: Option<String>,
    whash: Option<String>,
    quality_score: Option<i32>,
    size_bytes: i64,
}

impl HashedImageRow {
    fn into_projection(self) -> HashedImage {
        HashedImage {
            id: ImageId(self.id),
            checksum: self.checksum,
            dhash: self.dhash,
            ahash: self.ahash,
            whash: self.whash,
            quality_score: self.quality_score,
            size_bytes: Some(self.size_bytes),
        }
    }
}

#[derive(sqlx::FromRow)]
struct BurstImageRow {
    id: String,
    taken_at: Option<String>,
    camera_make: Option<String>,
    camera_model: Option<String>,
    quality_score: Option<i32>,
}

impl BurstImageRow {
    fn into_projection(self) -> BurstImage {
        let timestamp = self.taken_at.as_deref().and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| warn!("image {} has unparsable selected timestamp: {e}", self.id))
                .ok()
        });
        BurstImage {
            id: ImageId(self.id),
            timestamp,
            camera_make: self.camera_make,
            camera_model: self.camera_model,
            quality_score: self.quality_score,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ImageRow {
    id: String,
    catalog_id: Uuid,
    source_path: String,
    checksum: String,
    size_bytes: i64,
    file_type: String,
    dhash: Option<String>,
    ahash: Option<String>,
    whash: Option<String>,
    quality_score: Option<i32>,
    thumbnail_path: Option<String>,
    dates: Value,
    metadata: Value,
    status: String,
    processing_flags: Value,
    burst_id: Option<Uuid>,
    burst_sequence: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ImageRow {
    fn into_record(self) -> Result<ImageRecord> {
        Ok(ImageRecord {
            id: ImageId(self.id),
            catalog_id: CatalogId(self.catalog_id),
            source_path: self.source_path,
            checksum: self.checksum,
            size_bytes: self.size_bytes,
            file_type: FileType::from_str(&self.file_type)?,
            dhash: self.dhash,
            ahash: self.ahash,
            whash: self.whash,
            quality_score: self.quality_score,
            thumbnail_path: self.thumbnail_path,
            dates: serde_json::from_value(self.dates)?,
            metadata: value_to_map(self.metadata),
            status: ImageStatus::from_str(&self.status)?,
            processing_flags: value_to_map(self.processing_flags),
            burst_id: self.burst_id.map(BurstId),
            burst_sequence: self.burst_sequence,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    catalog_id: Option<Uuid>,
    job_type: String,
    status: String,
    parameters: Value,
    progress: Value,
    result: Value,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: JobId(self.id),
            catalog_id: self.catalog_id.map(CatalogId),
            job_type: self.job_type,
            status: JobStatus::from_str(&self.status)?,
            parameters: self.parameters,
            progress: self.progress,
            result: self.result,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    parent_job_id: String,
    catalog_id: Uuid,
    batch_number: i32,
    total_batches: i32,
    job_type: String,
    status: String,
    work_items: Value,
    items_count: i32,
    worker_id: Option<String>,
    processed_count: i32,
    success_count: i32,
    error_count: i32,
    results: Value,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl BatchRow {
    fn into_record(self) -> Result<BatchRecord> {
        let work_items = match self.work_items {
            Value::Array(items) => items,
            other => {
                return Err(HalideError::Internal(format!(
                    "batch {} work_items is not an array: {other}",
                    self.id
                )))
            }
        };
        let results = match self.results {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        Ok(BatchRecord {
            id: BatchId(self.id),
            parent_job_id: JobId(self.parent_job_id),
            catalog_id: CatalogId(self.catalog_id),
            batch_number: self.batch_number,
            total_batches: self.total_batches,
            job_type: self.job_type,
            status: BatchStatus::from_str(&self.status)?,
            work_items,
            items_count: self.items_count,
            worker_id: self.worker_id,
            processed_count: self.processed_count,
            success_count: self.success_count,
            error_count: self.error_count,
            results,
            error_message: self.error_message,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        })
    }
}
