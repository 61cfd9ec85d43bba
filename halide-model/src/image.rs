use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ModelError;
use crate::ids::{BurstId, CatalogId, ImageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Image,
    Video,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Image => "image",
            FileType::Video => "video",
        }
    }
}

impl FromStr for FileType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(FileType::Image),
            "video" => Ok(FileType::Video),
            other => Err(ModelError::InvalidFileType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Analyzing,
    NeedsReview,
    Complete,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Analyzing => "analyzing",
            ImageStatus::NeedsReview => "needs_review",
            ImageStatus::Complete => "complete",
        }
    }
}

impl FromStr for ImageStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ImageStatus::Pending),
            "analyzing" => Ok(ImageStatus::Analyzing),
            "needs_review" => Ok(ImageStatus::NeedsReview),
            "complete" => Ok(ImageStatus::Complete),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

/// Which perceptual hash a grouping run compares on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Dhash,
    Ahash,
    Whash,
}

impl HashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashKind::Dhash => "dhash",
            HashKind::Ahash => "ahash",
            HashKind::Whash => "whash",
        }
    }
}

impl FromStr for HashKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dhash" => Ok(HashKind::Dhash),
            "ahash" => Ok(HashKind::Ahash),
            "whash" => Ok(HashKind::Whash),
            other => Err(ModelError::InvalidHashKind(other.to_string())),
        }
    }
}

/// A dated observation about an image, keyed by source in
/// [`ImageRecord::dates`] (e.g. `"exif"`, `"file_mtime"`, `"selected"`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateStamp {
    pub timestamp: DateTime<Utc>,
    /// 0-100; how much the source is trusted.
    pub confidence: i32,
}

/// Durable image row. Created by the scan job, mutated by the analysis jobs
/// (hashes, thumbnail, quality, burst linkage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    pub catalog_id: CatalogId,
    pub source_path: String,
    /// SHA-256 of the file contents, lowercase hex.
    pub checksum: String,
    pub size_bytes: i64,
    pub file_type: FileType,
    pub dhash: Option<String>,
    pub ahash: Option<String>,
    pub whash: Option<String>,
    pub quality_score: Option<i32>,
    pub thumbnail_path: Option<String>,
    pub dates: BTreeMap<String, DateStamp>,
    pub metadata: Map<String, Value>,
    pub status: ImageStatus,
    pub processing_flags: Map<String, Value>,
    pub burst_id: Option<BurstId>,
    pub burst_sequence: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// The stored hash of the given kind, if computed.
    pub fn hash(&self, kind: HashKind) -> Option<&str> {
        match kind {
            HashKind::Dhash => self.dhash.as_deref(),
            HashKind::Ahash => self.ahash.as_deref(),
            HashKind::Whash => self.whash.as_deref(),
        }
    }
}

/// Perceptual hashes are 64 bits rendered as exactly 16 lowercase hex digits.
pub fn validate_hash_hex(hash: &str) -> Result<(), ModelError> {
    if hash.len() == 16
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        Ok(())
    } else {
        Err(ModelError::InvalidHash(hash.to_string()))
    }
}
