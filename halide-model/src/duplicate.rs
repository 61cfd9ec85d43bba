use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::ImageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityType {
    Exact,
    Perceptual,
}

impl SimilarityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityType::Exact => "exact",
            SimilarityType::Perceptual => "perceptual",
        }
    }
}

impl FromStr for SimilarityType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(SimilarityType::Exact),
            "perceptual" => Ok(SimilarityType::Perceptual),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateMemberRecord {
    pub image_id: ImageId,
    /// 0-100; 100 for exact matches and for the primary itself.
    pub similarity_score: i32,
}

/// A fully assembled duplicate group as written by the detection finalizer.
/// Invariant: at least two members, and the primary is one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroupRecord {
    pub primary_image_id: ImageId,
    pub similarity_type: SimilarityType,
    /// 0-100.
    pub confidence: i32,
    pub reviewed: bool,
    pub members: Vec<DuplicateMemberRecord>,
}

impl DuplicateGroupRecord {
    pub fn contains(&self, image_id: &ImageId) -> bool {
        self.members.iter().any(|m| &m.image_id == image_id)
    }
}
