use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::ImageId;

/// How the representative image of a burst is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    Quality,
    First,
    Middle,
}

impl SelectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMethod::Quality => "quality",
            SelectionMethod::First => "first",
            SelectionMethod::Middle => "middle",
        }
    }
}

impl FromStr for SelectionMethod {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quality" => Ok(SelectionMethod::Quality),
            "first" => Ok(SelectionMethod::First),
            "middle" => Ok(SelectionMethod::Middle),
            other => Err(ModelError::InvalidSelectionMethod(other.to_string())),
        }
    }
}

/// A detected burst, ready to persist. `image_ids` are in capture order;
/// `start_time <= end_time` and `duration_seconds = end_time - start_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstRecord {
    pub image_ids: Vec<ImageId>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub best_image_id: Option<ImageId>,
    pub selection_method: SelectionMethod,
}

impl BurstRecord {
    pub fn image_count(&self) -> usize {
        self.image_ids.len()
    }
}
