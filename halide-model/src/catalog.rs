use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::CatalogId;

/// A logical photo library rooted at one or more source directories.
/// Immutable with respect to job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: CatalogId,
    pub name: String,
    pub source_directories: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
