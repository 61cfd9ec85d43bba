//! Core data model definitions shared across Halide crates.

pub mod burst;
pub mod catalog;
pub mod duplicate;
pub mod error;
pub mod events;
pub mod ids;
pub mod image;
pub mod job;

pub use burst::{BurstRecord, SelectionMethod};
pub use catalog::CatalogRecord;
pub use duplicate::{DuplicateGroupRecord, DuplicateMemberRecord, SimilarityType};
pub use error::{ModelError, Result as ModelResult};
pub use events::{BatchTransitionEvent, CatalogEvent, JobLifecycleEvent, ProgressEvent};
pub use ids::{BatchId, BurstId, CatalogId, ImageId, JobId};
pub use image::{validate_hash_hex, DateStamp, FileType, HashKind, ImageRecord, ImageStatus};
pub use job::{BatchAggregate, BatchRecord, BatchStatus, JobRecord, JobStatus};
