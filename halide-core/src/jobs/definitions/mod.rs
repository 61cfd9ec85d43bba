//! Built-in job definitions.

mod bursts;
mod duplicates;
mod quality;
mod scan;
mod tagging;
mod thumbnails;

pub use bursts::DetectBurstsJob;
pub use duplicates::DetectDuplicatesJob;
pub use quality::ScoreQualityJob;
pub use scan::ScanJob;
pub use tagging::{AutoTagJob, HeuristicTagModel, TagModel};
pub use thumbnails::GenerateThumbnailsJob;
