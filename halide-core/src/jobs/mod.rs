//! The parallel job framework: definitions, registry, progress, executor,
//! controller.

pub mod controller;
pub mod definition;
pub mod definitions;
pub mod executor;
pub mod progress;
pub mod registry;

pub use controller::JobController;
pub use definition::{ItemOutcome, JobContext, JobHandler, JobParams, JobSpec};
pub use executor::JobExecutor;
pub use progress::ProgressPublisher;
pub use registry::JobRegistry;
