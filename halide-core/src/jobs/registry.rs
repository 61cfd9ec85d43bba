//! Process-wide job registry.
//!
//! Registration happens once at start-up; afterwards the registry is shared
//! behind an `Arc` and lookups are plain map reads with no locking.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{HalideError, Result};
use crate::jobs::definition::JobHandler;
use crate::jobs::definitions::{
    AutoTagJob, DetectBurstsJob, DetectDuplicatesJob, GenerateThumbnailsJob, HeuristicTagModel,
    ScanJob, ScoreQualityJob, TagModel,
};

#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job definition. Names are unique; a duplicate is a
    /// start-up bug and fails loudly.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Result<()> {
        let name = handler.spec().name;
        if self.jobs.contains_key(name) {
            return Err(HalideError::Conflict(format!(
                "job '{name}' is already registered"
            )));
        }
        self.jobs.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.jobs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.jobs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// The standard registry: all six built-in jobs, with the default
    /// heuristic tag model.
    pub fn with_builtin_jobs() -> Arc<Self> {
        Self::with_builtin_jobs_and_model(Arc::new(HeuristicTagModel))
    }

    /// Same, but with a caller-supplied tagging model.
    pub fn with_builtin_jobs_and_model(tag_model: Arc<dyn TagModel>) -> Arc<Self> {
        let mut registry = Self::new();
        let builtins: Vec<Arc<dyn JobHandler>> = vec![
            Arc::new(ScanJob::new()),
            Arc::new(DetectDuplicatesJob::new()),
            Arc::new(DetectBurstsJob::new()),
            Arc::new(GenerateThumbnailsJob::new()),
            Arc::new(ScoreQualityJob::new()),
            Arc::new(AutoTagJob::new(tag_model)),
        ];
        for handler in builtins {
            registry
                .register(handler)
                .expect("built-in job names are unique");
        }
        Arc::new(registry)
    }
}
