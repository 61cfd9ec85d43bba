use std::path::PathBuf;
use std::time::Duration;

/// Runtime knobs for the job subsystem. Values come from the environment
/// with conservative defaults; none of them are hot-reloaded.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on concurrently executing jobs.
    pub max_concurrent_jobs: usize,
    /// A `running` batch whose heartbeat is older than this may be reclaimed.
    pub batch_reclaim_after: Duration,
    /// Minimum interval between two progress events for the same job.
    pub progress_debounce: Duration,
    /// Where generated thumbnails are written.
    pub thumbnail_root: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            batch_reclaim_after: Duration::from_secs(60),
            progress_debounce: Duration::from_millis(250),
            thumbnail_root: PathBuf::from("thumbnails"),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_jobs: env_parse("HALIDE_MAX_CONCURRENT_JOBS")
                .unwrap_or(defaults.max_concurrent_jobs),
            batch_reclaim_after: env_parse("HALIDE_BATCH_RECLAIM_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.batch_reclaim_after),
            progress_debounce: env_parse("HALIDE_PROGRESS_DEBOUNCE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.progress_debounce),
            thumbnail_root: std::env::var("HALIDE_THUMBNAIL_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.thumbnail_root),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_concurrent_jobs, 2);
        assert_eq!(cfg.batch_reclaim_after, Duration::from_secs(60));
        assert_eq!(cfg.progress_debounce, Duration::from_millis(250));
    }
}
