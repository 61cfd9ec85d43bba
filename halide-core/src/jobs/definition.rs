//! Declarative job definitions.
//!
//! A job is an immutable value: a spec (name plus execution knobs) and the
//! three behaviors `discover`, `process`, `finalize` behind a trait object.
//! New jobs are added by registering another implementation; the executor
//! never branches on job names.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use halide_model::{CatalogId, HashKind, JobId, SelectionMethod};

use crate::config::RuntimeConfig;
use crate::database::CatalogGateway;
use crate::error::Result;

/// Execution knobs for one job type.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: &'static str,
    pub batch_size: usize,
    pub max_workers: usize,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub timeout_per_item: Option<Duration>,
}

impl JobSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            batch_size: 1000,
            max_workers: 4,
            retry_on_failure: true,
            max_retries: 3,
            timeout_per_item: None,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn retry_on_failure(mut self, retry: bool) -> Self {
        self.retry_on_failure = retry;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout_per_item(mut self, timeout: Duration) -> Self {
        self.timeout_per_item = Some(timeout);
        self
    }
}

/// Free-form submission parameters with typed accessors. Unknown keys are
/// ignored; recognized keys are read by the processors that care.
#[derive(Debug, Clone, Default)]
pub struct JobParams {
    raw: Map<String, Value>,
}

impl JobParams {
    pub fn new(value: Value) -> Self {
        match value {
            Value::Object(raw) => Self { raw },
            _ => Self::default(),
        }
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn bool(&self, key: &str, default: bool) -> bool {
        self.raw.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn int(&self, key: &str, default: i64) -> i64 {
        self.raw.get(key).and_then(Value::as_i64).unwrap_or(default)
    }

    pub fn float(&self, key: &str, default: f64) -> f64 {
        self.raw.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str)
    }

    pub fn hash_kind(&self) -> HashKind {
        self.str("hash_kind")
            .and_then(|s| HashKind::from_str(s).ok())
            .unwrap_or(HashKind::Dhash)
    }

    pub fn selection_method(&self) -> SelectionMethod {
        self.str("selection_method")
            .and_then(|s| SelectionMethod::from_str(s).ok())
            .unwrap_or(SelectionMethod::Quality)
    }
}

/// Everything a processor sees besides the work item itself.
pub struct JobContext {
    pub job_id: JobId,
    pub catalog_id: CatalogId,
    pub params: JobParams,
    pub gateway: Arc<dyn CatalogGateway>,
    pub cancel: CancellationToken,
    pub config: RuntimeConfig,
}

/// Outcome of processing one work item. Per-item failures are data, not
/// errors: they bump the batch error counter and never abort the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// One registered job type. Implementations hold no mutable state; all
/// effects go through the gateway in the context.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn spec(&self) -> &JobSpec;

    /// Find the finite work set for a catalog. Runs before any `process`.
    async fn discover(&self, ctx: &JobContext) -> Result<Vec<Value>>;

    /// Process one work item. Must not panic for ordinary bad inputs;
    /// failures are returned as failed outcomes.
    async fn process(&self, item: &Value, ctx: &JobContext) -> ItemOutcome;

    /// Aggregate successful per-item results after every batch terminated.
    /// Not invoked when the job was cancelled.
    async fn finalize(&self, _results: &[Value], _ctx: &JobContext) -> Result<Value> {
        Ok(Value::Null)
    }

    fn has_finalizer(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_defaults_match_framework_contract() {
        let spec = JobSpec::new("example");
        assert_eq!(spec.batch_size, 1000);
        assert_eq!(spec.max_workers, 4);
        assert!(spec.retry_on_failure);
        assert_eq!(spec.max_retries, 3);
        assert!(spec.timeout_per_item.is_none());
    }

    #[test]
    fn params_read_recognized_keys_and_ignore_the_rest() {
        let params = JobParams::new(json!({
            "generate_thumbnail": false,
            "similarity_threshold": 3,
            "gap_threshold": 2.5,
            "hash_kind": "whash",
            "selection_method": "middle",
            "no_such_option": {"nested": true},
        }));
        assert!(!params.bool("generate_thumbnail", true));
        assert_eq!(params.int("similarity_threshold", 5), 3);
        assert_eq!(params.float("gap_threshold", 1.0), 2.5);
        assert_eq!(params.hash_kind(), HashKind::Whash);
        assert_eq!(params.selection_method(), SelectionMethod::Middle);
        // Defaults apply for absent keys.
        assert_eq!(params.int("min_size", 3), 3);
    }

    #[test]
    fn params_tolerate_non_object_values() {
        let params = JobParams::new(Value::Null);
        assert!(params.bool("extract_metadata", true));
        assert_eq!(params.hash_kind(), HashKind::Dhash);

        let params = JobParams::new(json!({"hash_kind": "bogus"}));
        assert_eq!(params.hash_kind(), HashKind::Dhash);
    }

    #[test]
    fn outcome_serialization_omits_absent_fields() {
        let ok = serde_json::to_value(ItemOutcome::success(json!({"n": 1}))).unwrap();
        assert_eq!(ok, json!({"ok": true, "result": {"n": 1}}));

        let err = serde_json::to_value(ItemOutcome::failure("boom")).unwrap();
        assert_eq!(err, json!({"ok": false, "error": "boom"}));
    }
}
