//! Executor configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nodes::retry::RetryOverrides;
use serde::{Deserialize, Serialize};

use crate::EngineError;

/// What to do when more than one End node is reached in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndPolicy {
    /// Keep the first recorded result; later ones are logged and ignored.
    #[default]
    FirstWins,
    /// Each End overwrites the previous result.
    LastWins,
    /// A second End fails the run.
    Error,
}

/// What happens to a sync node whose predecessor failed under
/// `continueOnError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFailurePolicy {
    /// Fail every downstream sync that has not fired yet, and the run with it.
    #[default]
    FailFast,
    /// Leave the sync waiting; once the run drains it is reported skipped.
    Wait,
}

/// Tuning knobs for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Timeout for nodes that configure none and whose type has no default.
    /// `None` lets such nodes run unbounded.
    pub default_node_timeout_secs: Option<u64>,
    /// How long `cancel()` lets in-flight nodes wind down before aborting them.
    pub cancel_grace_ms: u64,
    /// Start in debug mode: one node per `step()`.
    pub debug: bool,
    /// Where progress is persisted. Restored from on `execute` when present.
    pub checkpoint_path: Option<PathBuf>,
    pub end_policy: EndPolicy,
    pub sync_failure_policy: SyncFailurePolicy,
    /// Applied to the context's retry configuration.
    pub retry: RetryOverrides,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_node_timeout_secs: None,
            cancel_grace_ms: 2_000,
            debug: false,
            checkpoint_path: None,
            end_policy: EndPolicy::default(),
            sync_failure_policy: SyncFailurePolicy::default(),
            retry: RetryOverrides::default(),
        }
    }
}

impl ExecutorConfig {
    /// Read a JSON config file; absent keys keep their defaults.
    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn default_node_timeout(&self) -> Option<Duration> {
        self.default_node_timeout_secs.map(Duration::from_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
