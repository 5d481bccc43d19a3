//! Checkpoint persistence.
//!
//! One JSON document per run at a caller-provided path, rewritten after every
//! node completes or fails and removed once the run succeeds. Writes go to a
//! sibling temp file first and are renamed into place.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nodes::NodeExecutionState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::loops::LoopProgress;
use crate::EngineError;

/// A single checkpoint snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Graph the snapshot belongs to; restoring into another graph is refused.
    pub graph_name: String,
    pub variables: Map<String, Value>,
    pub execution_state: BTreeMap<String, NodeExecutionState>,
    /// Loops that were mid-collection, keyed by loop node id.
    #[serde(default)]
    pub loops: BTreeMap<String, LoopProgress>,
    /// When the checkpoint was created.
    pub timestamp: DateTime<Utc>,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `checkpoint` to `path`, creating parent directories as needed.
pub async fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), EngineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(checkpoint)?;
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read the checkpoint at `path`. `Ok(None)` when there is none.
///
/// # Errors
/// [`EngineError::Checkpoint`] when the file exists but cannot be parsed.
pub async fn load(path: &Path) -> Result<Option<Checkpoint>, EngineError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| EngineError::Checkpoint(format!("{} is corrupt: {e}", path.display())))
}

/// Delete the checkpoint at `path`; a missing file is not an error.
pub async fn remove(path: &Path) -> Result<(), EngineError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodes::NodeStatus;
    use serde_json::json;

    fn sample() -> Checkpoint {
        let mut state = NodeExecutionState::pending("a");
        state.status = NodeStatus::Completed;
        state.outputs = json!({ "output": 1 }).as_object().cloned().unwrap();
        state.fired_outputs = vec!["trigger".into()];
        Checkpoint {
            graph_name: "g".into(),
            variables: json!({ "count": 2 }).as_object().cloned().unwrap(),
            execution_state: BTreeMap::from([("a".to_owned(), state)]),
            loops: BTreeMap::from([(
                "each".to_owned(),
                LoopProgress { items: vec![json!(1), json!(2)], index: 1, results: vec![json!("one")] },
            )]),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run.json");

        assert!(load(&path).await.unwrap().is_none());
        save(&path, &sample()).await.unwrap();

        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.execution_state["a"].status, NodeStatus::Completed);
        assert_eq!(loaded.variables["count"], json!(2));
        assert_eq!(loaded.loops["each"].index, 1);
        assert_eq!(loaded.loops["each"].results, vec![json!("one")]);

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("\"executionState\""));
        assert!(raw.contains("\"firedOutputs\""));

        remove(&path).await.unwrap();
        remove(&path).await.unwrap();
        assert!(load(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoints_without_loops_still_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let raw = json!({ "graphName": "g", "variables": {}, "executionState": {}, "timestamp": Utc::now() });
        tokio::fs::write(&path, raw.to_string()).await.unwrap();
        assert!(load(&path).await.unwrap().unwrap().loops.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        assert!(matches!(load(&path).await, Err(EngineError::Checkpoint(_))));
    }
}
