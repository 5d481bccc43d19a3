//! The `ExecutableNode` trait and the collaborator traits bound into a run.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::ExecutionContext;
use crate::models::Node;
use crate::NodeError;

/// Resolved data inputs, keyed by input port id.
pub type NodeInputs = Map<String, Value>;

/// What an executor hands back to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// Output values keyed by output port id.
    pub values: Map<String, Value>,
    /// Trigger outputs to fire. `None` fires every trigger output the node has.
    pub fire: Option<Vec<String>>,
}

impl NodeOutput {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values, fire: None }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder: add one output value.
    pub fn with(mut self, port: impl Into<String>, value: Value) -> Self {
        self.values.insert(port.into(), value);
        self
    }

    /// Builder: fire only the named trigger outputs.
    pub fn firing(mut self, ports: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fire = Some(ports.into_iter().map(Into::into).collect());
        self
    }
}

/// The core node trait: one implementation per node kind, held in the
/// registry and dispatched by type tag.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Execute `node` with its resolved data inputs and return its outputs.
    async fn execute(
        &self,
        node: &Node,
        inputs: NodeInputs,
        ctx: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError>;
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Options forwarded with an agent task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Free-form extra settings taken from the node config.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

/// Result of an agent task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
}

/// Allocates worker seats from an external pool and runs tasks on them.
#[async_trait]
pub trait AgentAllocator: Send + Sync {
    async fn request(&self, role_id: &str) -> Result<String, String>;
    async fn release(&self, agent_id: &str) -> Result<(), String>;
    async fn run_task(&self, agent_id: &str, prompt: &str, options: &TaskOptions) -> Result<TaskResult, String>;
}

/// Publishes and awaits named events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, event_type: &str, payload: Value) -> Result<(), String>;
    /// Wait for the next event of `event_type`; `None` waits indefinitely.
    async fn wait(&self, event_type: &str, timeout: Option<Duration>) -> Result<Value, String>;
}
