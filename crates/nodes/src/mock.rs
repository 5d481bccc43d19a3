//! `MockNode`: a test double for `ExecutableNode`.
//!
//! Register it under a custom type tag (or over a built-in one) when a real
//! executor is unavailable or irrelevant to the behaviour under test.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::context::ExecutionContext;
use crate::models::Node;
use crate::traits::{NodeInputs, NodeOutput};
use crate::{ExecutableNode, NodeError};

/// Behaviour injected into `MockNode` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Succeed with a specific JSON value.
    ReturnValue(Value),
    /// Fail with [`NodeError::Failed`].
    Fail(String),
    /// Sleep, then succeed with the value.
    Delay(Duration, Value),
}

/// A mock node that records every call it receives and returns a
/// programmer-specified result.
pub struct MockNode {
    pub behaviour: MockBehaviour,
    /// Trigger outputs to fire; `None` fires them all.
    pub fire: Option<Vec<String>>,
    /// `(node id, resolved inputs)` per call, in call order.
    pub calls: Arc<Mutex<Vec<(String, NodeInputs)>>>,
}

impl MockNode {
    fn with_behaviour(behaviour: MockBehaviour) -> Self {
        Self { behaviour, fire: None, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// A mock that always succeeds with the given value.
    pub fn returning(value: Value) -> Self {
        Self::with_behaviour(MockBehaviour::ReturnValue(value))
    }

    /// A mock that always fails.
    pub fn failing(msg: impl Into<String>) -> Self {
        Self::with_behaviour(MockBehaviour::Fail(msg.into()))
    }

    /// A mock that succeeds after `delay`.
    pub fn delayed(delay: Duration, value: Value) -> Self {
        Self::with_behaviour(MockBehaviour::Delay(delay, value))
    }

    /// Builder: fire only these trigger outputs.
    pub fn firing(mut self, ports: &[&str]) -> Self {
        self.fire = Some(ports.iter().map(|p| (*p).to_owned()).collect());
        self
    }

    /// Number of times this mock has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Ids of the nodes executed, in call order.
    pub fn called_nodes(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Objects are merged over `{ "node": <id> }` so tests can trace which
    /// node produced a payload; other values land on the `output` port.
    fn output(&self, node: &Node, value: &Value) -> NodeOutput {
        let mut values = Map::new();
        values.insert("node".into(), json!(node.id));
        match value {
            Value::Object(obj) => values.extend(obj.clone()),
            other => {
                values.insert("output".into(), other.clone());
            }
        }
        NodeOutput { values, fire: self.fire.clone() }
    }
}

#[async_trait]
impl ExecutableNode for MockNode {
    async fn execute(&self, node: &Node, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((node.id.clone(), inputs));

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.output(node, v)),
            MockBehaviour::Fail(msg) => Err(NodeError::failed(msg.clone())),
            MockBehaviour::Delay(delay, v) => {
                tokio::time::sleep(*delay).await;
                Ok(self.output(node, v))
            }
        }
    }
}
