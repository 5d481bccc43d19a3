//! Control-flow node executors.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{loop_port, port};
use crate::context::ExecutionContext;
use crate::expression::truthy;
use crate::models::Node;
use crate::traits::{ExecutableNode, NodeInputs, NodeOutput};
use crate::NodeError;

/// Emits the run input on `data` and fires `trigger`.
pub struct StartNode;

#[async_trait]
impl ExecutableNode for StartNode {
    async fn execute(&self, _node: &Node, _inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::empty().with(port::DATA, ctx.run_input()))
    }
}

/// Produces `{ [outputKey]: value, success }` for the engine to record.
pub struct EndNode;

#[async_trait]
impl ExecutableNode for EndNode {
    async fn execute(&self, node: &Node, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let key = node.config_str("outputKey").unwrap_or("result");
        let success = node.config_bool("success").unwrap_or(true);
        let value = inputs.get(port::VALUE).cloned().unwrap_or(Value::Null);
        Ok(NodeOutput::empty().with(key, value).with("success", Value::Bool(success)))
    }
}

/// Passes `data` through; every `out_i` trigger fires.
pub struct BranchNode;

#[async_trait]
impl ExecutableNode for BranchNode {
    async fn execute(&self, _node: &Node, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let data = inputs.get(port::DATA).cloned().unwrap_or(Value::Null);
        Ok(NodeOutput::empty().with(port::DATA, data))
    }
}

/// Emits the `results` array the engine assembled from its `in_i` arrivals.
pub struct SyncNode;

#[async_trait]
impl ExecutableNode for SyncNode {
    async fn execute(&self, _node: &Node, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let results = inputs.get(port::RESULTS).cloned().unwrap_or_else(|| json!([]));
        Ok(NodeOutput::empty().with(port::RESULTS, results))
    }
}

/// Iteration cap applied when a loop's config carries no `maxIterations`.
pub const DEFAULT_MAX_ITERATIONS: u64 = 10_000;

/// Normalises the loop collection into an `items` array. Iteration itself is
/// driven by the engine.
pub struct ForLoopNode;

impl ForLoopNode {
    /// Arrays iterate as-is, a number `n` iterates `0..n`, an object iterates
    /// its values, a string its characters and null nothing. Collections
    /// longer than `limit` are rejected before any item is built.
    pub fn items(collection: &Value, limit: u64) -> Result<Vec<Value>, NodeError> {
        let len = match collection {
            Value::Null => 0,
            Value::Array(items) => items.len() as u64,
            Value::Object(map) => map.len() as u64,
            Value::String(s) => s.chars().count() as u64,
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| NodeError::failed(format!("cannot iterate over {n}")))?,
            Value::Bool(_) => return Err(NodeError::failed("cannot iterate over a boolean")),
        };
        if len > limit {
            return Err(NodeError::failed(format!(
                "collection has {len} items, above maxIterations {limit}"
            )));
        }
        Ok(match collection {
            Value::Array(items) => items.clone(),
            Value::Object(map) => map.values().cloned().collect(),
            Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
            Value::Number(_) => (0..len).map(Value::from).collect(),
            Value::Null | Value::Bool(_) => Vec::new(),
        })
    }
}

#[async_trait]
impl ExecutableNode for ForLoopNode {
    async fn execute(&self, node: &Node, inputs: NodeInputs, _ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let collection = inputs.get(loop_port::COLLECTION).cloned().unwrap_or(Value::Null);
        let limit = node.config_u64("maxIterations").unwrap_or(DEFAULT_MAX_ITERATIONS);
        let items = Self::items(&collection, limit)?;
        Ok(NodeOutput::empty().with("items", Value::Array(items)))
    }
}

/// Evaluates `expression` with the node's inputs bound as `input`, then fires
/// `true` or `false`.
pub struct ConditionNode;

#[async_trait]
impl ExecutableNode for ConditionNode {
    async fn execute(&self, node: &Node, inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let expr = node
            .config_str("expression")
            .ok_or_else(|| NodeError::Configuration(format!("condition '{}' has no expression", node.id)))?;
        let value = ctx
            .evaluate_with_input(expr, &inputs)
            .map_err(|e| NodeError::failed(format!("condition '{}': {e}", node.id)))?;
        let result = truthy(&value);
        Ok(NodeOutput::empty()
            .with("result", Value::Bool(result))
            .firing([if result { "true" } else { "false" }]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Graph;
    use serde_json::Map;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(&Graph::new("t", vec![], vec![]), Map::new()).unwrap()
    }

    fn node(node_type: &str, config: Value) -> Node {
        serde_json::from_value(json!({ "id": "n", "type": node_type, "config": config })).unwrap()
    }

    #[tokio::test]
    async fn start_emits_run_input() {
        let ctx = ctx();
        ctx.set_run_input(json!({ "topic": "rust" }));
        let out = StartNode.execute(&node("start", json!({})), Map::new(), &ctx).await.unwrap();
        assert_eq!(out.values["data"], json!({ "topic": "rust" }));
        assert!(out.fire.is_none());
    }

    #[tokio::test]
    async fn end_uses_output_key() {
        let mut inputs = Map::new();
        inputs.insert("value".into(), json!(42));
        let out = EndNode
            .execute(&node("end", json!({ "outputKey": "answer", "success": false })), inputs, &ctx())
            .await
            .unwrap();
        assert_eq!(Value::Object(out.values), json!({ "answer": 42, "success": false }));
    }

    #[tokio::test]
    async fn condition_fires_one_side() {
        let mut inputs = Map::new();
        inputs.insert("value".into(), json!(5));
        let out = ConditionNode
            .execute(&node("condition", json!({ "expression": "input.value > 3" })), inputs, &ctx())
            .await
            .unwrap();
        assert_eq!(out.fire, Some(vec!["true".to_string()]));
        assert_eq!(out.values["result"], json!(true));
    }

    #[test]
    fn loop_collections_normalise() {
        let limit = DEFAULT_MAX_ITERATIONS;
        assert_eq!(ForLoopNode::items(&json!(3), limit).unwrap(), vec![json!(0), json!(1), json!(2)]);
        assert_eq!(ForLoopNode::items(&json!(["a"]), limit).unwrap(), vec![json!("a")]);
        assert!(ForLoopNode::items(&Value::Null, limit).unwrap().is_empty());
        assert!(ForLoopNode::items(&json!(true), limit).is_err());
    }

    #[tokio::test]
    async fn huge_count_fails_before_allocating() {
        let mut inputs = Map::new();
        inputs.insert("collection".into(), json!(100_000_000_000u64));
        let err = ForLoopNode
            .execute(&node("for_loop", json!({ "maxIterations": 10 })), inputs.clone(), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("above maxIterations 10"), "{err}");

        let err = ForLoopNode.execute(&node("for_loop", json!({})), inputs, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("above maxIterations 10000"), "{err}");
    }

    #[tokio::test]
    async fn loop_respects_max_iterations() {
        let mut inputs = Map::new();
        inputs.insert("collection".into(), json!([1, 2, 3]));
        let result = ForLoopNode
            .execute(&node("for_loop", json!({ "maxIterations": 2 })), inputs, &ctx())
            .await;
        assert!(result.is_err());
    }
}
