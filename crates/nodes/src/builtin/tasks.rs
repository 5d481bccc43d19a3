//! Task node executors: variables, logging, agents and events.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::port;
use crate::context::ExecutionContext;
use crate::error::ContextError;
use crate::expression::to_display_string;
use crate::models::Node;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::traits::{ExecutableNode, NodeInputs, NodeOutput, TaskOptions};
use crate::NodeError;

fn required<'a>(node: &'a Node, key: &str) -> Result<&'a str, NodeError> {
    node.config_str(key)
        .ok_or_else(|| NodeError::Configuration(format!("node '{}' is missing '{key}'", node.id)))
}

/// A connected input wins; otherwise the config field is resolved as an
/// expression or template.
fn input_or_config(node: &Node, inputs: &NodeInputs, key: &str, ctx: &ExecutionContext) -> Result<Value, NodeError> {
    match inputs.get(key) {
        Some(v) if !v.is_null() => Ok(v.clone()),
        _ => match node.config.get(key) {
            Some(raw) => ctx
                .resolve_value(raw)
                .map_err(|e| NodeError::failed(format!("node '{}' field '{key}': {e}", node.id))),
            None => Ok(Value::Null),
        },
    }
}

fn context_error(err: ContextError) -> NodeError {
    match err {
        ContextError::Cancelled => NodeError::Cancelled,
        ContextError::Configuration(msg) => NodeError::Configuration(msg),
        other => NodeError::Context(other),
    }
}

/// Writes `value` into the run variable `name`.
pub struct SetVariableNode;

#[async_trait]
impl ExecutableNode for SetVariableNode {
    async fn execute(&self, node: &Node, inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let name = required(node, "name")?;
        let value = input_or_config(node, &inputs, port::VALUE, ctx)?;
        ctx.set_variable(name, value.clone());
        Ok(NodeOutput::empty().with(port::VALUE, value))
    }
}

/// Renders `message` and writes it to the log.
pub struct LogNode;

#[async_trait]
impl ExecutableNode for LogNode {
    async fn execute(&self, node: &Node, _inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let message = ctx.render_template(required(node, "message")?);
        match node.config_str("level").unwrap_or("info") {
            "debug" => debug!(node_id = %node.id, "{message}"),
            "warn" => warn!(node_id = %node.id, "{message}"),
            _ => info!(node_id = %node.id, "{message}"),
        }
        Ok(NodeOutput::empty().with("message", Value::String(message)))
    }
}

/// Requests an agent for `role`, runs the rendered `prompt` on it through the
/// run's retry policy, and releases the agent whatever the outcome.
pub struct AgentTaskNode;

#[async_trait]
impl ExecutableNode for AgentTaskNode {
    async fn execute(&self, node: &Node, inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let role = required(node, "role")?;
        let mut prompt = ctx.render_template(required(node, "prompt")?);
        if let Some(extra) = inputs.get("context").filter(|v| !v.is_null()) {
            prompt.push_str("\n\n");
            prompt.push_str(&to_display_string(extra));
        }

        let options = TaskOptions {
            timeout: node.config_u64("timeout").map(Duration::from_secs),
            extra: node.config.clone(),
        };

        let agent_id = ctx.request_agent(role).await.map_err(context_error)?;

        let mut policy = if node.config_bool("retry") == Some(false) {
            RetryPolicy::new(RetryConfig { max_attempts: 1, ..ctx.retry_config().clone() })
        } else {
            ctx.retry_policy()
        };

        let (agent_ref, prompt_ref, options_ref) = (agent_id.as_str(), prompt.as_str(), &options);
        let outcome = policy
            .run(&node.id, move |_attempt| {
                let (agent_id, prompt, options) = (agent_ref, prompt_ref, options_ref);
                async move {
                    if ctx.should_stop() {
                        return Err("cancelled".to_string());
                    }
                    match ctx.run_agent_task(agent_id, prompt, options).await {
                        Ok(result) if result.success => Ok(result.output),
                        Ok(result) => Err(result.output),
                        Err(e) => Err(e.to_string()),
                    }
                }
            })
            .await;

        if let Err(e) = ctx.release_agent(&agent_id).await {
            warn!(node_id = %node.id, agent_id = %agent_id, error = %e, "agent release failed");
        }

        if ctx.should_stop() {
            return Err(NodeError::Cancelled);
        }

        let output = outcome.map_err(|e| NodeError::failed(format!("agent task '{}' failed: {e}", node.id)))?;
        Ok(NodeOutput::empty()
            .with(port::OUTPUT, Value::String(output))
            .with("success", Value::Bool(true))
            .with("agentId", Value::String(agent_id)))
    }
}

/// Emits `eventType` with a payload taken from the `payload` input or config.
pub struct EmitEventNode;

#[async_trait]
impl ExecutableNode for EmitEventNode {
    async fn execute(&self, node: &Node, inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let event_type = ctx.render_template(required(node, "eventType")?);
        let payload = input_or_config(node, &inputs, "payload", ctx)?;
        ctx.emit_event(&event_type, payload.clone()).await.map_err(context_error)?;
        Ok(NodeOutput::empty().with("payload", payload))
    }
}

/// Blocks until `eventType` arrives, the optional `timeoutMs` passes, or the
/// run stops.
pub struct WaitEventNode;

#[async_trait]
impl ExecutableNode for WaitEventNode {
    async fn execute(&self, node: &Node, _inputs: NodeInputs, ctx: &ExecutionContext) -> Result<NodeOutput, NodeError> {
        let event_type = ctx.render_template(required(node, "eventType")?);
        let value = ctx
            .wait_for_event(&event_type, node.config_u64("timeoutMs"))
            .await
            .map_err(context_error)?;
        Ok(NodeOutput::empty().with(port::VALUE, value))
    }
}
