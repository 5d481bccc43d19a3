//! Per-run execution context.
//!
//! Holds the run's variables, parameters and cached node outputs behind a
//! single lock, rebuilds the expression scope after every mutation, and
//! fronts the collaborator handlers bound by the owning workflow layer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ContextError;
use crate::expression::{self, ExpressionError};
use crate::models::Graph;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::template;
use crate::traits::{AgentAllocator, EventBus, TaskOptions, TaskResult};

#[derive(Debug, Default)]
struct ContextState {
    variables: Map<String, Value>,
    parameters: Map<String, Value>,
    outputs: BTreeMap<String, Map<String, Value>>,
    /// Evaluation scope; rebuilt whenever any of the above changes.
    scope: Arc<Map<String, Value>>,
}

impl ContextState {
    fn rebuild_scope(&mut self) {
        let mut scope = Map::new();
        for (node_id, outputs) in &self.outputs {
            scope.insert(node_id.clone(), Value::Object(outputs.clone()));
        }
        for (name, value) in &self.variables {
            scope.insert(name.clone(), value.clone());
        }
        scope.insert("parameters".into(), Value::Object(self.parameters.clone()));
        self.scope = Arc::new(scope);
    }
}

/// Shared mutable environment for one run.
pub struct ExecutionContext {
    graph_name: String,
    state: RwLock<ContextState>,
    run_input: RwLock<Value>,
    agents: Option<Arc<dyn AgentAllocator>>,
    events: Option<Arc<dyn EventBus>>,
    /// Agent ids handed out by `request_agent` and not yet released.
    allocated: Mutex<BTreeSet<String>>,
    stop: watch::Sender<bool>,
    retry: RetryConfig,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("graph_name", &self.graph_name)
            .field("agents_bound", &self.agents.is_some())
            .field("events_bound", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// Seed variables and parameters from `graph`'s declarations, then apply
    /// caller-supplied parameter values.
    ///
    /// # Errors
    /// [`ContextError::MissingParameter`] if a required parameter is still
    /// unset after the merge.
    pub fn new(graph: &Graph, dispatch_params: Map<String, Value>) -> Result<Self, ContextError> {
        let mut state = ContextState::default();

        for var in &graph.variables {
            state.variables.insert(var.name.clone(), var.default.clone());
        }
        for param in &graph.parameters {
            if let Some(default) = &param.default {
                state.parameters.insert(param.name.clone(), default.clone());
            }
        }
        for (name, value) in dispatch_params {
            state.parameters.insert(name, value);
        }
        for param in graph.parameters.iter().filter(|p| p.required) {
            if state.parameters.get(&param.name).map_or(true, Value::is_null) {
                return Err(ContextError::MissingParameter(param.name.clone()));
            }
        }

        state.rebuild_scope();
        let (stop, _) = watch::channel(false);

        Ok(Self {
            graph_name: graph.name.clone(),
            state: RwLock::new(state),
            run_input: RwLock::new(Value::Null),
            agents: None,
            events: None,
            allocated: Mutex::new(BTreeSet::new()),
            stop,
            retry: RetryConfig::default(),
        })
    }

    pub fn graph_name(&self) -> &str {
        &self.graph_name
    }

    // -- binding -------------------------------------------------------------

    /// Bind the agent allocator. Must happen before the run starts.
    pub fn bind_agents(&mut self, allocator: Arc<dyn AgentAllocator>) {
        self.agents = Some(allocator);
    }

    /// Bind the event bus. Must happen before the run starts.
    pub fn bind_events(&mut self, bus: Arc<dyn EventBus>) {
        self.events = Some(bus);
    }

    /// Builder: retry configuration used by executors wrapping external calls.
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.clone())
    }

    // -- state ---------------------------------------------------------------

    fn read(&self) -> RwLockReadGuard<'_, ContextState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ContextState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocated(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.allocated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_run_input(&self, input: Value) {
        *self.run_input.write().unwrap_or_else(PoisonError::into_inner) = input;
    }

    /// The payload passed to `execute`, emitted by the start node.
    pub fn run_input(&self) -> Value {
        self.run_input.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.read().variables.get(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        debug!(variable = %name, "set variable");
        let mut state = self.write();
        state.variables.insert(name, value);
        state.rebuild_scope();
    }

    pub fn parameter(&self, name: &str) -> Option<Value> {
        self.read().parameters.get(name).cloned()
    }

    pub fn parameters(&self) -> Map<String, Value> {
        self.read().parameters.clone()
    }

    /// Snapshot of every variable, for checkpointing.
    pub fn get_all_variables(&self) -> Map<String, Value> {
        self.read().variables.clone()
    }

    /// Replace all variables with a checkpointed snapshot.
    pub fn restore_variables(&self, variables: Map<String, Value>) {
        let mut state = self.write();
        state.variables = variables;
        state.rebuild_scope();
    }

    /// Cache `outputs` as the latest outputs of `node_id`.
    pub fn record_outputs(&self, node_id: &str, outputs: Map<String, Value>) {
        let mut state = self.write();
        state.outputs.insert(node_id.to_owned(), outputs);
        state.rebuild_scope();
    }

    /// Drop `node_ids`' cached outputs in one update.
    pub fn clear_outputs<'a>(&self, node_ids: impl IntoIterator<Item = &'a str>) {
        let mut state = self.write();
        let mut changed = false;
        for id in node_ids {
            changed |= state.outputs.remove(id).is_some();
        }
        if changed {
            state.rebuild_scope();
        }
    }

    pub fn node_outputs(&self, node_id: &str) -> Option<Map<String, Value>> {
        self.read().outputs.get(node_id).cloned()
    }

    /// One cached output value, if the node has produced it.
    pub fn output_value(&self, node_id: &str, port: &str) -> Option<Value> {
        self.read().outputs.get(node_id).and_then(|o| o.get(port)).cloned()
    }

    /// The current evaluation scope.
    pub fn scope(&self) -> Arc<Map<String, Value>> {
        Arc::clone(&self.read().scope)
    }

    // -- expressions ---------------------------------------------------------

    pub fn evaluate(&self, expr: &str) -> Result<Value, ExpressionError> {
        let scope = self.scope();
        expression::evaluate(expr, &scope)
    }

    /// Evaluate with a node's resolved inputs visible as `input`.
    pub fn evaluate_with_input(&self, expr: &str, input: &Map<String, Value>) -> Result<Value, ExpressionError> {
        let mut scope = (*self.scope()).clone();
        scope.insert("input".into(), Value::Object(input.clone()));
        expression::evaluate(expr, &scope)
    }

    pub fn render_template(&self, src: &str) -> String {
        let scope = self.scope();
        template::render(src, &scope)
    }

    /// Resolve a config value: a string that is a single `{{ expr }}` yields
    /// the typed result, other strings with placeholders are rendered, and
    /// everything else is returned as-is.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) => {
                if let Some(expr) = template::sole_expression(s) {
                    self.evaluate(expr)
                } else if template::has_placeholders(s) {
                    Ok(Value::String(self.render_template(s)))
                } else {
                    Ok(value.clone())
                }
            }
            other => Ok(other.clone()),
        }
    }

    // -- collaborators -------------------------------------------------------

    fn agents(&self) -> Result<&Arc<dyn AgentAllocator>, ContextError> {
        self.agents
            .as_ref()
            .ok_or_else(|| ContextError::Configuration("agent allocator handler is not bound".into()))
    }

    fn events(&self) -> Result<&Arc<dyn EventBus>, ContextError> {
        self.events
            .as_ref()
            .ok_or_else(|| ContextError::Configuration("event bus handler is not bound".into()))
    }

    pub async fn request_agent(&self, role_id: &str) -> Result<String, ContextError> {
        let agents = self.agents()?;
        let id = agents.request(role_id).await.map_err(ContextError::Handler)?;
        self.allocated().insert(id.clone());
        info!(agent_id = %id, role = role_id, "agent allocated");
        Ok(id)
    }

    /// Release `agent_id`. Ids that are not currently tracked (already
    /// released) are ignored.
    pub async fn release_agent(&self, agent_id: &str) -> Result<(), ContextError> {
        let agents = self.agents()?;
        if !self.allocated().remove(agent_id) {
            return Ok(());
        }
        agents.release(agent_id).await.map_err(ContextError::Handler)?;
        info!(agent_id, "agent released");
        Ok(())
    }

    /// Force-release every agent still tracked. Returns how many were released.
    pub async fn release_all_agents(&self) -> usize {
        let ids: Vec<String> = std::mem::take(&mut *self.allocated()).into_iter().collect();
        let Some(agents) = self.agents.as_ref() else {
            return 0;
        };
        let mut released = 0;
        for id in ids {
            match agents.release(&id).await {
                Ok(()) => released += 1,
                Err(e) => warn!(agent_id = %id, error = %e, "failed to release agent"),
            }
        }
        if released > 0 {
            info!(released, "force-released outstanding agents");
        }
        released
    }

    /// Agent ids currently allocated through this context.
    pub fn allocated_agents(&self) -> Vec<String> {
        self.allocated().iter().cloned().collect()
    }

    pub async fn run_agent_task(
        &self,
        agent_id: &str,
        prompt: &str,
        options: &TaskOptions,
    ) -> Result<TaskResult, ContextError> {
        let agents = self.agents()?;
        agents
            .run_task(agent_id, prompt, options)
            .await
            .map_err(ContextError::Handler)
    }

    pub async fn emit_event(&self, event_type: &str, payload: Value) -> Result<(), ContextError> {
        self.events()?.emit(event_type, payload).await.map_err(ContextError::Handler)
    }

    /// Wait for an event, giving up early if the run is asked to stop.
    pub async fn wait_for_event(&self, event_type: &str, timeout_ms: Option<u64>) -> Result<Value, ContextError> {
        let events = self.events()?;
        let timeout = timeout_ms.map(Duration::from_millis);
        tokio::select! {
            result = events.wait(event_type, timeout) => result.map_err(ContextError::Handler),
            _ = self.stopped() => Err(ContextError::Cancelled),
        }
    }

    // -- cancellation --------------------------------------------------------

    /// Cooperative cancellation flag polled by long-running handlers.
    pub fn should_stop(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Completes once [`request_stop`](Self::request_stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        // The sender lives as long as `self`, so this only errs if dropped.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ParameterDecl, VariableDecl};
    use async_trait::async_trait;
    use serde_json::json;

    fn graph() -> Graph {
        let mut g = Graph::new("ctx", vec![], vec![]);
        g.variables = vec![
            VariableDecl { name: "name".into(), default: json!("Ann") },
            VariableDecl { name: "items".into(), default: json!([1, 2, 3]) },
        ];
        g.parameters = vec![
            ParameterDecl { name: "mode".into(), description: String::new(), default: Some(json!("slow")), required: false },
            ParameterDecl { name: "target".into(), description: String::new(), default: None, required: true },
        ];
        g
    }

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn missing_required_parameter_fails() {
        let err = ExecutionContext::new(&graph(), Map::new()).unwrap_err();
        assert!(matches!(err, ContextError::MissingParameter(p) if p == "target"));
    }

    #[test]
    fn dispatch_values_override_defaults() {
        let ctx = ExecutionContext::new(&graph(), params(json!({ "target": "x", "mode": "fast" }))).unwrap();
        assert_eq!(ctx.parameter("mode"), Some(json!("fast")));
        assert_eq!(ctx.evaluate("parameters.target").unwrap(), json!("x"));
    }

    #[test]
    fn scope_tracks_mutations() {
        let ctx = ExecutionContext::new(&graph(), params(json!({ "target": "x" }))).unwrap();
        assert_eq!(ctx.render_template("Hello {{ name }}, {{ items.length }} items"), "Hello Ann, 3 items");

        ctx.set_variable("name", json!("Bob"));
        ctx.record_outputs("fetch", params(json!({ "status": 200 })));
        assert_eq!(ctx.evaluate("name + ':' + fetch.status").unwrap(), json!("Bob:200"));

        ctx.clear_outputs(["fetch"]);
        assert!(ctx.evaluate("fetch.status").is_err());
    }

    #[test]
    fn variables_snapshot_and_restore() {
        let ctx = ExecutionContext::new(&graph(), params(json!({ "target": "x" }))).unwrap();
        let snapshot = ctx.get_all_variables();
        ctx.set_variable("name", json!("Changed"));
        ctx.restore_variables(snapshot);
        assert_eq!(ctx.variable("name"), Some(json!("Ann")));
    }

    #[test]
    fn resolve_value_keeps_types_for_sole_expressions() {
        let ctx = ExecutionContext::new(&graph(), params(json!({ "target": "x" }))).unwrap();
        assert_eq!(ctx.resolve_value(&json!("{{ items }}")).unwrap(), json!([1, 2, 3]));
        assert_eq!(ctx.resolve_value(&json!("n={{ items.length }}")).unwrap(), json!("n=3"));
        assert_eq!(ctx.resolve_value(&json!(7)).unwrap(), json!(7));
    }

    #[tokio::test]
    async fn unbound_handlers_are_configuration_errors() {
        let ctx = ExecutionContext::new(&graph(), params(json!({ "target": "x" }))).unwrap();
        assert!(matches!(ctx.request_agent("dev").await, Err(ContextError::Configuration(_))));
        assert!(matches!(ctx.emit_event("e", json!(1)).await, Err(ContextError::Configuration(_))));
        assert!(matches!(ctx.wait_for_event("e", Some(1)).await, Err(ContextError::Configuration(_))));
    }

    struct CountingAllocator {
        released: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentAllocator for CountingAllocator {
        async fn request(&self, role_id: &str) -> Result<String, String> {
            Ok(format!("{role_id}-1"))
        }
        async fn release(&self, agent_id: &str) -> Result<(), String> {
            self.released.lock().unwrap().push(agent_id.to_owned());
            Ok(())
        }
        async fn run_task(&self, _: &str, prompt: &str, _: &TaskOptions) -> Result<TaskResult, String> {
            Ok(TaskResult { success: true, output: prompt.to_owned() })
        }
    }

    #[tokio::test]
    async fn agents_are_released_exactly_once() {
        let allocator = Arc::new(CountingAllocator { released: Mutex::new(Vec::new()) });
        let mut ctx = ExecutionContext::new(&graph(), params(json!({ "target": "x" }))).unwrap();
        ctx.bind_agents(allocator.clone());

        let id = ctx.request_agent("dev").await.unwrap();
        assert_eq!(ctx.allocated_agents(), vec![id.clone()]);
        ctx.release_agent(&id).await.unwrap();
        ctx.release_agent(&id).await.unwrap();
        assert_eq!(ctx.release_all_agents().await, 0);
        assert_eq!(allocator.released.lock().unwrap().as_slice(), &[id]);
    }

    struct NeverBus;

    #[async_trait]
    impl EventBus for NeverBus {
        async fn emit(&self, _: &str, _: Value) -> Result<(), String> {
            Ok(())
        }
        async fn wait(&self, _: &str, _: Option<Duration>) -> Result<Value, String> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn wait_for_event_observes_stop() {
        let mut ctx = ExecutionContext::new(&graph(), params(json!({ "target": "x" }))).unwrap();
        ctx.bind_events(Arc::new(NeverBus));
        let ctx = Arc::new(ctx);

        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.wait_for_event("never", None).await })
        };
        tokio::task::yield_now().await;
        assert!(!ctx.should_stop());
        ctx.request_stop();
        assert!(ctx.should_stop());
        assert!(matches!(waiter.await.unwrap(), Err(ContextError::Cancelled)));
    }
}
