//! Workflow execution engine.
//!
//! `WorkflowExecutor` is a trigger-propagation interpreter rather than a
//! topological walk: branch and loop firing patterns are only known at run
//! time, and a node inside a loop body runs once per iteration.
//!
//! 1. Validates the graph; an invalid graph is never dispatched.
//! 2. Restores from the configured checkpoint when one exists.
//! 3. Seeds the ready queue with the start node (or with the activations a
//!    restored state implies) and runs a single scheduler loop that owns all
//!    scheduling state. Ready nodes are spawned into a `JoinSet` so parallel
//!    branches run concurrently; their completions are applied one at a time.
//! 4. Persists a checkpoint after every node completes or fails, and removes
//!    it once the run succeeds.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use nodes::builtin::{self, loop_port, port};
use nodes::retry::{RetryConfig, RetryOverrides};
use nodes::{
    ExecutionContext, Graph, Node, NodeError, NodeExecutionState, NodeInputs, NodeOutput, NodeRegistry,
    NodeStatus, PortDirection,
};

use crate::checkpoint::{self, Checkpoint};
use crate::config::{EndPolicy, ExecutorConfig, SyncFailurePolicy};
use crate::control::{ControlState, RunControl, RunStatus};
use crate::loops::{LoopIndex, LoopProgress};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The result of running a full workflow.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub run_id: Uuid,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// What the End node recorded: `{ [outputKey]: value, success }`.
    pub result: Option<Map<String, Value>>,
}

/// Handed to the debug callback after every node completion in debug mode.
#[derive(Debug, Clone)]
pub struct DebugEvent {
    pub node_id: String,
    pub outputs: Map<String, Value>,
    pub state: NodeExecutionState,
}

pub type DebugCallback = Arc<dyn Fn(DebugEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Runs one graph once.
///
/// Control methods (`pause`, `resume`, `cancel`, `step`) take `&self`, so
/// share the executor behind an `Arc` and call them while `execute` runs.
pub struct WorkflowExecutor {
    graph: Arc<Graph>,
    registry: Arc<NodeRegistry>,
    context: Arc<ExecutionContext>,
    config: ExecutorConfig,
    loops: LoopIndex,
    control: RunControl,
    state: Mutex<BTreeMap<String, NodeExecutionState>>,
    restored: AtomicBool,
    /// Loop progress read from a checkpoint, taken by the scheduler on seed.
    resumed_loops: Mutex<BTreeMap<String, LoopProgress>>,
    debug_callback: Mutex<Option<DebugCallback>>,
}

impl WorkflowExecutor {
    /// Create a new executor. Handlers must already be bound on `context`.
    pub fn new(
        graph: impl Into<Arc<Graph>>,
        registry: Arc<NodeRegistry>,
        context: ExecutionContext,
        config: ExecutorConfig,
    ) -> Self {
        let graph = graph.into();
        let context = if config.retry == RetryOverrides::default() {
            context
        } else {
            context.with_retry(RetryConfig::with_overrides(&config.retry))
        };
        let state = graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeExecutionState::pending(&n.id)))
            .collect();

        Self {
            loops: LoopIndex::build(&graph, &registry),
            control: RunControl::new(config.debug),
            graph,
            registry,
            context: Arc::new(context),
            config,
            state: Mutex::new(state),
            restored: AtomicBool::new(false),
            resumed_loops: Mutex::new(BTreeMap::new()),
            debug_callback: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    // -- control -------------------------------------------------------------

    /// Stop dispatching new nodes; in-flight nodes finish normally.
    pub fn pause(&self) -> bool {
        let paused = self.control.pause();
        if paused {
            info!("run paused");
        }
        paused
    }

    pub fn resume(&self) -> bool {
        let resumed = self.control.resume();
        if resumed {
            info!("run resumed");
        }
        resumed
    }

    /// Stop dispatch permanently. `execute` winds down in-flight nodes,
    /// releases outstanding agents and reports failure.
    pub fn cancel(&self) -> bool {
        let cancelled = self.control.cancel();
        if cancelled {
            warn!("run cancellation requested");
        }
        cancelled
    }

    /// In debug mode, allow the next ready node to dispatch.
    pub fn step(&self) {
        self.control.step();
    }

    pub fn set_debug(&self, debug: bool) {
        self.control.set_debug(debug);
    }

    pub fn set_debug_callback(&self, callback: impl Fn(DebugEvent) + Send + Sync + 'static) {
        *self.debug_callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn run_status(&self) -> RunStatus {
        self.control.status()
    }

    /// Snapshot of every node's execution state.
    pub fn execution_state(&self) -> BTreeMap<String, NodeExecutionState> {
        self.states().clone()
    }

    // -- state helpers -------------------------------------------------------

    fn states(&self) -> MutexGuard<'_, BTreeMap<String, NodeExecutionState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn node_state(&self, node_id: &str) -> Option<NodeExecutionState> {
        self.states().get(node_id).cloned()
    }

    fn update_state(&self, node_id: &str, f: impl FnOnce(&mut NodeExecutionState)) -> NodeExecutionState {
        let mut states = self.states();
        let state = states
            .entry(node_id.to_owned())
            .or_insert_with(|| NodeExecutionState::pending(node_id));
        f(state);
        state.clone()
    }

    fn emit_debug(&self, state: &NodeExecutionState) {
        if !self.control.is_debug() {
            return;
        }
        let callback = self.debug_callback.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(callback) = callback {
            callback(DebugEvent {
                node_id: state.node_id.clone(),
                outputs: state.outputs.clone(),
                state: state.clone(),
            });
        }
    }

    /// Node config `timeout` (seconds), else the type's default, else the
    /// executor-wide default.
    fn timeout_for(&self, node: &Node) -> Option<Duration> {
        node.config_u64("timeout")
            .map(Duration::from_secs)
            .or_else(|| self.registry.definition(&node.node_type).and_then(|d| d.default_timeout))
            .or_else(|| self.config.default_node_timeout())
    }

    // -- checkpoints ---------------------------------------------------------

    async fn save_checkpoint(&self, loops: &HashMap<String, LoopProgress>) {
        let Some(path) = &self.config.checkpoint_path else {
            return;
        };
        let snapshot = Checkpoint {
            graph_name: self.graph.name.clone(),
            variables: self.context.get_all_variables(),
            execution_state: self.execution_state(),
            loops: loops.iter().map(|(id, progress)| (id.clone(), progress.clone())).collect(),
            timestamp: Utc::now(),
        };
        if let Err(e) = checkpoint::save(path, &snapshot).await {
            warn!(path = %path.display(), error = %e, "failed to write checkpoint");
        }
    }

    /// Load a checkpoint into this executor before `execute` runs.
    ///
    /// Restores variables, execution state and the progress of loops that
    /// were mid-collection, and re-seeds the cached outputs of completed
    /// nodes. Returns `Ok(false)` when there is no
    /// checkpoint at `path`.
    ///
    /// # Errors
    /// - [`EngineError::Checkpoint`] if the file is corrupt or belongs to
    ///   another graph.
    /// - [`EngineError::Configuration`] if the run already started.
    pub async fn restore_from_checkpoint(&self, path: &Path) -> Result<bool, EngineError> {
        if self.control.status() != RunStatus::Idle {
            return Err(EngineError::Configuration("cannot restore a run that already started".into()));
        }
        self.load_checkpoint(path).await
    }

    async fn load_checkpoint(&self, path: &Path) -> Result<bool, EngineError> {
        let Some(snapshot) = checkpoint::load(path).await? else {
            return Ok(false);
        };
        if snapshot.graph_name != self.graph.name {
            return Err(EngineError::Checkpoint(format!(
                "checkpoint belongs to graph '{}', not '{}'",
                snapshot.graph_name, self.graph.name
            )));
        }

        self.context.restore_variables(snapshot.variables);
        let mut completed = 0usize;
        {
            let mut states = self.states();
            for (node_id, state) in snapshot.execution_state {
                if !states.contains_key(&node_id) {
                    warn!(node_id = %node_id, "checkpoint mentions a node the graph no longer has");
                    continue;
                }
                if state.status == NodeStatus::Completed {
                    self.context.record_outputs(&node_id, state.outputs.clone());
                    completed += 1;
                }
                states.insert(node_id, state);
            }
        }
        *self.resumed_loops.lock().unwrap_or_else(PoisonError::into_inner) = snapshot.loops;
        self.restored.store(true, Ordering::SeqCst);
        info!(path = %path.display(), completed, taken_at = %snapshot.timestamp, "restored from checkpoint");
        Ok(true)
    }

    // -- execution -----------------------------------------------------------

    /// Run the graph to completion.
    ///
    /// Never fails: run-level problems are reported through
    /// [`ExecutionOutcome::error`] with `success == false`.
    #[instrument(skip(self, initial_input), fields(graph = %self.graph.name))]
    pub async fn execute(&self, initial_input: Value) -> ExecutionOutcome {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let outcome = |success: bool, error: Option<String>, result: Option<Map<String, Value>>| {
            ExecutionOutcome {
                run_id,
                success,
                error,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                result,
            }
        };

        if !self.control.start() {
            let reason = match self.control.status() {
                RunStatus::Cancelled => EngineError::Cancelled.to_string(),
                status => format!("executor cannot start from status {status:?}"),
            };
            return outcome(false, Some(reason), None);
        }

        let report = self.registry.validate(&self.graph);
        for warning in &report.warnings {
            warn!(warning = %warning, "graph validation warning");
        }
        if let Err(e) = report.into_result() {
            let err = EngineError::from(e);
            error!(error = %err, "graph failed validation, nothing dispatched");
            self.control.finish(RunStatus::Failed);
            return outcome(false, Some(err.to_string()), None);
        }

        if let Some(path) = &self.config.checkpoint_path {
            if !self.restored.load(Ordering::SeqCst) {
                if let Err(e) = self.load_checkpoint(path).await {
                    warn!(error = %e, "ignoring unusable checkpoint, starting fresh");
                }
            }
        }

        self.context.set_run_input(initial_input);
        info!(
            run_id = %run_id,
            nodes = self.graph.nodes.len(),
            restored = self.restored.load(Ordering::SeqCst),
            "run started"
        );

        let mut scheduler = Scheduler::new(self);
        scheduler.seed();
        scheduler.drive().await;
        let (failure, end_result) = scheduler.finalize().await;

        let cancelled = self.control.status() == RunStatus::Cancelled;
        let end_ok = end_result
            .as_ref()
            .map_or(true, |(_, r)| r.get("success").and_then(Value::as_bool).unwrap_or(true));

        let error = if cancelled {
            Some(EngineError::Cancelled.to_string())
        } else if let Some(failure) = failure {
            Some(failure.to_string())
        } else if !end_ok {
            end_result.as_ref().map(|(id, _)| format!("end node '{id}' reported failure"))
        } else {
            None
        };
        let success = error.is_none();

        self.control.finish(if success { RunStatus::Completed } else { RunStatus::Failed });
        if success {
            if let Some(path) = &self.config.checkpoint_path {
                if let Err(e) = checkpoint::remove(path).await {
                    warn!(error = %e, "failed to remove checkpoint");
                }
            }
        }

        let result = outcome(success, error, end_result.map(|(_, r)| r));
        if result.success {
            info!(run_id = %run_id, duration_ms = result.duration_ms, "run succeeded");
        } else {
            error!(
                run_id = %run_id,
                duration_ms = result.duration_ms,
                error = result.error.as_deref().unwrap_or_default(),
                "run failed"
            );
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Node invocation (runs inside spawned tasks)
// ---------------------------------------------------------------------------

/// Data inputs for `node`: each non-trigger input pulls the cached output of
/// the node connected to it; unconnected inputs fall back to the config field
/// of the same name.
fn resolve_inputs(
    graph: &Graph,
    registry: &NodeRegistry,
    ctx: &ExecutionContext,
    node: &Node,
) -> Result<NodeInputs, EngineError> {
    let mut inputs = NodeInputs::new();
    for input in registry.ports(node, PortDirection::Input) {
        if input.data_type.is_trigger() {
            continue;
        }
        let sources: Vec<Value> = graph
            .incoming(&node.id, &input.id)
            .map(|c| ctx.output_value(&c.source.node, &c.source.port).unwrap_or(Value::Null))
            .collect();

        let value = match sources.len() {
            0 => match node.config.get(&input.id) {
                Some(raw) => ctx.resolve_value(raw).map_err(|e| EngineError::NodeExecution {
                    node_id: node.id.clone(),
                    message: format!("input '{}': {e}", input.id),
                })?,
                None => continue,
            },
            1 if !input.allow_multiple => sources.into_iter().next().unwrap_or(Value::Null),
            _ => Value::Array(sources),
        };
        inputs.insert(input.id, value);
    }
    Ok(inputs)
}

async fn run_node(
    graph: Arc<Graph>,
    registry: Arc<NodeRegistry>,
    ctx: Arc<ExecutionContext>,
    node: Node,
    preset: Option<NodeInputs>,
    timeout: Option<Duration>,
) -> Result<NodeOutput, EngineError> {
    let executor = registry
        .executor(&node.node_type)
        .ok_or_else(|| EngineError::Configuration(format!("no executor registered for '{}'", node.node_type)))?;
    let inputs = match preset {
        Some(inputs) => inputs,
        None => resolve_inputs(&graph, &registry, &ctx, &node)?,
    };

    let work = executor.execute(&node, inputs, &ctx);
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| EngineError::Timeout {
            node_id: node.id.clone(),
            secs: limit.as_secs(),
        })?,
        None => work.await,
    };

    result.map_err(|e| match e {
        NodeError::Cancelled => EngineError::Cancelled,
        other => EngineError::NodeExecution { node_id: node.id.clone(), message: other.to_string() },
    })
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// A trigger arriving at `node_id`'s input `port`, carrying the source
/// node's outputs.
#[derive(Debug, Clone)]
struct Activation {
    node_id: String,
    port: String,
    payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Plain,
    /// A for-loop's executor normalising its collection.
    LoopStart,
}

struct Completion {
    node_id: String,
    kind: TaskKind,
    result: Result<NodeOutput, EngineError>,
}

enum Wake {
    Joined(Option<Result<Completion, JoinError>>),
    Control,
}

/// Owns all scheduling state for one run. Only the scheduler mutates
/// execution state and the context's cached outputs.
struct Scheduler<'a> {
    exec: &'a WorkflowExecutor,
    control: watch::Receiver<ControlState>,
    ready: VecDeque<Activation>,
    in_flight: JoinSet<Completion>,
    /// Per-sync arrivals of the current generation, keyed by `in_i` index.
    syncs: HashMap<String, BTreeMap<usize, Value>>,
    loops: HashMap<String, LoopProgress>,
    end_result: Option<(String, Map<String, Value>)>,
    failure: Option<EngineError>,
}

impl<'a> Scheduler<'a> {
    fn new(exec: &'a WorkflowExecutor) -> Self {
        Self {
            control: exec.control.subscribe(),
            exec,
            ready: VecDeque::new(),
            in_flight: JoinSet::new(),
            syncs: HashMap::new(),
            loops: HashMap::new(),
            end_result: None,
            failure: None,
        }
    }

    /// Fill the ready queue: the start node for a fresh run, otherwise the
    /// activations implied by the restored state.
    fn seed(&mut self) {
        let exec = self.exec;
        let mut states = exec.execution_state();
        let is_done = |states: &BTreeMap<String, NodeExecutionState>, id: &str| {
            states.get(id).is_some_and(|s| s.status == NodeStatus::Completed)
        };

        let mut resumed =
            std::mem::take(&mut *exec.resumed_loops.lock().unwrap_or_else(PoisonError::into_inner));
        resumed.retain(|id, progress| {
            let iterating = exec.graph.node(id).is_some_and(|n| n.node_type == builtin::FOR_LOOP)
                && states.contains_key(id)
                && !is_done(&states, id.as_str())
                && progress.index < progress.items.len();
            if !iterating {
                warn!(loop_id = %id, "dropping checkpointed progress of a loop that is not iterating");
            }
            iterating
        });

        // Unfinished loops without saved progress restart from their first
        // item, bodies included, and so does any loop nested in them.
        let mut restart: HashSet<String> = HashSet::new();
        for lp in exec.graph.nodes_of_type(builtin::FOR_LOOP) {
            if !is_done(&states, lp.id.as_str()) && !resumed.contains_key(&lp.id) {
                restart.insert(lp.id.clone());
                restart.extend(exec.loops.body(&lp.id).into_iter().flatten().cloned());
            }
        }
        resumed.retain(|id, _| !restart.contains(id));

        exec.context.clear_outputs(restart.iter().map(String::as_str));
        for (node_id, state) in states.iter_mut() {
            let stale = matches!(state.status, NodeStatus::Running | NodeStatus::Failed);
            if resumed.contains_key(node_id) {
                state.status = NodeStatus::Running;
                state.error = None;
                exec.update_state(node_id, |s| *s = state.clone());
            } else if stale || restart.contains(node_id) {
                let runs = state.run_count;
                *state = NodeExecutionState { run_count: runs, ..NodeExecutionState::pending(node_id.as_str()) };
                exec.update_state(node_id, |s| *s = state.clone());
            }
        }

        let mut completed: Vec<&NodeExecutionState> =
            states.values().filter(|s| s.status == NodeStatus::Completed).collect();
        if completed.is_empty() {
            for start in exec.graph.nodes_of_type(builtin::START) {
                self.ready.push_back(Activation { node_id: start.id.clone(), port: String::new(), payload: Value::Null });
            }
            return;
        }
        completed.sort_by_key(|s| s.completed_at);

        // Iterating loops pick up their current iteration: entry nodes that
        // have not run yet are triggered again.
        let mut queued: HashSet<(String, String)> = HashSet::new();
        for (loop_id, progress) in resumed {
            let Some(values) = progress.iteration_values() else { continue };
            exec.context.record_outputs(&loop_id, values.clone());
            exec.update_state(&loop_id, |s| s.outputs = values.clone());
            info!(
                loop_id = %loop_id,
                index = progress.index,
                results = progress.results.len(),
                "loop resumes mid-collection"
            );
            for conn in exec.graph.outgoing(&loop_id, loop_port::LOOP_BODY) {
                let target = conn.target.node.as_str();
                if is_done(&states, target) || !queued.insert((target.to_owned(), String::new())) {
                    continue;
                }
                self.ready.push_back(Activation {
                    node_id: conn.target.node.clone(),
                    port: conn.target.port.clone(),
                    payload: Value::Object(values.clone()),
                });
            }
            self.loops.insert(loop_id, progress);
        }

        for source in completed {
            let Some(node) = exec.graph.node(&source.node_id) else { continue };
            if node.node_type == builtin::END {
                self.record_end(node, &source.outputs);
            }
            // Body nodes replay only while every loop around them is still
            // iterating; finished loops are done with their bodies.
            if !exec.loops.enclosing(&node.id).all(|lp| self.loops.contains_key(lp)) {
                continue;
            }
            for fired in &source.fired_outputs {
                for conn in exec.graph.outgoing(&node.id, fired) {
                    let target = conn.target.node.as_str();
                    let is_sync = exec.graph.node(target).is_some_and(|n| n.node_type == builtin::SYNC);
                    let loop_control = conn.target.port == loop_port::LOOP_BACK || conn.target.port == loop_port::BREAK;
                    let iterating = self.loops.contains_key(target);
                    let key = (target.to_owned(), if loop_control { conn.target.port.clone() } else { String::new() });
                    if is_done(&states, target)
                        || loop_control != iterating
                        || (!is_sync && !queued.insert(key))
                    {
                        continue;
                    }
                    self.ready.push_back(Activation {
                        node_id: target.to_owned(),
                        port: conn.target.port.clone(),
                        payload: Value::Object(source.outputs.clone()),
                    });
                }
            }
        }
        info!(ready = self.ready.len(), iterating = self.loops.len(), "resuming from restored state");
    }

    async fn drive(&mut self) {
        loop {
            let status = self.control.borrow_and_update().status;
            if status == RunStatus::Cancelled {
                self.shutdown().await;
                return;
            }

            if self.failure.is_none() {
                self.dispatch_ready().await;
            }

            if self.in_flight.is_empty() {
                // Drained, or nothing more will be dispatched.
                if self.failure.is_some() || self.ready.is_empty() {
                    return;
                }
                // Blocked on pause or a debug step.
                if self.control.changed().await.is_err() {
                    return;
                }
                continue;
            }

            let wake = tokio::select! {
                joined = self.in_flight.join_next() => Wake::Joined(joined),
                _ = self.control.changed() => Wake::Control,
            };
            if let Wake::Joined(Some(joined)) = wake {
                self.on_joined(joined).await;
            }
        }
    }

    async fn dispatch_ready(&mut self) {
        while self.failure.is_none() && self.exec.control.may_dispatch() {
            let Some(activation) = self.ready.pop_front() else { break };
            if self.activate(activation).await {
                self.exec.control.consume_credit();
            }
        }
    }

    /// Handle one activation. Returns whether a node task was spawned.
    async fn activate(&mut self, activation: Activation) -> bool {
        let exec = self.exec;
        let Some(node) = exec.graph.node(&activation.node_id) else {
            warn!(node_id = %activation.node_id, "activation for unknown node dropped");
            return false;
        };

        match node.node_type.as_str() {
            builtin::SYNC => self.arrive_at_sync(node, activation),
            builtin::FOR_LOOP => match activation.port.as_str() {
                loop_port::LOOP_BACK => {
                    self.continue_loop(node).await;
                    false
                }
                loop_port::BREAK => {
                    debug!(loop_id = %node.id, "break received");
                    self.finish_loop(node).await;
                    false
                }
                _ => self.spawn(node, None, TaskKind::LoopStart),
            },
            _ => self.spawn(node, None, TaskKind::Plain),
        }
    }

    fn spawn(&mut self, node: &Node, preset: Option<NodeInputs>, kind: TaskKind) -> bool {
        let exec = self.exec;
        exec.update_state(&node.id, |s| {
            s.status = NodeStatus::Running;
            s.started_at = Some(Utc::now());
            s.completed_at = None;
            s.error = None;
            s.run_count += 1;
        });
        let timeout = exec.timeout_for(node);
        debug!(node_id = %node.id, node_type = %node.node_type, ?timeout, "dispatching node");

        let graph = Arc::clone(&exec.graph);
        let registry = Arc::clone(&exec.registry);
        let ctx = Arc::clone(&exec.context);
        let node = node.clone();
        self.in_flight.spawn(async move {
            let node_id = node.id.clone();
            let result = run_node(graph, registry, ctx, node, preset, timeout).await;
            Completion { node_id, kind, result }
        });
        true
    }

    fn arrive_at_sync(&mut self, node: &Node, activation: Activation) -> bool {
        let exec = self.exec;
        let Some(def) = exec.registry.definition(&node.node_type) else { return false };
        let (Some(variadic), Some(expected)) = (&def.variadic, def.variadic_count(node)) else {
            return false;
        };
        let Some(index) = variadic.index_of(&activation.port).filter(|i| *i < expected) else {
            warn!(node_id = %node.id, port = %activation.port, "trigger on unknown sync input ignored");
            return false;
        };

        let arrivals = self.syncs.entry(node.id.clone()).or_default();
        arrivals.insert(index, activation.payload);
        debug!(node_id = %node.id, arrived = arrivals.len(), expected, "sync arrival");
        if arrivals.len() < expected {
            return false;
        }

        // All inputs of this generation are in; the next arrival starts a new one.
        let arrivals = self.syncs.remove(&node.id).unwrap_or_default();
        let results: Vec<Value> = arrivals.into_values().collect();
        let mut inputs = NodeInputs::new();
        inputs.insert(port::RESULTS.into(), Value::Array(results));
        self.spawn(node, Some(inputs), TaskKind::Plain)
    }

    async fn on_joined(&mut self, joined: Result<Completion, JoinError>) {
        match joined {
            Ok(completion) => self.on_completion(completion).await,
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                error!(error = %e, "node task panicked");
                if self.failure.is_none() {
                    self.failure = Some(EngineError::Configuration(format!("node task panicked: {e}")));
                }
            }
        }
    }

    async fn on_completion(&mut self, completion: Completion) {
        let exec = self.exec;
        let Some(node) = exec.graph.node(&completion.node_id) else { return };
        match (completion.result, completion.kind) {
            (Err(err), _) => self.node_failed(node, err).await,
            (Ok(output), TaskKind::LoopStart) => self.begin_loop(node, output).await,
            (Ok(output), TaskKind::Plain) => self.node_completed(node, output).await,
        }
    }

    /// Trigger outputs to fire for `output`: the executor's explicit list,
    /// or every external trigger output the node has.
    fn fire_list(&self, node: &Node, output: &NodeOutput) -> Vec<String> {
        let triggers: Vec<String> = self
            .exec
            .registry
            .ports(node, PortDirection::Output)
            .into_iter()
            .filter(|p| p.data_type.is_trigger())
            .map(|p| p.id)
            .collect();
        match &output.fire {
            Some(requested) => requested
                .iter()
                .filter(|p| {
                    let known = triggers.contains(p);
                    if !known {
                        warn!(node_id = %node.id, port = %p, "executor fired an unknown trigger output");
                    }
                    known
                })
                .cloned()
                .collect(),
            None => triggers.into_iter().filter(|p| p != loop_port::LOOP_BODY).collect(),
        }
    }

    fn fire(&mut self, node: &Node, ports: &[String], payload: &Value) {
        for fired in ports {
            for conn in self.exec.graph.outgoing(&node.id, fired) {
                self.ready.push_back(Activation {
                    node_id: conn.target.node.clone(),
                    port: conn.target.port.clone(),
                    payload: payload.clone(),
                });
            }
        }
    }

    async fn node_completed(&mut self, node: &Node, output: NodeOutput) {
        let exec = self.exec;
        let fired = self.fire_list(node, &output);
        exec.context.record_outputs(&node.id, output.values.clone());
        let state = exec.update_state(&node.id, |s| {
            s.status = NodeStatus::Completed;
            s.outputs = output.values.clone();
            s.fired_outputs = fired.clone();
            s.completed_at = Some(Utc::now());
            s.error = None;
        });
        info!(node_id = %node.id, fired = ?fired, "node completed");

        if node.node_type == builtin::END {
            self.record_end(node, &output.values);
        }
        exec.save_checkpoint(&self.loops).await;
        exec.emit_debug(&state);
        self.fire(node, &fired, &Value::Object(output.values));
    }

    fn record_end(&mut self, node: &Node, values: &Map<String, Value>) {
        let policy = self.exec.config.end_policy;
        let first = self.end_result.as_ref().map(|(id, _)| id.clone());
        match (first, policy) {
            (None, _) | (Some(_), EndPolicy::LastWins) => {
                self.end_result = Some((node.id.clone(), values.clone()));
            }
            (Some(first), EndPolicy::FirstWins) => {
                info!(node_id = %node.id, first = %first, "end result already recorded, keeping the first");
            }
            (Some(first), EndPolicy::Error) => {
                let err = EngineError::EndConflict { node_id: node.id.clone(), first };
                error!(error = %err, "conflicting end nodes");
                self.failure.get_or_insert(err);
            }
        }
    }

    async fn node_failed(&mut self, node: &Node, err: EngineError) {
        let exec = self.exec;
        let message = err.to_string();
        let state = exec.update_state(&node.id, |s| {
            s.status = NodeStatus::Failed;
            s.error = Some(message.clone());
            s.completed_at = Some(Utc::now());
        });
        error!(node_id = %node.id, error = %message, "node failed");
        exec.save_checkpoint(&self.loops).await;
        exec.emit_debug(&state);

        if self.failure.is_some() || matches!(err, EngineError::Cancelled) {
            self.failure.get_or_insert(err);
            return;
        }
        if node.config_bool("continueOnError") != Some(true) {
            self.failure = Some(err);
            return;
        }

        warn!(node_id = %node.id, "continuing past failure (continueOnError)");
        if exec.config.sync_failure_policy == SyncFailurePolicy::FailFast {
            for sync_id in self.downstream_syncs(&node.id) {
                self.syncs.remove(&sync_id);
                let abandoned = EngineError::SyncAbandoned { node_id: sync_id.clone(), failed: node.id.clone() };
                exec.update_state(&sync_id, |s| {
                    s.status = NodeStatus::Failed;
                    s.error = Some(abandoned.to_string());
                    s.completed_at = Some(Utc::now());
                });
                error!(error = %abandoned, "sync can no longer fire");
                self.failure.get_or_insert(abandoned);
            }
            if self.failure.is_some() {
                exec.save_checkpoint(&self.loops).await;
            }
        }
    }

    /// Sync nodes reachable from `node_id` that have not fired yet.
    fn downstream_syncs(&self, node_id: &str) -> Vec<String> {
        let graph = &self.exec.graph;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([node_id]);
        let mut syncs = Vec::new();
        while let Some(id) = queue.pop_front() {
            for conn in graph.connections.iter().filter(|c| c.source.node == id) {
                let target = conn.target.node.as_str();
                if !seen.insert(target) {
                    continue;
                }
                let is_sync = graph.node(target).is_some_and(|n| n.node_type == builtin::SYNC);
                let fired = self.exec.node_state(target).is_some_and(|s| s.status == NodeStatus::Completed);
                if is_sync && !fired {
                    syncs.push(target.to_owned());
                }
                queue.push_back(target);
            }
        }
        syncs
    }

    // -- loops ---------------------------------------------------------------

    async fn begin_loop(&mut self, node: &Node, output: NodeOutput) {
        let items = output.values.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
        info!(loop_id = %node.id, iterations = items.len(), "loop started");
        self.loops.insert(node.id.clone(), LoopProgress::new(items));
        self.next_iteration(node).await;
    }

    /// Start the current iteration, or finish the loop when the collection is
    /// exhausted. Iterations with no body connected complete immediately.
    async fn next_iteration(&mut self, node: &Node) {
        let exec = self.exec;
        loop {
            let Some(progress) = self.loops.get_mut(&node.id) else { return };
            let Some(values) = progress.iteration_values() else {
                self.finish_loop(node).await;
                return;
            };
            let index = progress.index;
            if exec.graph.outgoing(&node.id, loop_port::LOOP_BODY).next().is_none() {
                progress.index += 1;
                continue;
            }

            self.reset_body(&node.id);
            exec.context.record_outputs(&node.id, values.clone());
            exec.update_state(&node.id, |s| s.outputs = values.clone());
            debug!(loop_id = %node.id, index, "loop iteration");
            self.fire(node, &[loop_port::LOOP_BODY.to_owned()], &Value::Object(values));
            return;
        }
    }

    async fn continue_loop(&mut self, node: &Node) {
        let exec = self.exec;
        let Some(progress) = self.loops.get_mut(&node.id) else {
            warn!(loop_id = %node.id, "loop_back for a loop that is not running");
            return;
        };
        if let Some(conn) = exec.graph.incoming(&node.id, loop_port::RESULT_IN).next() {
            if let Some(value) = exec.context.output_value(&conn.source.node, &conn.source.port) {
                progress.results.push(value);
            }
        }
        progress.index += 1;
        self.next_iteration(node).await;
    }

    async fn finish_loop(&mut self, node: &Node) {
        let exec = self.exec;
        let Some(progress) = self.loops.remove(&node.id) else {
            warn!(loop_id = %node.id, "loop finished twice");
            return;
        };
        info!(loop_id = %node.id, results = progress.results.len(), "loop finished");
        let output = NodeOutput::empty()
            .with(port::RESULTS, Value::Array(progress.results))
            .firing([port::TRIGGER]);
        self.node_completed(node, output).await;
    }

    /// Put every body node back to pending for a fresh iteration.
    fn reset_body(&mut self, loop_id: &str) {
        let exec = self.exec;
        let Some(body) = exec.loops.body(loop_id) else { return };
        exec.context.clear_outputs(body.iter().map(String::as_str));
        for node_id in body {
            self.syncs.remove(node_id);
            self.loops.remove(node_id);
            exec.update_state(node_id, |s| {
                let runs = s.run_count;
                *s = NodeExecutionState { run_count: runs, ..NodeExecutionState::pending(node_id.as_str()) };
            });
        }
    }

    // -- shutdown ------------------------------------------------------------

    /// Cancellation: signal handlers, give in-flight nodes the grace period,
    /// then abort whatever is left.
    async fn shutdown(&mut self) {
        let exec = self.exec;
        warn!(in_flight = self.in_flight.len(), "cancelling run");
        exec.context.request_stop();

        let grace = tokio::time::sleep(exec.config.cancel_grace());
        tokio::pin!(grace);
        while !self.in_flight.is_empty() {
            let joined = tokio::select! {
                _ = &mut grace => None,
                joined = self.in_flight.join_next() => joined,
            };
            match joined {
                Some(joined) => self.on_joined(joined).await,
                None => {
                    warn!(aborted = self.in_flight.len(), "grace period over, aborting nodes");
                    self.in_flight.abort_all();
                    while self.in_flight.join_next().await.is_some() {}
                }
            }
        }
    }

    /// Release leftovers, settle node states and hand back the run result.
    async fn finalize(mut self) -> (Option<EngineError>, Option<(String, Map<String, Value>)>) {
        let exec = self.exec;
        let cancelled = exec.control.status() == RunStatus::Cancelled;

        if !cancelled && self.failure.is_none() {
            if let Some(loop_id) = self.loops.keys().next().cloned() {
                let err = EngineError::NodeExecution {
                    node_id: loop_id.clone(),
                    message: "loop body ended without reaching loop_back or break".into(),
                };
                exec.update_state(&loop_id, |s| {
                    s.status = NodeStatus::Failed;
                    s.error = Some(err.to_string());
                });
                self.failure = Some(err);
            }
        }

        let released = exec.context.release_all_agents().await;
        if released > 0 {
            info!(released, "released agents left allocated at run end");
        }

        let waiting: Vec<String> = self.syncs.keys().cloned().collect();
        for node_id in &waiting {
            warn!(node_id = %node_id, "sync never received all of its inputs");
        }

        let mut states = exec.states();
        for state in states.values_mut() {
            match state.status {
                NodeStatus::Pending => {
                    state.status = NodeStatus::Skipped;
                    if waiting.contains(&state.node_id) {
                        state.error = Some("sync never received all of its inputs".into());
                    }
                }
                NodeStatus::Running => {
                    state.status = NodeStatus::Failed;
                    state.error = Some(if cancelled { "cancelled" } else { "aborted" }.into());
                    state.completed_at = Some(Utc::now());
                }
                _ => {}
            }
        }
        drop(states);

        (self.failure, self.end_result)
    }
}
