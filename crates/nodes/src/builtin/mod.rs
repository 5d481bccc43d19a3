//! Built-in node types.
//!
//! Control-flow types (`start`, `end`, `branch`, `sync`, `for_loop`,
//! `condition`) live in [`flow`]; side-effecting task types (`set_variable`,
//! `log`, `agent_task`, `emit_event`, `wait_event`) in [`tasks`].
//!
//! `sync` and `for_loop` executors only compute values; their accumulation and
//! iteration semantics are driven by the engine.

pub mod flow;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::models::{DataType, Port, PortDirection};
use crate::registry::{ConfigField, FieldKind, NodeRegistry, NodeTypeDefinition, VariadicPorts};

pub const START: &str = "start";
pub const END: &str = "end";
pub const BRANCH: &str = "branch";
pub const SYNC: &str = "sync";
pub const FOR_LOOP: &str = "for_loop";
pub const CONDITION: &str = "condition";
pub const SET_VARIABLE: &str = "set_variable";
pub const LOG: &str = "log";
pub const AGENT_TASK: &str = "agent_task";
pub const EMIT_EVENT: &str = "emit_event";
pub const WAIT_EVENT: &str = "wait_event";

/// Port ids shared by several built-in types.
pub mod port {
    pub const TRIGGER: &str = "trigger";
    pub const DATA: &str = "data";
    pub const VALUE: &str = "value";
    pub const RESULTS: &str = "results";
    pub const OUTPUT: &str = "output";
}

/// Ports of the `for_loop` container.
///
/// External ports (`trigger`, `collection` in; `trigger`, `results` out) face
/// the parent graph. Internal ports face the loop body only.
pub mod loop_port {
    pub const COLLECTION: &str = "collection";
    pub const LOOP_BODY: &str = "loop_body";
    pub const ITEM: &str = "item";
    pub const INDEX: &str = "index";
    pub const LOOP_BACK: &str = "loop_back";
    pub const BREAK: &str = "break";
    pub const RESULT_IN: &str = "result_in";

    pub const INTERNAL_OUTPUTS: [&str; 3] = [LOOP_BODY, ITEM, INDEX];
    pub const INTERNAL_INPUTS: [&str; 3] = [LOOP_BACK, BREAK, RESULT_IN];

    pub fn is_internal(port: &str) -> bool {
        INTERNAL_OUTPUTS.contains(&port) || INTERNAL_INPUTS.contains(&port)
    }
}

/// Default timeout for long-running external task nodes.
pub const AGENT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

fn trigger_in() -> Port {
    Port::input(port::TRIGGER, DataType::Trigger).multiple()
}

fn trigger_out() -> Port {
    Port::output(port::TRIGGER, DataType::Trigger)
}

/// Register every built-in node type on `registry`.
pub fn register_builtins(registry: &mut NodeRegistry) {
    registry.register(
        NodeTypeDefinition::new(START, "Start")
            .category("flow")
            .description("Entry point; emits the run input.")
            .output(trigger_out())
            .output(Port::output(port::DATA, DataType::Any)),
        Arc::new(flow::StartNode),
    );

    registry.register(
        NodeTypeDefinition::new(END, "End")
            .category("flow")
            .description("Records a terminal result for the path that reaches it.")
            .field(ConfigField::new("outputKey", FieldKind::String).default_value(json!("result")))
            .field(ConfigField::new("success", FieldKind::Boolean).default_value(json!(true)))
            .input(trigger_in())
            .input(Port::input(port::VALUE, DataType::Any)),
        Arc::new(flow::EndNode),
    );

    registry.register(
        NodeTypeDefinition::new(BRANCH, "Branch")
            .category("flow")
            .description("Fires every out_i trigger at once; passes data through.")
            .field(ConfigField::new("outputCount", FieldKind::Integer).default_value(json!(2)).min(1.0).max(64.0))
            .input(trigger_in())
            .input(Port::input(port::DATA, DataType::Any))
            .output(Port::output(port::DATA, DataType::Any))
            .variadic(VariadicPorts {
                direction: PortDirection::Output,
                count_field: "outputCount".into(),
                prefix: "out_".into(),
                data_type: DataType::Trigger,
            }),
        Arc::new(flow::BranchNode),
    );

    registry.register(
        NodeTypeDefinition::new(SYNC, "Sync")
            .category("flow")
            .description("Waits for every in_i trigger, then emits results in port order.")
            .field(ConfigField::new("inputCount", FieldKind::Integer).default_value(json!(2)).min(1.0).max(64.0))
            .output(trigger_out())
            .output(Port::output(port::RESULTS, DataType::Array))
            .variadic(VariadicPorts {
                direction: PortDirection::Input,
                count_field: "inputCount".into(),
                prefix: "in_".into(),
                data_type: DataType::Trigger,
            }),
        Arc::new(flow::SyncNode),
    );

    registry.register(
        NodeTypeDefinition::new(FOR_LOOP, "For each")
            .category("flow")
            .description("Runs its body once per item of a collection.")
            .field(ConfigField::new(loop_port::COLLECTION, FieldKind::Json))
            .field(ConfigField::new("maxIterations", FieldKind::Integer).default_value(json!(flow::DEFAULT_MAX_ITERATIONS)).min(1.0))
            .input(trigger_in())
            .input(Port::input(loop_port::COLLECTION, DataType::Any))
            .input(Port::input(loop_port::LOOP_BACK, DataType::Trigger).multiple())
            .input(Port::input(loop_port::BREAK, DataType::Trigger).multiple())
            .input(Port::input(loop_port::RESULT_IN, DataType::Any))
            .output(trigger_out())
            .output(Port::output(port::RESULTS, DataType::Array))
            .output(Port::output(loop_port::LOOP_BODY, DataType::Trigger))
            .output(Port::output(loop_port::ITEM, DataType::Any))
            .output(Port::output(loop_port::INDEX, DataType::Number)),
        Arc::new(flow::ForLoopNode),
    );

    registry.register(
        NodeTypeDefinition::new(CONDITION, "Condition")
            .category("flow")
            .description("Evaluates an expression and fires `true` or `false`.")
            .field(ConfigField::new("expression", FieldKind::Expression).required())
            .input(trigger_in())
            .input(Port::input(port::VALUE, DataType::Any))
            .output(Port::output("true", DataType::Trigger))
            .output(Port::output("false", DataType::Trigger))
            .output(Port::output("result", DataType::Boolean)),
        Arc::new(flow::ConditionNode),
    );

    registry.register(
        NodeTypeDefinition::new(SET_VARIABLE, "Set variable")
            .category("data")
            .field(ConfigField::new("name", FieldKind::String).required())
            .field(ConfigField::new("value", FieldKind::Json))
            .input(trigger_in())
            .input(Port::input(port::VALUE, DataType::Any))
            .output(trigger_out())
            .output(Port::output(port::VALUE, DataType::Any)),
        Arc::new(tasks::SetVariableNode),
    );

    registry.register(
        NodeTypeDefinition::new(LOG, "Log")
            .category("data")
            .field(ConfigField::new("message", FieldKind::Template).required())
            .field(ConfigField::new("level", FieldKind::Select).options(&["debug", "info", "warn"]).default_value(json!("info")))
            .input(trigger_in())
            .output(trigger_out())
            .output(Port::output("message", DataType::String)),
        Arc::new(tasks::LogNode),
    );

    registry.register(
        NodeTypeDefinition::new(AGENT_TASK, "Agent task")
            .category("agents")
            .description("Allocates an agent, runs a prompt on it with retries, releases it.")
            .field(ConfigField::new("role", FieldKind::String).required())
            .field(ConfigField::new("prompt", FieldKind::Template).required())
            .field(ConfigField::new("timeout", FieldKind::Integer).min(1.0))
            .field(ConfigField::new("retry", FieldKind::Boolean).default_value(json!(true)))
            .input(trigger_in())
            .input(Port::input("context", DataType::Any))
            .output(trigger_out())
            .output(Port::output(port::OUTPUT, DataType::String))
            .output(Port::output("success", DataType::Boolean))
            .output(Port::output("agentId", DataType::Agent))
            .timeout(AGENT_TASK_TIMEOUT),
        Arc::new(tasks::AgentTaskNode),
    );

    registry.register(
        NodeTypeDefinition::new(EMIT_EVENT, "Emit event")
            .category("events")
            .field(ConfigField::new("eventType", FieldKind::String).required())
            .field(ConfigField::new("payload", FieldKind::Json))
            .input(trigger_in())
            .input(Port::input("payload", DataType::Any))
            .output(trigger_out())
            .output(Port::output("payload", DataType::Any)),
        Arc::new(tasks::EmitEventNode),
    );

    registry.register(
        NodeTypeDefinition::new(WAIT_EVENT, "Wait for event")
            .category("events")
            .field(ConfigField::new("eventType", FieldKind::String).required())
            .field(ConfigField::new("timeoutMs", FieldKind::Integer).min(1.0))
            .input(trigger_in())
            .output(trigger_out())
            .output(Port::output(port::VALUE, DataType::Any)),
        Arc::new(tasks::WaitEventNode),
    );
}
