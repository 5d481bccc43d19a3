//! Core graph model.
//!
//! These types are the in-memory shape of an authored workflow document.
//! They deserialize directly from the camelCase JSON the editor saves, and
//! are shared read-only (`Arc<Graph>`) for the duration of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Which side of a node a port sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// What travels along a connection attached to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Control-flow signal, carries no value of its own.
    Trigger,
    Any,
    Object,
    Number,
    Boolean,
    Array,
    String,
    /// An allocated agent id.
    Agent,
}

impl DataType {
    /// Whether a value of type `self` may flow into a port of type `other`.
    ///
    /// Triggers only ever connect to triggers; `any` is compatible with every
    /// value type.
    pub fn compatible_with(self, other: DataType) -> bool {
        match (self, other) {
            (DataType::Trigger, DataType::Trigger) => true,
            (DataType::Trigger, _) | (_, DataType::Trigger) => false,
            (DataType::Any, _) | (_, DataType::Any) => true,
            (a, b) => a == b,
        }
    }

    pub fn is_trigger(self) -> bool {
        self == DataType::Trigger
    }
}

/// A typed connection point on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    /// Unique within the node and direction.
    pub id: String,
    pub name: String,
    pub direction: PortDirection,
    pub data_type: DataType,
    /// Fan-in: more than one connection may target this port.
    #[serde(default)]
    pub allow_multiple: bool,
}

impl Port {
    pub fn input(id: impl Into<String>, data_type: DataType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            direction: PortDirection::Input,
            data_type,
            allow_multiple: false,
        }
    }

    pub fn output(id: impl Into<String>, data_type: DataType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            direction: PortDirection::Output,
            data_type,
            allow_multiple: false,
        }
    }

    /// Builder: allow several incoming connections.
    pub fn multiple(mut self) -> Self {
        self.allow_multiple = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Presentation-only canvas coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A configured node instance inside a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier within the graph (referenced by connections).
    pub id: String,
    /// Maps to a registered node type definition.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub inputs: Vec<Port>,
    #[serde(default)]
    pub outputs: Vec<Port>,
}

impl Node {
    pub fn input(&self, port_id: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.id == port_id)
    }

    pub fn output(&self, port_id: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.id == port_id)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(Value::as_bool)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self { node: node.into(), port: port.into() }
    }
}

/// Directed edge from an output port to an input port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source: Endpoint,
    pub target: Endpoint,
    /// Visual reroute points; ignored by execution.
    #[serde(default)]
    pub reroute_points: Vec<Position>,
}

impl Connection {
    pub fn new(id: impl Into<String>, source: Endpoint, target: Endpoint) -> Self {
        Self { id: id.into(), source, target, reroute_points: Vec::new() }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A workflow input declared by the graph and supplied at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

/// A run-scoped variable and its initial value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(default)]
    pub default: Value,
}

/// A complete workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Graph {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDecl>,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Graph {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, nodes: Vec<Node>, connections: Vec<Connection>) -> Self {
        Self {
            name: name.into(),
            version: "1".into(),
            description: String::new(),
            parameters: Vec::new(),
            variables: Vec::new(),
            nodes,
            connections,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Connections leaving `node`'s output `port`.
    pub fn outgoing<'a>(&'a self, node: &'a str, port: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .iter()
            .filter(move |c| c.source.node == node && c.source.port == port)
    }

    /// Connections arriving at `node`'s input `port`.
    pub fn incoming<'a>(&'a self, node: &'a str, port: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .iter()
            .filter(move |c| c.target.node == node && c.target.port == port)
    }

    pub fn nodes_of_type<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Lifecycle of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Engine-owned record of what happened to one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionState {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Trigger outputs fired by the last completion; used to re-derive the
    /// ready set after a restore.
    #[serde(default)]
    pub fired_outputs: Vec<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// How many times the node has been dispatched (loops run bodies repeatedly).
    #[serde(default)]
    pub run_count: u32,
}

impl NodeExecutionState {
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), ..Default::default() }
    }
}
