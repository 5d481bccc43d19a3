//! Graph validation. Run this before persisting or executing a workflow.
//!
//! Errors make a graph unrunnable:
//! 1. Node ids must be unique and every node type registered, with a config
//!    that satisfies the type's schema.
//! 2. Every connection must join an existing output port to an existing
//!    input port of a compatible data type.
//! 3. Exactly one `start` node and at least one `end` node.
//! 4. Variadic port lists must match their count field.
//! 5. Only `allowMultiple` ports may have more than one incoming connection.
//! 6. The trigger graph must be acyclic once edges into a loop's `loop_back`
//!    and `break` inputs are removed (topological sort must succeed).
//!
//! Warnings flag graphs that run but probably not as intended: nodes no
//! trigger path from `start` reaches, and loop bodies that never signal
//! the loop to continue.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use thiserror::Error;

use crate::builtin::{self, loop_port};
use crate::models::{Graph, Port, PortDirection};
use crate::registry::NodeRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    DuplicateNodeId,
    UnknownNodeType,
    InvalidConfig,
    DanglingConnection,
    PortDirection,
    IncompatibleTypes,
    MissingStart,
    MultipleStarts,
    MissingEnd,
    PortCountMismatch,
    FanIn,
    TriggerCycle,
    Unreachable,
    LoopBodyOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub message: String,
}

impl ValidationIssue {
    fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of [`validate_graph`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has(&self, kind: IssueKind) -> bool {
        self.errors.iter().chain(&self.warnings).any(|i| i.kind == kind)
    }

    /// `Ok(warnings)` when valid, the collected errors otherwise.
    pub fn into_result(self) -> Result<Vec<ValidationIssue>, GraphValidationError> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(GraphValidationError { errors: self.errors })
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("graph is invalid: {}", join(.errors))]
pub struct GraphValidationError {
    pub errors: Vec<ValidationIssue>,
}

fn join(issues: &[ValidationIssue]) -> String {
    issues.iter().map(|i| i.message.as_str()).collect::<Vec<_>>().join("; ")
}

/// Validate `graph` against the node types in `registry`.
pub fn validate_graph(graph: &Graph, registry: &NodeRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    // -----------------------------------------------------------------------
    // 1. Node ids and types
    // -----------------------------------------------------------------------
    let mut seen: HashSet<&str> = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            report.errors.push(ValidationIssue::new(
                IssueKind::DuplicateNodeId,
                format!("duplicate node id '{}'", node.id),
            ));
        }
        let Some(def) = registry.definition(&node.node_type) else {
            report.errors.push(ValidationIssue::new(
                IssueKind::UnknownNodeType,
                format!("node '{}' has unknown type '{}'", node.id, node.node_type),
            ));
            continue;
        };
        for field in &def.config_schema {
            let problem = match node.config.get(&field.key).filter(|v| !v.is_null()) {
                Some(value) => field.check(value).err(),
                None if field.required && field.default.is_none() => Some("required field is not set".to_owned()),
                None => None,
            };
            if let Some(reason) = problem {
                report.errors.push(ValidationIssue::new(
                    IssueKind::InvalidConfig,
                    format!("node '{}' config '{}': {reason}", node.id, field.key),
                ));
            }
        }
    }

    let ports: HashMap<&str, (Vec<Port>, Vec<Port>)> = graph
        .nodes
        .iter()
        .map(|n| {
            (
                n.id.as_str(),
                (registry.ports(n, PortDirection::Input), registry.ports(n, PortDirection::Output)),
            )
        })
        .collect();

    // -----------------------------------------------------------------------
    // 2. Connections
    // -----------------------------------------------------------------------
    let mut fan_in: HashMap<(&str, &str), usize> = HashMap::new();
    for conn in &graph.connections {
        let (Some((src_in, src_out)), Some((tgt_in, tgt_out))) =
            (ports.get(conn.source.node.as_str()), ports.get(conn.target.node.as_str()))
        else {
            report.errors.push(ValidationIssue::new(
                IssueKind::DanglingConnection,
                format!("connection '{}' references a missing node", conn.id),
            ));
            continue;
        };

        let source = src_out.iter().find(|p| p.id == conn.source.port);
        let target = tgt_in.iter().find(|p| p.id == conn.target.port);

        if source.is_none() && src_in.iter().any(|p| p.id == conn.source.port) {
            report.errors.push(ValidationIssue::new(
                IssueKind::PortDirection,
                format!("connection '{}' starts at input port '{}.{}'", conn.id, conn.source.node, conn.source.port),
            ));
            continue;
        }
        if target.is_none() && tgt_out.iter().any(|p| p.id == conn.target.port) {
            report.errors.push(ValidationIssue::new(
                IssueKind::PortDirection,
                format!("connection '{}' ends at output port '{}.{}'", conn.id, conn.target.node, conn.target.port),
            ));
            continue;
        }
        let (Some(source), Some(target)) = (source, target) else {
            report.errors.push(ValidationIssue::new(
                IssueKind::DanglingConnection,
                format!(
                    "connection '{}' references a missing port ({}.{} -> {}.{})",
                    conn.id, conn.source.node, conn.source.port, conn.target.node, conn.target.port
                ),
            ));
            continue;
        };

        if !source.data_type.compatible_with(target.data_type) {
            report.errors.push(ValidationIssue::new(
                IssueKind::IncompatibleTypes,
                format!(
                    "connection '{}' joins {:?} output '{}.{}' to {:?} input '{}.{}'",
                    conn.id,
                    source.data_type,
                    conn.source.node,
                    conn.source.port,
                    target.data_type,
                    conn.target.node,
                    conn.target.port
                ),
            ));
        }

        let count = fan_in.entry((conn.target.node.as_str(), conn.target.port.as_str())).or_insert(0);
        *count += 1;
        if *count == 2 && !target.allow_multiple {
            report.errors.push(ValidationIssue::new(
                IssueKind::FanIn,
                format!("input '{}.{}' accepts a single connection", conn.target.node, conn.target.port),
            ));
        }
    }

    // -----------------------------------------------------------------------
    // 3. Entry and exit
    // -----------------------------------------------------------------------
    let starts: Vec<&str> = graph.nodes_of_type(builtin::START).map(|n| n.id.as_str()).collect();
    match starts.len() {
        0 => report.errors.push(ValidationIssue::new(IssueKind::MissingStart, "graph has no start node")),
        1 => {}
        n => report.errors.push(ValidationIssue::new(
            IssueKind::MultipleStarts,
            format!("graph has {n} start nodes: {}", starts.join(", ")),
        )),
    }
    if graph.nodes_of_type(builtin::END).next().is_none() {
        report.errors.push(ValidationIssue::new(IssueKind::MissingEnd, "graph has no end node"));
    }

    // -----------------------------------------------------------------------
    // 4. Variadic port counts
    // -----------------------------------------------------------------------
    for node in &graph.nodes {
        let Some(def) = registry.definition(&node.node_type) else { continue };
        let (Some(variadic), Some(expected)) = (&def.variadic, def.variadic_count(node)) else { continue };
        let own = match variadic.direction {
            PortDirection::Input => &node.inputs,
            PortDirection::Output => &node.outputs,
        };
        if own.is_empty() {
            continue;
        }
        let actual = own.iter().filter(|p| variadic.index_of(&p.id).is_some()).count();
        if actual != expected {
            report.errors.push(ValidationIssue::new(
                IssueKind::PortCountMismatch,
                format!(
                    "node '{}' declares {} = {expected} but has {actual} '{}' ports",
                    node.id, variadic.count_field, variadic.prefix
                ),
            ));
        }
    }

    // -----------------------------------------------------------------------
    // 5. Trigger cycles (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let is_trigger = |node: &str, port: &str| {
        ports
            .get(node)
            .and_then(|(_, outs)| outs.iter().find(|p| p.id == port))
            .is_some_and(|p| p.data_type.is_trigger())
    };
    let is_loop_return = |node: &str, port: &str| {
        (port == loop_port::LOOP_BACK || port == loop_port::BREAK)
            && graph.node(node).is_some_and(|n| n.node_type == builtin::FOR_LOOP)
    };

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = graph.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for conn in &graph.connections {
        if !is_trigger(&conn.source.node, &conn.source.port)
            || is_loop_return(&conn.target.node, &conn.target.port)
            || !in_degree.contains_key(conn.target.node.as_str())
        {
            continue;
        }
        adjacency.entry(conn.source.node.as_str()).or_default().push(conn.target.node.as_str());
        *in_degree.entry(conn.target.node.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = in_degree.iter().filter(|(_, &d)| d == 0).map(|(&id, _)| id).collect();
    let mut sorted = 0usize;
    while let Some(node_id) = queue.pop_front() {
        sorted += 1;
        for &next in adjacency.get(node_id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(next);
                }
            }
        }
    }
    if sorted != in_degree.len() {
        let stuck: BTreeSet<&str> = in_degree.iter().filter(|(_, &d)| d > 0).map(|(&id, _)| id).collect();
        report.errors.push(ValidationIssue::new(
            IssueKind::TriggerCycle,
            format!(
                "trigger cycle not closed by a loop's loop_back/break input, involving: {}",
                stuck.into_iter().collect::<Vec<_>>().join(", ")
            ),
        ));
    }

    // -----------------------------------------------------------------------
    // 6. Warnings
    // -----------------------------------------------------------------------
    let trigger_targets = |node: &str| -> Vec<&str> {
        graph
            .connections
            .iter()
            .filter(|c| c.source.node == node && is_trigger(&c.source.node, &c.source.port))
            .map(|c| c.target.node.as_str())
            .collect()
    };

    if let [start] = starts.as_slice() {
        let mut reached: HashSet<&str> = HashSet::from([*start]);
        let mut queue = VecDeque::from([*start]);
        while let Some(id) = queue.pop_front() {
            for next in trigger_targets(id) {
                if reached.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        for node in graph.nodes.iter().filter(|n| !reached.contains(n.id.as_str())) {
            report.warnings.push(ValidationIssue::new(
                IssueKind::Unreachable,
                format!("node '{}' is not reachable from the start node", node.id),
            ));
        }
    }

    for lp in graph.nodes_of_type(builtin::FOR_LOOP) {
        let entry: Vec<&str> = graph.outgoing(&lp.id, loop_port::LOOP_BODY).map(|c| c.target.node.as_str()).collect();
        if entry.is_empty() {
            continue;
        }
        let mut closes = false;
        let mut reached: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = entry.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if id == lp.id || !reached.insert(id) {
                continue;
            }
            for conn in graph.connections.iter().filter(|c| c.source.node == id) {
                if conn.target.node == lp.id && is_loop_return(&conn.target.node, &conn.target.port) {
                    closes = true;
                } else if is_trigger(&conn.source.node, &conn.source.port) {
                    queue.push_back(conn.target.node.as_str());
                }
            }
        }
        if !closes {
            report.warnings.push(ValidationIssue::new(
                IssueKind::LoopBodyOpen,
                format!("loop '{}' body never reaches its loop_back or break input", lp.id),
            ));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection, Endpoint, Node};
    use serde_json::json;

    fn make_node(id: &str, node_type: &str) -> Node {
        let config = match node_type {
            "log" => json!({ "message": id }),
            "set_variable" => json!({ "name": id }),
            _ => json!({}),
        };
        node_with(id, node_type, config)
    }

    fn node_with(id: &str, node_type: &str, config: serde_json::Value) -> Node {
        serde_json::from_value(json!({ "id": id, "type": node_type, "config": config })).unwrap()
    }

    fn conn(from: (&str, &str), to: (&str, &str)) -> Connection {
        Connection::new(
            format!("{}.{}->{}.{}", from.0, from.1, to.0, to.1),
            Endpoint::new(from.0, from.1),
            Endpoint::new(to.0, to.1),
        )
    }

    fn check(nodes: Vec<Node>, connections: Vec<Connection>) -> ValidationReport {
        validate_graph(&Graph::new("test", nodes, connections), &NodeRegistry::with_builtins())
    }

    fn linear() -> (Vec<Node>, Vec<Connection>) {
        (
            vec![make_node("start", "start"), make_node("log", "log"), make_node("end", "end")],
            vec![
                conn(("start", "trigger"), ("log", "trigger")),
                conn(("log", "trigger"), ("end", "trigger")),
            ],
        )
    }

    #[test]
    fn linear_graph_is_clean() {
        let (nodes, conns) = linear();
        let report = check(nodes, conns);
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn duplicate_and_unknown_nodes_are_errors() {
        let (mut nodes, conns) = linear();
        nodes.push(make_node("log", "log"));
        nodes.push(make_node("ghost", "teleport"));
        let report = check(nodes, conns);
        assert!(report.has(IssueKind::DuplicateNodeId));
        assert!(report.has(IssueKind::UnknownNodeType));
    }

    #[test]
    fn dangling_and_reversed_connections_are_errors() {
        let (nodes, mut conns) = linear();
        conns.push(conn(("log", "trigger"), ("nowhere", "trigger")));
        conns.push(conn(("log", "nope"), ("end", "value")));
        conns.push(conn(("end", "value"), ("log", "trigger")));
        let report = check(nodes, conns);
        assert_eq!(
            report.errors.iter().filter(|i| i.kind == IssueKind::DanglingConnection).count(),
            2
        );
        assert!(report.has(IssueKind::PortDirection));
    }

    #[test]
    fn trigger_into_data_port_is_incompatible() {
        let (nodes, mut conns) = linear();
        conns.push(conn(("start", "trigger"), ("end", "value")));
        assert!(check(nodes, conns).has(IssueKind::IncompatibleTypes));
    }

    #[test]
    fn start_and_end_are_required() {
        let report = check(vec![make_node("log", "log")], vec![]);
        assert!(report.has(IssueKind::MissingStart));
        assert!(report.has(IssueKind::MissingEnd));

        let (mut nodes, conns) = linear();
        nodes.push(make_node("start2", "start"));
        assert!(check(nodes, conns).has(IssueKind::MultipleStarts));
    }

    #[test]
    fn single_input_port_rejects_fan_in() {
        let (mut nodes, mut conns) = linear();
        nodes.push(make_node("set", "set_variable"));
        conns.push(conn(("start", "trigger"), ("set", "trigger")));
        conns.push(conn(("start", "data"), ("end", "value")));
        conns.push(conn(("set", "value"), ("end", "value")));
        let report = check(nodes, conns);
        assert!(report.has(IssueKind::FanIn));
    }

    #[test]
    fn variadic_port_list_must_match_count() {
        let registry = NodeRegistry::with_builtins();
        let mut sync = registry
            .create_instance("sync", "sync", json!({ "inputCount": 3 }).as_object().cloned().unwrap(), Default::default())
            .unwrap();
        sync.inputs.pop();
        let (mut nodes, conns) = linear();
        nodes.push(sync);
        assert!(check(nodes, conns).has(IssueKind::PortCountMismatch));
    }

    #[test]
    fn trigger_cycle_is_detected() {
        let nodes = vec![
            make_node("start", "start"),
            make_node("a", "log"),
            make_node("b", "log"),
            make_node("end", "end"),
        ];
        let conns = vec![
            conn(("start", "trigger"), ("a", "trigger")),
            conn(("a", "trigger"), ("b", "trigger")),
            conn(("b", "trigger"), ("a", "trigger")), // back-edge
            conn(("b", "trigger"), ("end", "trigger")),
        ];
        let report = check(nodes, conns);
        let cycle = report.errors.iter().find(|i| i.kind == IssueKind::TriggerCycle).unwrap();
        assert!(cycle.message.contains('a') && cycle.message.contains('b'));
    }

    #[test]
    fn loop_back_edge_is_not_a_cycle() {
        let nodes = vec![
            make_node("start", "start"),
            make_node("loop", "for_loop"),
            make_node("body", "log"),
            make_node("end", "end"),
        ];
        let conns = vec![
            conn(("start", "trigger"), ("loop", "trigger")),
            conn(("loop", "loop_body"), ("body", "trigger")),
            conn(("body", "trigger"), ("loop", "loop_back")),
            conn(("loop", "trigger"), ("end", "trigger")),
        ];
        let report = check(nodes, conns);
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn open_loop_body_and_orphans_warn() {
        let nodes = vec![
            make_node("start", "start"),
            make_node("loop", "for_loop"),
            make_node("body", "log"),
            make_node("orphan", "log"),
            make_node("end", "end"),
        ];
        let conns = vec![
            conn(("start", "trigger"), ("loop", "trigger")),
            conn(("loop", "loop_body"), ("body", "trigger")),
            conn(("loop", "trigger"), ("end", "trigger")),
        ];
        let report = check(nodes, conns);
        assert!(report.is_valid());
        assert!(report.has(IssueKind::LoopBodyOpen));
        assert!(report.warnings.iter().any(|w| w.kind == IssueKind::Unreachable && w.message.contains("orphan")));
    }

    #[test]
    fn config_must_match_the_type_schema() {
        let nodes = vec![
            make_node("start", "start"),
            node_with("log", "log", json!({ "level": "loud", "message": 5 })),
            node_with("fan", "branch", json!({ "outputCount": 1_000_000 })),
            node_with("set", "set_variable", json!({})),
            node_with("end", "end", json!({ "success": "yes" })),
        ];
        let conns = vec![
            conn(("start", "trigger"), ("log", "trigger")),
            conn(("log", "trigger"), ("end", "trigger")),
        ];
        let report = check(nodes, conns);
        let config_errors: Vec<&str> = report
            .errors
            .iter()
            .filter(|i| i.kind == IssueKind::InvalidConfig)
            .map(|i| i.message.as_str())
            .collect();
        assert_eq!(config_errors.len(), 5, "{config_errors:?}");
        assert!(config_errors.iter().any(|m| m.contains("'level'")));
        assert!(config_errors.iter().any(|m| m.contains("'message'")));
        assert!(config_errors.iter().any(|m| m.contains("'outputCount'") && m.contains("maximum")));
        assert!(config_errors.iter().any(|m| m.contains("'name'") && m.contains("required")));
        assert!(config_errors.iter().any(|m| m.contains("'success'")));
    }

    #[test]
    fn oversized_port_family_is_not_built() {
        let registry = NodeRegistry::with_builtins();
        let fan = node_with("fan", "branch", json!({ "outputCount": 1_000_000 }));
        assert!(registry.definition("branch").unwrap().variadic_count(&fan).is_none());
        assert!(registry.ports(&fan, PortDirection::Output).len() < 10);
    }

    #[test]
    fn into_result_collects_errors() {
        let err = check(vec![], vec![]).into_result().unwrap_err();
        assert!(err.to_string().contains("no start node"));
    }
}
