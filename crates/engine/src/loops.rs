//! Loop bookkeeping: body membership, computed once per graph, and the
//! per-loop iteration progress the scheduler keeps and checkpoints.
//!
//! A node belongs to a `for_loop`'s body when a chain of trigger connections
//! leads to it from the loop's `loop_body` output without passing through the
//! loop node itself. Data connections never extend a body, so a node after
//! the loop may read a body node's output without joining the body. Nested
//! loops are part of the enclosing body, and so are their own bodies.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use nodes::builtin::{self, loop_port};
use nodes::{Graph, NodeRegistry, PortDirection};

#[derive(Debug, Clone, Default)]
pub struct LoopIndex {
    bodies: HashMap<String, BTreeSet<String>>,
}

impl LoopIndex {
    pub fn build(graph: &Graph, registry: &NodeRegistry) -> Self {
        let is_trigger = |node_id: &str, port: &str| {
            graph.node(node_id).is_some_and(|node| {
                registry
                    .ports(node, PortDirection::Output)
                    .iter()
                    .any(|p| p.id == port && p.data_type.is_trigger())
            })
        };

        let mut bodies = HashMap::new();
        for lp in graph.nodes_of_type(builtin::FOR_LOOP) {
            let mut body: BTreeSet<String> = BTreeSet::new();
            let mut queue: VecDeque<&str> =
                graph.outgoing(&lp.id, loop_port::LOOP_BODY).map(|c| c.target.node.as_str()).collect();

            while let Some(id) = queue.pop_front() {
                if id == lp.id || !body.insert(id.to_owned()) {
                    continue;
                }
                queue.extend(
                    graph
                        .connections
                        .iter()
                        .filter(|c| c.source.node == id && is_trigger(id, &c.source.port))
                        .map(|c| c.target.node.as_str()),
                );
            }
            bodies.insert(lp.id.clone(), body);
        }
        Self { bodies }
    }

    /// Body of `loop_id`; `None` if it is not a loop.
    pub fn body(&self, loop_id: &str) -> Option<&BTreeSet<String>> {
        self.bodies.get(loop_id)
    }

    /// Loops whose body contains `node_id`, nested ones included.
    pub fn enclosing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.bodies
            .iter()
            .filter(move |(_, body)| body.contains(node_id))
            .map(|(id, _)| id.as_str())
    }
}

/// Where a running loop is: its normalised collection, the iteration in
/// progress and the `result_in` values gathered so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopProgress {
    pub items: Vec<Value>,
    pub index: usize,
    pub results: Vec<Value>,
}

impl LoopProgress {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items, ..Self::default() }
    }

    /// `{ item, index }` for the current iteration; `None` once exhausted.
    pub fn iteration_values(&self) -> Option<Map<String, Value>> {
        let item = self.items.get(self.index)?.clone();
        let mut values = Map::new();
        values.insert(loop_port::ITEM.into(), item);
        values.insert(loop_port::INDEX.into(), json!(self.index));
        Some(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodes::{Connection, Endpoint, Node};
    use serde_json::json;

    fn make_node(id: &str, node_type: &str) -> Node {
        serde_json::from_value(json!({ "id": id, "type": node_type, "config": { "message": id } })).unwrap()
    }

    fn conn(from: (&str, &str), to: (&str, &str)) -> Connection {
        Connection::new(format!("{}-{}", from.0, to.0), Endpoint::new(from.0, from.1), Endpoint::new(to.0, to.1))
    }

    #[test]
    fn body_stops_at_loop_boundary() {
        let graph = Graph::new(
            "loops",
            vec![
                make_node("start", "start"),
                make_node("outer", "for_loop"),
                make_node("a", "log"),
                make_node("inner", "for_loop"),
                make_node("b", "log"),
                make_node("after", "log"),
            ],
            vec![
                conn(("start", "trigger"), ("outer", "trigger")),
                conn(("outer", "loop_body"), ("a", "trigger")),
                conn(("a", "trigger"), ("inner", "trigger")),
                conn(("inner", "loop_body"), ("b", "trigger")),
                conn(("b", "trigger"), ("inner", "loop_back")),
                conn(("inner", "trigger"), ("outer", "loop_back")),
                conn(("outer", "trigger"), ("after", "trigger")),
            ],
        );
        let index = LoopIndex::build(&graph, &NodeRegistry::with_builtins());

        let outer: Vec<&str> = index.body("outer").unwrap().iter().map(String::as_str).collect();
        assert_eq!(outer, vec!["a", "b", "inner"]);
        let inner: Vec<&str> = index.body("inner").unwrap().iter().map(String::as_str).collect();
        assert_eq!(inner, vec!["b"]);

        assert_eq!(index.enclosing("b").count(), 2);
        assert_eq!(index.enclosing("after").count(), 0);
        assert!(index.body("a").is_none());
    }

    #[test]
    fn data_edges_do_not_extend_the_body() {
        let graph = Graph::new(
            "loop-data-out",
            vec![
                make_node("start", "start"),
                make_node("each", "for_loop"),
                make_node("dbl", "set_variable"),
                make_node("after", "log"),
                make_node("tail", "log"),
                make_node("end", "end"),
            ],
            vec![
                conn(("start", "trigger"), ("each", "trigger")),
                conn(("each", "loop_body"), ("dbl", "trigger")),
                conn(("each", "item"), ("dbl", "value")),
                conn(("dbl", "trigger"), ("each", "loop_back")),
                conn(("dbl", "value"), ("after", "message")),
                conn(("each", "trigger"), ("after", "trigger")),
                conn(("after", "trigger"), ("tail", "trigger")),
                conn(("tail", "trigger"), ("end", "trigger")),
            ],
        );
        let index = LoopIndex::build(&graph, &NodeRegistry::with_builtins());

        let body: Vec<&str> = index.body("each").unwrap().iter().map(String::as_str).collect();
        assert_eq!(body, vec!["dbl"]);
        for outside in ["after", "tail", "end"] {
            assert_eq!(index.enclosing(outside).count(), 0, "{outside} is outside the loop");
        }
        assert_eq!(index.enclosing("dbl").collect::<Vec<_>>(), vec!["each"]);
    }

    #[test]
    fn progress_reports_the_current_iteration() {
        let mut progress = LoopProgress::new(vec![json!("a"), json!("b")]);
        progress.index = 1;
        let values = progress.iteration_values().unwrap();
        assert_eq!(Value::Object(values), json!({ "item": "b", "index": 1 }));
        progress.index = 2;
        assert!(progress.iteration_values().is_none());
    }
}
