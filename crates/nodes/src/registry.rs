//! Node type catalog.
//!
//! Maps type tags to a [`NodeTypeDefinition`] (config schema, default ports)
//! and the [`ExecutableNode`] implementing it. Instances created through the
//! registry have their config validated against the schema and their ports
//! deep-copied from the definition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::RegistryError;
use crate::models::{DataType, Graph, Node, Port, PortDirection, Position};
use crate::traits::ExecutableNode;
use crate::validation::{self, ValidationReport};

// ---------------------------------------------------------------------------
// Config schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    /// One of [`ConfigField::options`].
    Select,
    /// An expression source string.
    Expression,
    /// A string that may contain `{{ }}` placeholders.
    Template,
    /// Any JSON value.
    Json,
}

/// One field of a node type's config schema.
#[derive(Debug, Clone)]
pub struct ConfigField {
    pub key: String,
    pub kind: FieldKind,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub options: Vec<String>,
    pub required: bool,
}

impl ConfigField {
    pub fn new(key: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            key: key.into(),
            kind,
            default: None,
            min: None,
            max: None,
            options: Vec::new(),
            required: false,
        }
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Check `value` against this field's kind, range and options.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self.kind {
            FieldKind::Number | FieldKind::Integer => {
                let n = value.as_f64().ok_or_else(|| format!("expected a number, got {value}"))?;
                if self.kind == FieldKind::Integer && n.fract() != 0.0 {
                    return Err(format!("expected an integer, got {n}"));
                }
                if let Some(min) = self.min.filter(|min| n < *min) {
                    return Err(format!("{n} is below the minimum {min}"));
                }
                if let Some(max) = self.max.filter(|max| n > *max) {
                    return Err(format!("{n} is above the maximum {max}"));
                }
                Ok(())
            }
            FieldKind::Boolean if !value.is_boolean() => Err(format!("expected a boolean, got {value}")),
            FieldKind::String | FieldKind::Expression | FieldKind::Template if !value.is_string() => {
                Err(format!("expected a string, got {value}"))
            }
            FieldKind::Select => match value.as_str() {
                Some(s) if self.options.iter().any(|o| o == s) => Ok(()),
                _ => Err(format!("{value} is not one of [{}]", self.options.join(", "))),
            },
            _ => Ok(()),
        }
    }
}

/// A family of identically-typed ports whose size comes from a config field,
/// e.g. a sync node's `in_0..in_{n-1}`.
#[derive(Debug, Clone)]
pub struct VariadicPorts {
    pub direction: PortDirection,
    pub count_field: String,
    pub prefix: String,
    pub data_type: DataType,
}

impl VariadicPorts {
    pub fn port_id(&self, index: usize) -> String {
        format!("{}{index}", self.prefix)
    }

    /// Index encoded in `port_id`, if it belongs to this family.
    pub fn index_of(&self, port_id: &str) -> Option<usize> {
        port_id.strip_prefix(self.prefix.as_str())?.parse().ok()
    }

    pub fn build(&self, count: usize) -> Vec<Port> {
        (0..count)
            .map(|i| {
                let id = self.port_id(i);
                match self.direction {
                    PortDirection::Input => Port::input(id, self.data_type),
                    PortDirection::Output => Port::output(id, self.data_type),
                }
            })
            .collect()
    }
}

/// Everything the registry knows about one node type.
#[derive(Debug, Clone)]
pub struct NodeTypeDefinition {
    pub type_tag: String,
    pub label: String,
    pub category: String,
    pub description: String,
    pub config_schema: Vec<ConfigField>,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    pub variadic: Option<VariadicPorts>,
    /// Applied when the node config carries no `timeout`.
    pub default_timeout: Option<Duration>,
}

impl NodeTypeDefinition {
    pub fn new(type_tag: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            label: label.into(),
            category: "general".into(),
            description: String::new(),
            config_schema: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            variadic: None,
            default_timeout: None,
        }
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = category.to_owned();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_owned();
        self
    }

    pub fn field(mut self, field: ConfigField) -> Self {
        self.config_schema.push(field);
        self
    }

    pub fn input(mut self, port: Port) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: Port) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn variadic(mut self, ports: VariadicPorts) -> Self {
        self.variadic = Some(ports);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn schema_field(&self, key: &str) -> Option<&ConfigField> {
        self.config_schema.iter().find(|f| f.key == key)
    }

    /// Size of the variadic port family configured on `node`; `None` when
    /// the count field is out of its schema range.
    pub fn variadic_count(&self, node: &Node) -> Option<usize> {
        let variadic = self.variadic.as_ref()?;
        let field = self.schema_field(&variadic.count_field);
        if let (Some(field), Some(value)) = (field, node.config.get(&variadic.count_field)) {
            field.check(value).ok()?;
        }
        let configured = node.config_u64(&variadic.count_field).or_else(|| {
            self.schema_field(&variadic.count_field)
                .and_then(|f| f.default.as_ref())
                .and_then(Value::as_u64)
        })?;
        usize::try_from(configured).ok()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RegistryEntry {
    definition: Arc<NodeTypeDefinition>,
    executor: Arc<dyn ExecutableNode>,
}

/// Type tag → definition + executor.
#[derive(Default)]
pub struct NodeRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in node type registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_builtins(&mut registry);
        registry
    }

    /// Register (or replace) a node type.
    pub fn register(&mut self, definition: NodeTypeDefinition, executor: Arc<dyn ExecutableNode>) {
        let tag = definition.type_tag.clone();
        if self.entries.contains_key(&tag) {
            debug!(node_type = %tag, "replacing registered node type");
        }
        self.entries.insert(tag, RegistryEntry { definition: Arc::new(definition), executor });
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.entries.contains_key(node_type)
    }

    pub fn definition(&self, node_type: &str) -> Option<&NodeTypeDefinition> {
        self.entries.get(node_type).map(|e| e.definition.as_ref())
    }

    pub fn executor(&self, node_type: &str) -> Option<Arc<dyn ExecutableNode>> {
        self.entries.get(node_type).map(|e| Arc::clone(&e.executor))
    }

    /// All definitions, sorted by type tag.
    pub fn definitions(&self) -> Vec<&NodeTypeDefinition> {
        let mut defs: Vec<_> = self.entries.values().map(|e| e.definition.as_ref()).collect();
        defs.sort_by(|a, b| a.type_tag.cmp(&b.type_tag));
        defs
    }

    /// Instantiate a configured node of `node_type`.
    ///
    /// # Errors
    /// - [`RegistryError::UnknownNodeType`] if the type is not registered.
    /// - [`RegistryError::InvalidNodeConfig`] if an override fails schema
    ///   validation or a required field is left unset.
    pub fn create_instance(
        &self,
        node_type: &str,
        id: impl Into<String>,
        config_overrides: Map<String, Value>,
        position: Position,
    ) -> Result<Node, RegistryError> {
        let def = self
            .definition(node_type)
            .ok_or_else(|| RegistryError::UnknownNodeType(node_type.to_owned()))?;

        let invalid = |field: &str, reason: String| RegistryError::InvalidNodeConfig {
            node_type: node_type.to_owned(),
            field: field.to_owned(),
            reason,
        };

        let mut config = Map::new();
        for field in &def.config_schema {
            if let Some(default) = &field.default {
                config.insert(field.key.clone(), default.clone());
            }
        }
        for (key, value) in config_overrides {
            if let Some(field) = def.schema_field(&key) {
                field.check(&value).map_err(|reason| invalid(&key, reason))?;
            }
            config.insert(key, value);
        }
        if let Some(missing) = def
            .config_schema
            .iter()
            .find(|f| f.required && config.get(&f.key).map_or(true, Value::is_null))
        {
            return Err(invalid(&missing.key, "required field is not set".into()));
        }

        let mut node = Node {
            id: id.into(),
            node_type: node_type.to_owned(),
            config,
            position,
            label: def.label.clone(),
            locked: false,
            inputs: def.inputs.clone(),
            outputs: def.outputs.clone(),
        };

        if let (Some(variadic), Some(count)) = (&def.variadic, def.variadic_count(&node)) {
            let ports = variadic.build(count);
            match variadic.direction {
                PortDirection::Input => node.inputs.extend(ports),
                PortDirection::Output => node.outputs.extend(ports),
            }
        }

        Ok(node)
    }

    /// Effective ports of `node` on one side: its own port list when it
    /// carries one, otherwise the definition's defaults plus any variadic
    /// family sized from the node's config.
    pub fn ports(&self, node: &Node, direction: PortDirection) -> Vec<Port> {
        let own = match direction {
            PortDirection::Input => &node.inputs,
            PortDirection::Output => &node.outputs,
        };
        if !own.is_empty() {
            return own.clone();
        }
        let Some(def) = self.definition(&node.node_type) else {
            return Vec::new();
        };
        let mut ports = match direction {
            PortDirection::Input => def.inputs.clone(),
            PortDirection::Output => def.outputs.clone(),
        };
        if let (Some(variadic), Some(count)) = (&def.variadic, def.variadic_count(node)) {
            if variadic.direction == direction {
                ports.extend(variadic.build(count));
            }
        }
        ports
    }

    /// Structural validation shared by loader, editor and engine.
    pub fn validate(&self, graph: &Graph) -> ValidationReport {
        validation::validate_graph(graph, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use serde_json::json;

    fn overrides(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = NodeRegistry::with_builtins();
        let err = registry
            .create_instance("teleport", "n1", Map::new(), Position::default())
            .unwrap_err();
        assert_eq!(err, RegistryError::UnknownNodeType("teleport".into()));
    }

    #[test]
    fn defaults_are_merged_under_overrides() {
        let registry = NodeRegistry::with_builtins();
        let node = registry
            .create_instance(builtin::END, "done", overrides(json!({ "outputKey": "answer" })), Position::default())
            .unwrap();
        assert_eq!(node.config["outputKey"], json!("answer"));
        assert_eq!(node.config["success"], json!(true));
    }

    #[test]
    fn out_of_range_number_is_invalid() {
        let registry = NodeRegistry::with_builtins();
        let err = registry
            .create_instance(builtin::SYNC, "s", overrides(json!({ "inputCount": 0 })), Position::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidNodeConfig { field, .. } if field == "inputCount"));
    }

    #[test]
    fn wrong_type_is_invalid() {
        let registry = NodeRegistry::with_builtins();
        let err = registry
            .create_instance(builtin::END, "e", overrides(json!({ "success": "yes" })), Position::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidNodeConfig { .. }));
    }

    #[test]
    fn select_rejects_unknown_option() {
        let registry = NodeRegistry::with_builtins();
        let err = registry
            .create_instance(builtin::LOG, "l", overrides(json!({ "message": "hi", "level": "loud" })), Position::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidNodeConfig { field, .. } if field == "level"));
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let registry = NodeRegistry::with_builtins();
        let err = registry
            .create_instance(builtin::CONDITION, "c", Map::new(), Position::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidNodeConfig { field, .. } if field == "expression"));
    }

    #[test]
    fn variadic_ports_follow_config() {
        let registry = NodeRegistry::with_builtins();
        let sync = registry
            .create_instance(builtin::SYNC, "s", overrides(json!({ "inputCount": 3 })), Position::default())
            .unwrap();
        let ids: Vec<_> = sync.inputs.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["in_0", "in_1", "in_2"]);

        let branch = registry
            .create_instance(builtin::BRANCH, "b", Map::new(), Position::default())
            .unwrap();
        assert_eq!(branch.outputs.iter().filter(|p| p.id.starts_with("out_")).count(), 2);
    }

    #[test]
    fn ports_are_copied_per_instance() {
        let registry = NodeRegistry::with_builtins();
        let mut a = registry.create_instance(builtin::START, "a", Map::new(), Position::default()).unwrap();
        let b = registry.create_instance(builtin::START, "b", Map::new(), Position::default()).unwrap();
        a.outputs.clear();
        assert!(!b.outputs.is_empty());
        assert!(!registry.definition(builtin::START).unwrap().outputs.is_empty());
    }

    #[test]
    fn re_registering_overwrites() {
        let mut registry = NodeRegistry::with_builtins();
        let before = registry.definitions().len();
        let executor = registry.executor(builtin::LOG).unwrap();
        registry.register(NodeTypeDefinition::new(builtin::LOG, "Reloaded log"), executor);
        assert_eq!(registry.definitions().len(), before);
        assert_eq!(registry.definition(builtin::LOG).unwrap().label, "Reloaded log");
    }
}
