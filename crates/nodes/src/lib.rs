//! `nodes` crate: the graph model, the node type registry and the built-in
//! node implementations.
//!
//! Every node, built-in and plugin alike, implements [`ExecutableNode`] and
//! is registered in a [`NodeRegistry`] under its type tag. The engine crate
//! dispatches execution through that trait object, handing each call the
//! run's shared [`ExecutionContext`].

pub mod builtin;
pub mod context;
pub mod error;
pub mod expression;
pub mod local;
pub mod mock;
pub mod models;
pub mod registry;
pub mod retry;
pub mod template;
pub mod traits;
pub mod validation;

pub use context::ExecutionContext;
pub use error::{ContextError, NodeError, RegistryError};
pub use models::{Connection, DataType, Endpoint, Graph, Node, NodeExecutionState, NodeStatus, Port, PortDirection};
pub use registry::{NodeRegistry, NodeTypeDefinition};
pub use traits::{AgentAllocator, EventBus, ExecutableNode, NodeInputs, NodeOutput};
pub use validation::{GraphValidationError, ValidationReport};
