//! Runtime-type → constructor registry.
//!
//! A plain function table, no reflection: the engine resolves each node
//! definition's runtime type to a constructor and builds one
//! implementation object per node id per run. Callers can override or
//! extend the table before starting an engine.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use super::container::ContainerNode;
use super::control::{ForEachNode, IfElseNode, SwitchNode, WhileNode};
use super::leaf::{NoopNode, ScriptNode, TaskNode};
use super::shell::{ShellScriptNode, ShellTaskNode};
use super::subflow::SubflowNode;
use super::{NodeError, WorkflowNode};
use crate::definition::NodeDefinition;
use crate::types::RuntimeType;

/// Builds a node implementation from its definition.
pub type NodeConstructor =
    fn(&NodeDefinition) -> Result<Arc<dyn WorkflowNode>, NodeError>;

pub struct NodeRegistry {
    constructors: FxHashMap<RuntimeType, NodeConstructor>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl NodeRegistry {
    /// Empty registry; use [`with_builtins`](Self::with_builtins) for the
    /// standard node set.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: FxHashMap::default(),
        }
    }

    /// Registry covering every built-in runtime type.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(RuntimeType::Noop, |def| {
            Ok(Arc::new(NoopNode::from_definition(def)))
        });
        registry.register(RuntimeType::Task, |def| {
            Ok(Arc::new(TaskNode::from_definition(def)?))
        });
        registry.register(RuntimeType::Script, |def| {
            Ok(Arc::new(ScriptNode::from_definition(def)?))
        });
        registry.register(RuntimeType::ShellTask, |def| {
            Ok(Arc::new(ShellTaskNode::from_definition(def)?))
        });
        registry.register(RuntimeType::ShellScript, |def| {
            Ok(Arc::new(ShellScriptNode::from_definition(def)?))
        });
        registry.register(RuntimeType::IfElse, |def| {
            Ok(Arc::new(IfElseNode::from_definition(def)?))
        });
        registry.register(RuntimeType::Switch, |def| {
            Ok(Arc::new(SwitchNode::from_definition(def)?))
        });
        registry.register(RuntimeType::ForEach, |def| {
            Ok(Arc::new(ForEachNode::from_definition(def)?))
        });
        registry.register(RuntimeType::While, |def| {
            Ok(Arc::new(WhileNode::from_definition(def)?))
        });
        registry.register(RuntimeType::Container, |def| {
            Ok(Arc::new(ContainerNode::from_definition(def)?))
        });
        registry.register(RuntimeType::Subflow, |def| {
            Ok(Arc::new(SubflowNode::from_definition(def)?))
        });
        registry
    }

    /// Register (or override) a constructor for a runtime type.
    pub fn register(&mut self, runtime_type: RuntimeType, constructor: NodeConstructor) {
        self.constructors.insert(runtime_type, constructor);
    }

    /// Construct the implementation for one node definition.
    pub fn construct(
        &self,
        definition: &NodeDefinition,
    ) -> Result<Arc<dyn WorkflowNode>, NodeError> {
        let runtime_type = definition.runtime_type();
        let constructor = self.constructors.get(&runtime_type).ok_or_else(|| {
            NodeError::InvalidConfiguration {
                message: format!("no constructor registered for runtime type `{runtime_type}`"),
            }
        })?;
        constructor(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeConfig;

    #[test]
    fn builtins_cover_every_runtime_type() {
        let registry = NodeRegistry::with_builtins();
        for rt in RuntimeType::ALL {
            assert!(
                registry.constructors.contains_key(&rt),
                "missing constructor for {rt}"
            );
        }
    }

    #[test]
    fn constructs_matching_implementation() {
        let registry = NodeRegistry::with_builtins();
        let def = NodeDefinition::new(
            "gate",
            NodeConfig::IfElse {
                condition: "true".to_string(),
            },
        );
        let node = registry.construct(&def).unwrap();
        assert_eq!(node.runtime_type(), RuntimeType::IfElse);
        assert_eq!(node.node_id(), "gate");
        assert_eq!(node.ports(), vec!["True", "False"]);
    }

    #[test]
    fn empty_registry_rejects_construction() {
        let registry = NodeRegistry::empty();
        let def = NodeDefinition::new("n", NodeConfig::Noop);
        assert!(registry.construct(&def).is_err());
    }
}
