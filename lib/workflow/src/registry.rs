//! Node type registry.
//!
//! Maps a node type name to the factory that builds runnable nodes. Lookups
//! vastly outnumber registrations, so the map sits behind a reader/writer lock.

use crate::builtin::{NoopNode, SetVariablesNode};
use crate::error::{NodeError, RegistryError};
use crate::node::{Node, NodeDefinition, NodeFactory};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Registry of node factories keyed by type name.
#[derive(Default)]
pub struct NodeRegistry {
    factories: RwLock<HashMap<String, NodeFactory>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in `noop` and `set_variables` types.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        // Fresh registry: the built-in names cannot collide.
        let _ = registry.register(NoopNode::TYPE, noop_factory);
        let _ = registry.register(SetVariablesNode::TYPE, set_variables_factory);
        registry
    }

    /// Registers a factory closure for a node type.
    ///
    /// # Errors
    ///
    /// Returns `TypeAlreadyRegistered` if the type name is taken.
    pub fn register<F>(&self, node_type: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&NodeDefinition) -> Result<Arc<dyn Node>, NodeError> + Send + Sync + 'static,
    {
        self.register_factory(node_type, Arc::new(factory))
    }

    /// Registers an already shared factory for a node type.
    ///
    /// # Errors
    ///
    /// Returns `TypeAlreadyRegistered` if the type name is taken.
    pub fn register_factory(
        &self,
        node_type: impl Into<String>,
        factory: NodeFactory,
    ) -> Result<(), RegistryError> {
        let node_type = node_type.into();
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if factories.contains_key(&node_type) {
            return Err(RegistryError::TypeAlreadyRegistered { node_type });
        }

        debug!(node_type = %node_type, "registered node type");
        factories.insert(node_type, factory);
        Ok(())
    }

    /// Removes a node type. Returns true if it was registered.
    pub fn unregister(&self, node_type: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_type)
            .is_some()
    }

    /// Returns true if the node type is registered.
    #[must_use]
    pub fn is_registered(&self, node_type: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(node_type)
    }

    /// Returns the registered type names, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Instantiates and validates the node described by `definition`.
    ///
    /// # Errors
    ///
    /// Returns `TypeNotRegistered` for an unknown type, or `InvalidNodeConfig`
    /// if the factory or the node's own validation rejects the configuration.
    pub fn create(&self, definition: &NodeDefinition) -> Result<Arc<dyn Node>, RegistryError> {
        let factory = {
            let factories = self
                .factories
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            factories
                .get(&definition.node_type)
                .cloned()
                .ok_or_else(|| RegistryError::TypeNotRegistered {
                    node_type: definition.node_type.clone(),
                })?
        };

        let invalid = |e: NodeError| RegistryError::InvalidNodeConfig {
            node_id: definition.id.clone(),
            reason: e.to_string(),
        };

        let node = factory(definition).map_err(invalid)?;
        node.validate().map_err(invalid)?;
        Ok(node)
    }
}

fn noop_factory(definition: &NodeDefinition) -> Result<Arc<dyn Node>, NodeError> {
    Ok(Arc::new(NoopNode::new(definition)))
}

fn set_variables_factory(definition: &NodeDefinition) -> Result<Arc<dyn Node>, NodeError> {
    Ok(Arc::new(SetVariablesNode::new(definition)))
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("types", &self.types())
            .finish()
    }
}
