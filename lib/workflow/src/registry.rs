//! The set of node types a process can execute.

use crate::builtin;
use crate::error::RegistryError;
use crate::node::{NodeMeta, NodeType};
use crate::platform::Platform;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Node types keyed by type name.
///
/// The registry is an explicit value passed to the engine and the workers;
/// registration is additive and a name can only be taken once.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    types: HashMap<String, Arc<dyn NodeType>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in control nodes.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for node_type in builtin::all() {
            // builtin names are distinct
            let _ = registry.register_arc(node_type);
        }
        registry
    }

    /// Registers a node type under the name in its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if the name is taken.
    pub fn register(&mut self, node_type: impl NodeType + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(node_type))
    }

    /// Registers a shared node type.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if the name is taken.
    pub fn register_arc(&mut self, node_type: Arc<dyn NodeType>) -> Result<(), RegistryError> {
        let type_name = node_type.meta().type_name;
        if self.types.contains_key(&type_name) {
            return Err(RegistryError::AlreadyRegistered { type_name });
        }
        debug!(node_type = %type_name, "registered node type");
        self.types.insert(type_name, node_type);
        Ok(())
    }

    /// Looks up a node type.
    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<Arc<dyn NodeType>> {
        self.types.get(type_name).cloned()
    }

    /// Returns true if `type_name` is registered.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Returns true if the type is registered and may branch.
    #[must_use]
    pub fn can_branch(&self, type_name: &str) -> bool {
        self.types
            .get(type_name)
            .is_some_and(|node_type| node_type.meta().can_branch)
    }

    /// Returns the metadata of every registered type, sorted by name.
    #[must_use]
    pub fn metas(&self) -> Vec<NodeMeta> {
        let mut metas: Vec<_> = self.types.values().map(|t| t.meta()).collect();
        metas.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        metas
    }

    /// Initializes every registered node type.
    ///
    /// # Errors
    ///
    /// Returns the first initialization failure.
    pub async fn initialize_all(&self, platform: &Platform) -> Result<(), RegistryError> {
        for (type_name, node_type) in &self.types {
            node_type.initialize(platform).await.map_err(|message| {
                RegistryError::InitializationFailed {
                    type_name: type_name.clone(),
                    message,
                }
            })?;
        }
        info!(count = self.types.len(), "node types initialized");
        Ok(())
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.types.keys().collect();
        names.sort();
        f.debug_struct("NodeRegistry").field("types", &names).finish()
    }
}
