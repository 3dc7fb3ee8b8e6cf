//! Built-in node types that carry no business logic.

use crate::error::NodeError;
use crate::node::{DataMap, Node, NodeDefinition};
use async_trait::async_trait;

/// Prefix marking output keys that are promoted into run variables.
pub const VARIABLE_MARKER: &str = "$";

/// Returns its configuration as output.
///
/// Useful as a start or join node in approval chains whose real work happens
/// in the surrounding services.
#[derive(Debug, Clone)]
pub struct NoopNode {
    config: DataMap,
}

impl NoopNode {
    /// Registered type name.
    pub const TYPE: &'static str = "noop";

    #[must_use]
    pub fn new(definition: &NodeDefinition) -> Self {
        Self {
            config: definition.config.clone(),
        }
    }
}

#[async_trait]
impl Node for NoopNode {
    fn node_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, _input: DataMap) -> Result<DataMap, NodeError> {
        Ok(self.config.clone())
    }
}

/// Sets run variables from its configuration.
///
/// Every config entry is emitted under a marked key, so `{"approved": true}`
/// becomes the output `{"$approved": true}`.
#[derive(Debug, Clone)]
pub struct SetVariablesNode {
    config: DataMap,
}

impl SetVariablesNode {
    /// Registered type name.
    pub const TYPE: &'static str = "set_variables";

    #[must_use]
    pub fn new(definition: &NodeDefinition) -> Self {
        Self {
            config: definition.config.clone(),
        }
    }
}

#[async_trait]
impl Node for SetVariablesNode {
    fn node_type(&self) -> &str {
        Self::TYPE
    }

    fn validate(&self) -> Result<(), NodeError> {
        if self.config.is_empty() {
            return Err(NodeError::invalid_config(
                "set_variables requires at least one entry",
            ));
        }
        Ok(())
    }

    async fn execute(&self, _input: DataMap) -> Result<DataMap, NodeError> {
        Ok(self
            .config
            .iter()
            .map(|(key, value)| {
                let key = if key.starts_with(VARIABLE_MARKER) {
                    key.clone()
                } else {
                    format!("{VARIABLE_MARKER}{key}")
                };
                (key, value.clone())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn noop_returns_config() {
        let def = NodeDefinition::new("start", NoopNode::TYPE).with_config("stage", json!("draft"));
        let node = NoopNode::new(&def);
        let output = node.execute(DataMap::new()).await.expect("execute");
        assert_eq!(output.get("stage"), Some(&json!("draft")));
    }

    #[tokio::test]
    async fn set_variables_marks_keys() {
        let def = NodeDefinition::new("mark", SetVariablesNode::TYPE)
            .with_config("approved", json!(true))
            .with_config("$level", json!(2));
        let node = SetVariablesNode::new(&def);
        let output = node.execute(DataMap::new()).await.expect("execute");

        assert_eq!(output.get("$approved"), Some(&json!(true)));
        assert_eq!(output.get("$level"), Some(&json!(2)));
        assert_eq!(output.len(), 2);
    }

    #[test]
    fn set_variables_requires_entries() {
        let node = SetVariablesNode::new(&NodeDefinition::new("mark", SetVariablesNode::TYPE));
        assert!(matches!(node.validate(), Err(NodeError::InvalidConfig { .. })));
    }
}
