//! Workflow node definitions and the runtime node contract.
//!
//! A `NodeDefinition` is the declarative part stored with a workflow. The
//! embedding application supplies behavior by implementing [`Node`] and
//! registering a [`NodeFactory`] for each type name.

use crate::error::NodeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// JSON object used for node inputs, outputs, configuration and variables.
pub type DataMap = serde_json::Map<String, JsonValue>;

/// Identifier of a node, unique within one workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Retry behavior for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay between attempts, in milliseconds.
    pub delay_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            backoff_multiplier,
        }
    }

    /// A policy that runs a node exactly once.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Attempts to make, never less than one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// `base * attempt * multiplier`, never shorter than `base`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_ms as f64;
        let scaled = base * f64::from(attempt) * self.backoff_multiplier;
        let millis = if scaled.is_finite() { scaled.max(base) } else { base };
        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Declarative definition of a node inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique ID within the workflow.
    pub id: NodeId,
    /// Display name.
    pub name: String,
    /// Registered node type name.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Type-specific configuration.
    #[serde(default)]
    pub config: DataMap,
    /// Disabled nodes are skipped at run time.
    #[serde(default)]
    pub disabled: bool,
    /// Overrides the engine's default retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Overrides the engine's default per-attempt timeout, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl NodeDefinition {
    /// Creates a node definition with an empty configuration.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            node_type: node_type.into(),
            config: DataMap::new(),
            disabled: false,
            retry_policy: None,
            timeout_ms: None,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets a configuration entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Sets the retry policy override.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the per-attempt timeout override.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Marks the node as disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Returns the timeout override, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Runtime behavior of a node type.
///
/// Implemented by the embedding application. Instances are created per run by
/// the registered [`NodeFactory`] and may be executed several times when the
/// node is retried.
#[async_trait]
pub trait Node: Send + Sync {
    /// The registered type name of this node.
    fn node_type(&self) -> &str;

    /// Checks the node's own configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing why the configuration is unusable.
    fn validate(&self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Executes the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node's work failed; the executor may retry it.
    async fn execute(&self, input: DataMap) -> Result<DataMap, NodeError>;
}

/// Builds a node instance from its definition.
pub type NodeFactory =
    Arc<dyn Fn(&NodeDefinition) -> Result<Arc<dyn Node>, NodeError> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_grows_with_attempt_and_multiplier() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), 2.0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn backoff_is_floored_at_base_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), 0.5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));

        let policy = RetryPolicy::new(3, Duration::from_millis(100), 0.0);
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(100));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO, 1.0);
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn node_definition_deserializes_with_defaults() {
        let node: NodeDefinition = serde_json::from_value(json!({
            "id": "notify",
            "name": "Notify manager",
            "type": "notification",
        }))
        .expect("deserialize");

        assert_eq!(node.id, NodeId::new("notify"));
        assert_eq!(node.node_type, "notification");
        assert!(node.config.is_empty());
        assert!(!node.disabled);
        assert!(node.retry_policy.is_none());
        assert!(node.timeout().is_none());
    }

    #[test]
    fn node_definition_builder() {
        let node = NodeDefinition::new("approve", "approval")
            .with_name("Manager approval")
            .with_config("level", json!(1))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(10), 2.0))
            .with_timeout(Duration::from_secs(5));

        assert_eq!(node.name, "Manager approval");
        assert_eq!(node.config.get("level"), Some(&json!(1)));
        assert_eq!(node.retry_policy.as_ref().map(|p| p.max_attempts), Some(3));
        assert_eq!(node.timeout(), Some(Duration::from_secs(5)));
    }
}
