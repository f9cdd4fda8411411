//! Scenario description: the node graph supplied by the workflow editor.
//!
//! A scenario is a list of [`NodeConfig`] entries plus a directed edge list
//! from one node's output port to another node's input port. It is loaded
//! from JSON or YAML and checked against a [`ProcessorRegistry`] before a
//! replay session accepts it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenflow_nodes::ProcessorRegistry;
use tokenflow_types::{Edge, NodeConfig, NodeId, NodeType};
use tracing::warn;

/// Errors that can occur when loading or validating a scenario.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// Failed to read the scenario file.
    #[error("failed to read scenario file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse JSON content.
    #[error("failed to parse scenario JSON: {source}")]
    Json {
        /// The underlying parse error.
        #[from]
        source: serde_json::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse scenario YAML: {source}")]
    Yaml {
        /// The underlying parse error.
        #[from]
        source: serde_yml::Error,
    },

    /// Two nodes share an id.
    #[error("duplicate node id: {id}")]
    DuplicateNode {
        /// The repeated id.
        id: NodeId,
    },

    /// A node's type has no registered processor.
    #[error("node {node} has type {node_type} with no registered processor")]
    UnregisteredType {
        /// The node.
        node: NodeId,
        /// Its type.
        node_type: NodeType,
    },

    /// An edge names a node that is not declared.
    #[error("edge references unknown node {node}")]
    UnknownNode {
        /// The missing node.
        node: NodeId,
    },
}

/// A node graph: configurations plus directed edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Node configurations.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Directed edges between ports.
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Scenario {
    /// Build a scenario from parts.
    pub const fn new(nodes: Vec<NodeConfig>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Parse a scenario from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Json`] if the text is not a valid scenario.
    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a scenario from YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Yaml`] if the text is not a valid scenario.
    pub fn from_yaml(yaml: &str) -> Result<Self, ScenarioError> {
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Load a scenario file. `.json` files are parsed as JSON, anything
    /// else as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::Io`] if the file cannot be read, or a parse
    /// error for malformed content.
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    /// Check node ids, processor registration and edge endpoints.
    ///
    /// Edges naming a port the node does not declare are tolerated and
    /// only logged.
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found.
    pub fn validate(&self, registry: &ProcessorRegistry) -> Result<(), ScenarioError> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(ScenarioError::DuplicateNode {
                    id: node.id.clone(),
                });
            }
            if !registry.contains(node.node_type) {
                return Err(ScenarioError::UnregisteredType {
                    node: node.id.clone(),
                    node_type: node.node_type,
                });
            }
        }

        let by_id: BTreeMap<&NodeId, &NodeConfig> =
            self.nodes.iter().map(|n| (&n.id, n)).collect();
        for edge in &self.edges {
            let source = by_id.get(&edge.source).ok_or_else(|| ScenarioError::UnknownNode {
                node: edge.source.clone(),
            })?;
            let target = by_id.get(&edge.target).ok_or_else(|| ScenarioError::UnknownNode {
                node: edge.target.clone(),
            })?;
            if !source.outputs.contains(&edge.source_port) {
                warn!(
                    node = %edge.source,
                    port = %edge.source_port,
                    "Edge leaves undeclared output port"
                );
            }
            if !target.inputs.contains(&edge.target_port) {
                warn!(
                    node = %edge.target,
                    port = %edge.target_port,
                    "Edge enters undeclared input port"
                );
            }
        }
        Ok(())
    }

    /// Look up a node's configuration.
    pub fn node(&self, id: &NodeId) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Edges leaving `node` on `port`, in declaration order.
    pub fn outgoing<'a>(
        &'a self,
        node: &'a NodeId,
        port: &'a str,
    ) -> impl Iterator<Item = &'a Edge> {
        self.edges
            .iter()
            .filter(move |e| &e.source == node && e.source_port == port)
    }

    /// Ids of every node of `node_type`.
    pub fn nodes_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &NodeId> {
        self.nodes
            .iter()
            .filter(move |n| n.node_type == node_type)
            .map(|n| &n.id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
nodes:
  - id: src
    type: data_source
    params: { value: 5 }
  - id: mux
    type: multiplexer
    outputs: [a, b]
  - id: left
    type: sink
  - id: right
    type: sink
edges:
  - { source: src, target: mux }
  - { source: mux, sourcePort: a, target: left }
  - { source: mux, sourcePort: b, target: right }
"#;

    #[test]
    fn yaml_scenario_loads_and_validates() {
        let scenario = Scenario::from_yaml(PIPELINE).unwrap();
        assert_eq!(scenario.nodes.len(), 4);
        scenario.validate(&ProcessorRegistry::standard()).unwrap();

        let mux = NodeId::new("mux");
        let targets: Vec<_> = scenario.outgoing(&mux, "b").map(|e| e.target.as_str()).collect();
        assert_eq!(targets, ["right"]);
        assert_eq!(
            scenario.nodes_of_type(NodeType::DataSource).collect::<Vec<_>>(),
            [&NodeId::new("src")]
        );
    }

    #[test]
    fn json_round_trips_through_yaml_shape() {
        let scenario = Scenario::from_yaml(PIPELINE).unwrap();
        let json = serde_json::to_string(&scenario).unwrap();
        assert_eq!(Scenario::from_json(&json).unwrap(), scenario);
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let scenario = Scenario::from_yaml(PIPELINE).unwrap();
        assert!(matches!(
            scenario.validate(&ProcessorRegistry::empty()),
            Err(ScenarioError::UnregisteredType { .. })
        ));
    }

    #[test]
    fn duplicate_and_dangling_nodes_are_rejected() {
        let dup = Scenario::new(
            vec![
                NodeConfig::new("x", NodeType::Sink),
                NodeConfig::new("x", NodeType::Sink),
            ],
            Vec::new(),
        );
        assert!(matches!(
            dup.validate(&ProcessorRegistry::standard()),
            Err(ScenarioError::DuplicateNode { .. })
        ));

        let dangling = Scenario::new(
            vec![NodeConfig::new("x", NodeType::Sink)],
            vec![Edge::new("x", "out", "ghost", "in")],
        );
        assert!(matches!(
            dangling.validate(&ProcessorRegistry::standard()),
            Err(ScenarioError::UnknownNode { .. })
        ));
    }
}
