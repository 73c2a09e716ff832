//! DAG builder: turns a [`WorkflowDefinition`] into an immutable adjacency
//! structure exposing topological order, parents, children, and edge
//! lookup. Cycles and dangling edge endpoints are rejected at build time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

/// `trigger_rule` gates a child node on its parent's recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
}

/// Terminal classification recorded once per run per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Completed,
    Failed,
    Skipped,
}

impl TriggerRule {
    /// Whether this edge is "active" for the given parent outcome, ignoring
    /// the edge's condition (which is evaluated separately against run
    /// state by the executor).
    pub fn matches(&self, outcome: NodeOutcome) -> bool {
        match self {
            TriggerRule::OnSuccess => outcome == NodeOutcome::Completed,
            TriggerRule::OnFailure => outcome == NodeOutcome::Failed,
            TriggerRule::Always => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub trigger_rule: TriggerRule,
    /// Expression string; empty means "always true".
    #[serde(default)]
    pub condition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}

/// An immutable, validated DAG built from a [`WorkflowDefinition`].
#[derive(Debug, Clone)]
pub struct Dag {
    node_ids: Vec<String>,
    nodes: HashMap<String, NodeDefinition>,
    children: HashMap<String, Vec<String>>,
    parents: HashMap<String, Vec<String>>,
    edges: HashMap<(String, String), EdgeDefinition>,
    topo_order: Vec<String>,
}

impl Dag {
    /// Builds and validates a DAG from a workflow definition.
    ///
    /// Fails if any edge endpoint references an undeclared node, or if the
    /// graph contains a cycle. Isolated nodes are legal — they become
    /// roots. Topological order is deterministic: nodes at the same depth
    /// appear in declaration order, since downstream spawn order relies on
    /// it.
    pub fn build(def: &WorkflowDefinition) -> Result<Dag> {
        let mut node_ids = Vec::with_capacity(def.nodes.len());
        let mut nodes = HashMap::with_capacity(def.nodes.len());
        for node in &def.nodes {
            if nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(CoreError::Validation(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
            node_ids.push(node.id.clone());
        }

        let mut children: HashMap<String, Vec<String>> =
            node_ids.iter().map(|id| (id.clone(), Vec::new())).collect();
        let mut parents: HashMap<String, Vec<String>> =
            node_ids.iter().map(|id| (id.clone(), Vec::new())).collect();
        let mut edges = HashMap::with_capacity(def.edges.len());

        for edge in &def.edges {
            if !nodes.contains_key(&edge.from) {
                return Err(CoreError::Validation(format!(
                    "edge references undeclared node: {}",
                    edge.from
                )));
            }
            if !nodes.contains_key(&edge.to) {
                return Err(CoreError::Validation(format!(
                    "edge references undeclared node: {}",
                    edge.to
                )));
            }
            children.get_mut(&edge.from).unwrap().push(edge.to.clone());
            parents.get_mut(&edge.to).unwrap().push(edge.from.clone());
            edges.insert((edge.from.clone(), edge.to.clone()), edge.clone());
        }

        let topo_order = topological_order(&node_ids, &children)?;

        Ok(Dag {
            node_ids,
            nodes,
            children,
            parents,
            edges,
            topo_order,
        })
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> &[String] {
        &self.node_ids
    }

    /// Deterministic topological order: declaration order within each
    /// depth level.
    pub fn topological_order(&self) -> &[String] {
        &self.topo_order
    }

    pub fn parents(&self, id: &str) -> &[String] {
        self.parents.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&EdgeDefinition> {
        self.edges.get(&(from.to_string(), to.to_string()))
    }

    /// The edge incoming to `to` from `from`, used by `shouldRun` gating.
    pub fn incoming_edge(&self, from: &str, to: &str) -> Option<&EdgeDefinition> {
        self.edge(from, to)
    }
}

/// Depth-first traversal with a recursion-stack set to detect cycles, then a
/// stable depth-ordered topological sort: nodes are grouped into levels by
/// longest-path-from-a-root depth, and within a level kept in declaration
/// order.
fn topological_order(
    node_ids: &[String],
    children: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    detect_cycle(node_ids, children)?;

    let mut depth: HashMap<&str, usize> = HashMap::new();
    // Process in declaration order repeatedly until depths stabilize; the
    // graph is small in practice (workflow DAGs), so a simple relaxation
    // pass is clear and sufficient.
    for id in node_ids {
        depth.insert(id.as_str(), 0);
    }
    let mut changed = true;
    while changed {
        changed = false;
        for id in node_ids {
            let d = depth[id.as_str()];
            if let Some(kids) = children.get(id) {
                for child in kids {
                    let nd = d + 1;
                    if nd > depth[child.as_str()] {
                        depth.insert(child.as_str(), nd);
                        changed = true;
                    }
                }
            }
        }
    }

    let mut ordered: Vec<String> = node_ids.to_vec();
    ordered.sort_by_key(|id| depth[id.as_str()]);
    // `sort_by_key` is stable, so declaration order is preserved within a
    // depth level.
    Ok(ordered)
}

fn detect_cycle(node_ids: &[String], children: &HashMap<String, Vec<String>>) -> Result<()> {
    #[derive(PartialEq, Clone, Copy)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = node_ids.iter().map(|id| (id.as_str(), Mark::Unvisited)).collect();

    fn visit<'a>(
        node: &'a str,
        children: &'a HashMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<()> {
        match marks.get(node).copied() {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                return Err(CoreError::Validation(format!(
                    "cycle detected at node: {node}"
                )))
            }
            _ => {}
        }
        marks.insert(node, Mark::InProgress);
        if let Some(kids) = children.get(node) {
            for child in kids {
                visit(child, children, marks)?;
            }
        }
        marks.insert(node, Mark::Done);
        Ok(())
    }

    for id in node_ids {
        visit(id, children, &mut marks)?;
    }
    Ok(())
}

/// Nodes with no parents — always run regardless of trigger-rule gating.
pub fn is_root(dag: &Dag, id: &str) -> bool {
    dag.parents(id).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, ty: &str) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            node_type: ty.to_string(),
            config: serde_json::json!({}),
        }
    }

    fn edge(from: &str, to: &str, rule: TriggerRule) -> EdgeDefinition {
        EdgeDefinition {
            from: from.to_string(),
            to: to.to_string(),
            trigger_rule: rule,
            condition: String::new(),
        }
    }

    #[test]
    fn linear_topological_order() {
        let def = WorkflowDefinition {
            name: "w".into(),
            version: "1".into(),
            nodes: vec![node("input1", "input"), node("output1", "output")],
            edges: vec![edge("input1", "output1", TriggerRule::OnSuccess)],
        };
        let dag = Dag::build(&def).unwrap();
        assert_eq!(dag.topological_order(), &["input1", "output1"]);
    }

    #[test]
    fn dangling_edge_fails_build() {
        let def = WorkflowDefinition {
            name: "w".into(),
            version: "1".into(),
            nodes: vec![node("a", "input")],
            edges: vec![edge("a", "missing", TriggerRule::OnSuccess)],
        };
        assert!(Dag::build(&def).is_err());
    }

    #[test]
    fn cycle_fails_build() {
        let def = WorkflowDefinition {
            name: "w".into(),
            version: "1".into(),
            nodes: vec![node("a", "input"), node("b", "output")],
            edges: vec![
                edge("a", "b", TriggerRule::OnSuccess),
                edge("b", "a", TriggerRule::OnSuccess),
            ],
        };
        assert!(Dag::build(&def).is_err());
    }

    #[test]
    fn isolated_nodes_are_roots() {
        let def = WorkflowDefinition {
            name: "w".into(),
            version: "1".into(),
            nodes: vec![node("a", "input"), node("b", "input")],
            edges: vec![],
        };
        let dag = Dag::build(&def).unwrap();
        assert!(is_root(&dag, "a"));
        assert!(is_root(&dag, "b"));
    }

    #[test]
    fn declaration_order_preserved_within_depth() {
        // B, C both depend only on A — should keep declaration order B,C.
        let def = WorkflowDefinition {
            name: "w".into(),
            version: "1".into(),
            nodes: vec![
                node("a", "input"),
                node("c", "output"),
                node("b", "output"),
            ],
            edges: vec![
                edge("a", "c", TriggerRule::OnSuccess),
                edge("a", "b", TriggerRule::OnSuccess),
            ],
        };
        let dag = Dag::build(&def).unwrap();
        let order = dag.topological_order();
        assert_eq!(order[0], "a");
        assert_eq!(&order[1..], &["c", "b"]);
    }
}
