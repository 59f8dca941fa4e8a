// src/flow.rs

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::Direction::{Incoming, Outgoing};
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::bit::{BitKind, BitRegistry};
use crate::guard::Guard;
use crate::ledger::WALL_POST;
use crate::template::lookup_path;

/// Reserved id for the trigger inside edge declarations.
pub const TRIGGER_ID: &str = "trigger";

/// A tenant-authored flow document, as it arrives over the wire.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowDoc {
    pub id: String,
    /// Tenant/namespace the flow belongs to.
    pub panel: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Tariff key debited when a live run is admitted.
    #[serde(default = "default_tariff")]
    pub tariff: String,
}

fn default_version() -> u32 {
    1
}

fn default_tariff() -> String {
    WALL_POST.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerSpec {
    #[serde(rename = "type")]
    pub bit: String,
    #[serde(rename = "match", default)]
    pub match_on: MatchPredicate,
}

/// Dotted-path equality predicate, shared by triggers and `Filter.Match`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct MatchPredicate(pub BTreeMap<String, Value>);

impl MatchPredicate {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every path equals its expected value. An empty predicate
    /// matches everything.
    pub fn matches(&self, payload: &Value) -> bool {
        self.0
            .iter()
            .all(|(path, want)| lookup_path(payload, path) == Some(want))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub bit: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    /// Guard expression over upstream node results.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

fn empty_params() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("node `{node}` references unknown bit `{bit}`")]
    UnknownBit { node: String, bit: String },
    #[error("invalid params on node `{node}`: {message}")]
    Params { node: String, message: String },
    #[error("invalid guard on node `{node}`: {message}")]
    Guard { node: String, message: String },
    #[error("edge `{from}` -> `{to}` references an undeclared node")]
    DanglingEdge { from: String, to: String },
    #[error("flow contains a cycle through: {}", members.join(", "))]
    Cycle { members: Vec<String> },
}

impl FlowError {
    /// Stable kind tag surfaced in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Parse(_) => "parse",
            FlowError::UnknownBit { .. } => "unknown_bit",
            FlowError::Params { .. } => "invalid_params",
            FlowError::Guard { .. } => "invalid_guard",
            FlowError::DanglingEdge { .. } => "dangling_edge",
            FlowError::Cycle { .. } => "cycle",
        }
    }
}

/// A validated flow: the document plus everything the engine consumes.
/// Holds a fixed topological order (ties broken by declaration order),
/// per-node dependency lists, parsed guards, and the set reachable from
/// the trigger.
#[derive(Debug, Clone)]
pub struct CompiledFlow {
    doc: FlowDoc,
    order: Vec<String>,
    deps: HashMap<String, Vec<String>>,
    guards: HashMap<String, Guard>,
    reachable: HashSet<String>,
    warnings: Vec<String>,
}

impl CompiledFlow {
    pub fn id(&self) -> &str {
        &self.doc.id
    }

    pub fn panel(&self) -> &str {
        &self.doc.panel
    }

    pub fn tariff(&self) -> &str {
        &self.doc.tariff
    }

    pub fn trigger(&self) -> &TriggerSpec {
        &self.doc.trigger
    }

    pub fn doc(&self) -> &FlowDoc {
        &self.doc
    }

    /// Node ids in execution order; the trigger is not included.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.doc.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn guard(&self, node_id: &str) -> Option<&Guard> {
        self.guards.get(node_id)
    }

    /// Upstream node ids (the trigger is never listed).
    pub fn deps(&self, node_id: &str) -> &[String] {
        self.deps.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_reachable(&self, node_id: &str) -> bool {
        self.reachable.contains(node_id)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Compile a raw JSON document. Shape errors become `FlowError::Parse`.
pub fn compile_json(value: &Value, registry: &BitRegistry) -> Result<CompiledFlow, FlowError> {
    let doc: FlowDoc =
        serde_json::from_value(value.clone()).map_err(|e| FlowError::Parse(e.to_string()))?;
    compile(doc, registry)
}

/// Validate a flow document and build its execution graph. Checks run in a
/// fixed order so the first reported failure is deterministic:
/// structure, bit resolution, params, guards, edges, cycles.
pub fn compile(doc: FlowDoc, registry: &BitRegistry) -> Result<CompiledFlow, FlowError> {
    // 1) structural sanity beyond what serde enforces
    let mut seen = HashSet::new();
    for node in &doc.nodes {
        if node.id.is_empty() {
            return Err(FlowError::Parse("node with empty id".into()));
        }
        if node.id == TRIGGER_ID {
            return Err(FlowError::Parse(format!("node id `{TRIGGER_ID}` is reserved")));
        }
        if !seen.insert(node.id.clone()) {
            return Err(FlowError::Parse(format!("duplicate node id `{}`", node.id)));
        }
    }

    // 2) every bit resolves; the trigger really is a trigger, nodes are not
    let trigger_bit = registry.get(&doc.trigger.bit).ok_or_else(|| FlowError::UnknownBit {
        node: TRIGGER_ID.to_string(),
        bit: doc.trigger.bit.clone(),
    })?;
    if trigger_bit.kind != BitKind::Trigger {
        return Err(FlowError::Parse(format!(
            "bit `{}` is not a trigger",
            doc.trigger.bit
        )));
    }
    for node in &doc.nodes {
        let bit = registry.get(&node.bit).ok_or_else(|| FlowError::UnknownBit {
            node: node.id.clone(),
            bit: node.bit.clone(),
        })?;
        if bit.kind == BitKind::Trigger {
            return Err(FlowError::Parse(format!(
                "node `{}` uses trigger bit `{}` outside the trigger position",
                node.id, node.bit
            )));
        }
        bit.validate_params(&node.params)
            .map_err(|message| FlowError::Params { node: node.id.clone(), message })?;
    }

    // 3) guards parse up front so runs never hit a syntax error
    let mut guards = HashMap::new();
    for node in &doc.nodes {
        if let Some(raw) = &node.guard {
            let guard = Guard::parse(raw).map_err(|e| FlowError::Guard {
                node: node.id.clone(),
                message: e.to_string(),
            })?;
            for referenced in guard.referenced_nodes() {
                if referenced != TRIGGER_ID && !seen.contains(&referenced) {
                    return Err(FlowError::Guard {
                        node: node.id.clone(),
                        message: format!("references undeclared node `{referenced}`"),
                    });
                }
            }
            guards.insert(node.id.clone(), guard);
        }
    }

    // 4) edges reference declared ids only
    for edge in &doc.edges {
        let from_ok = edge.from == TRIGGER_ID || seen.contains(&edge.from);
        let to_ok = seen.contains(&edge.to);
        if !from_ok || !to_ok {
            return Err(FlowError::DanglingEdge { from: edge.from.clone(), to: edge.to.clone() });
        }
    }

    // 5) build the graph; the trigger is a real node
    let mut graph: StableDiGraph<String, ()> = StableDiGraph::new();
    let mut index_of: HashMap<String, NodeIndex> = HashMap::new();
    let mut decl_of: HashMap<NodeIndex, usize> = HashMap::new();

    let trigger_idx = graph.add_node(TRIGGER_ID.to_string());
    index_of.insert(TRIGGER_ID.to_string(), trigger_idx);
    decl_of.insert(trigger_idx, 0);

    for (position, node) in doc.nodes.iter().enumerate() {
        let idx = graph.add_node(node.id.clone());
        index_of.insert(node.id.clone(), idx);
        decl_of.insert(idx, position + 1);
    }

    let explicit_trigger_edges = doc.edges.iter().any(|e| e.from == TRIGGER_ID);
    for edge in &doc.edges {
        let from = index_of[&edge.from];
        let to = index_of[&edge.to];
        graph.update_edge(from, to, ());
    }
    if !explicit_trigger_edges {
        // documents usually leave roots unattached; hang them off the
        // trigger so a parentless first node is runnable as written
        let roots: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&ix| {
                ix != trigger_idx && graph.neighbors_directed(ix, Incoming).next().is_none()
            })
            .collect();
        for root in roots {
            graph.update_edge(trigger_idx, root, ());
        }
    }

    // 6) cycles: any strongly-connected component bigger than one node
    for component in tarjan_scc(&graph) {
        let cyclic =
            component.len() > 1 || component.iter().any(|&ix| graph.find_edge(ix, ix).is_some());
        if cyclic {
            let mut members: Vec<(usize, String)> = component
                .iter()
                .map(|&ix| (decl_of[&ix], graph[ix].clone()))
                .collect();
            members.sort();
            return Err(FlowError::Cycle {
                members: members.into_iter().map(|(_, id)| id).collect(),
            });
        }
    }

    // 7) Kahn's algorithm, always taking the earliest-declared ready node
    let mut indegree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|ix| (ix, graph.neighbors_directed(ix, Incoming).count()))
        .collect();
    let mut ready: Vec<NodeIndex> = indegree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&ix, _)| ix)
        .collect();
    let mut order = Vec::with_capacity(doc.nodes.len());
    while !ready.is_empty() {
        ready.sort_by_key(|ix| decl_of[ix]);
        let next = ready.remove(0);
        if next != trigger_idx {
            order.push(graph[next].clone());
        }
        for succ in graph.neighbors_directed(next, Outgoing) {
            let deg = indegree.get_mut(&succ).expect("indegree entry");
            *deg -= 1;
            if *deg == 0 {
                ready.push(succ);
            }
        }
    }

    // 8) reachability from the trigger; unreachable nodes compile but are a
    // warning and will always be skipped
    let mut reachable = HashSet::new();
    let mut stack = vec![trigger_idx];
    while let Some(ix) = stack.pop() {
        for succ in graph.neighbors_directed(ix, Outgoing) {
            if reachable.insert(graph[succ].clone()) {
                stack.push(succ);
            }
        }
    }
    let mut warnings = Vec::new();
    for node in &doc.nodes {
        if !reachable.contains(&node.id) {
            warn!(flow = %doc.id, node = %node.id, "node is unreachable from the trigger");
            warnings.push(format!("node `{}` is unreachable from the trigger", node.id));
        }
    }

    let mut deps: HashMap<String, Vec<String>> = HashMap::new();
    for node in &doc.nodes {
        let ix = index_of[&node.id];
        let mut upstream: Vec<(usize, String)> = graph
            .neighbors_directed(ix, Incoming)
            .filter(|&pred| pred != trigger_idx)
            .map(|pred| (decl_of[&pred], graph[pred].clone()))
            .collect();
        upstream.sort();
        deps.insert(node.id.clone(), upstream.into_iter().map(|(_, id)| id).collect());
    }

    Ok(CompiledFlow { doc, order, deps, guards, reachable, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> BitRegistry {
        BitRegistry::with_builtins()
    }

    fn diamond_doc() -> Value {
        json!({
            "id": "flow_diamond",
            "panel": "user",
            "trigger": { "type": "Trigger.NewPost", "match": { "panel": "user" } },
            "nodes": [
                { "id": "a", "type": "Enrich.Merge", "params": { "with": { "k": 1 } } },
                { "id": "b", "type": "Enrich.Merge", "params": { "with": { "k": 2 } } },
                { "id": "c", "type": "Enrich.Merge", "params": { "with": { "k": 3 } } },
                { "id": "d", "type": "Enrich.Merge", "params": { "with": { "k": 4 } } }
            ],
            "edges": [
                { "from": "a", "to": "b" },
                { "from": "a", "to": "c" },
                { "from": "b", "to": "d" },
                { "from": "c", "to": "d" }
            ]
        })
    }

    #[test]
    fn topological_order_respects_every_edge() {
        let flow = compile_json(&diamond_doc(), &registry()).unwrap();
        let position = |id: &str| flow.order().iter().position(|n| n == id).unwrap();

        for (from, to) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")] {
            assert!(position(from) < position(to), "{from} must precede {to}");
        }
        // ties broken by declaration order: b before c
        assert!(position("b") < position("c"));
    }

    #[test]
    fn missing_trigger_is_a_parse_error() {
        let doc = json!({ "id": "f", "panel": "p", "nodes": [], "edges": [] });
        match compile_json(&doc, &registry()) {
            Err(e @ FlowError::Parse(_)) => assert_eq!(e.kind(), "parse"),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_bit_reports_the_offending_node() {
        let doc = json!({
            "id": "f", "panel": "p",
            "trigger": { "type": "Trigger.NewPost" },
            "nodes": [ { "id": "n1", "type": "Action.DoesNotExist" } ],
            "edges": []
        });
        match compile_json(&doc, &registry()) {
            Err(FlowError::UnknownBit { node, bit }) => {
                assert_eq!(node, "n1");
                assert_eq!(bit, "Action.DoesNotExist");
            }
            other => panic!("expected unknown bit, got {:?}", other),
        }
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let doc = json!({
            "id": "f", "panel": "p",
            "trigger": { "type": "Trigger.NewPost" },
            "nodes": [ { "id": "n1", "type": "Enrich.Merge", "params": { "with": {} } } ],
            "edges": [ { "from": "n1", "to": "ghost" } ]
        });
        match compile_json(&doc, &registry()) {
            Err(FlowError::DanglingEdge { from, to }) => {
                assert_eq!(from, "n1");
                assert_eq!(to, "ghost");
            }
            other => panic!("expected dangling edge, got {:?}", other),
        }
    }

    #[test]
    fn cycle_names_its_members() {
        let doc = json!({
            "id": "f", "panel": "p",
            "trigger": { "type": "Trigger.NewPost" },
            "nodes": [
                { "id": "n1", "type": "Enrich.Merge", "params": { "with": {} } },
                { "id": "n2", "type": "Enrich.Merge", "params": { "with": {} } }
            ],
            "edges": [
                { "from": "n1", "to": "n2" },
                { "from": "n2", "to": "n1" }
            ]
        });
        match compile_json(&doc, &registry()) {
            Err(FlowError::Cycle { members }) => {
                assert_eq!(members, vec!["n1".to_string(), "n2".to_string()]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn invalid_params_report_schema_violation() {
        let doc = json!({
            "id": "f", "panel": "p",
            "trigger": { "type": "Trigger.NewPost" },
            "nodes": [ { "id": "n1", "type": "Delay.For", "params": { "ms": "soon" } } ],
            "edges": []
        });
        match compile_json(&doc, &registry()) {
            Err(FlowError::Params { node, .. }) => assert_eq!(node, "n1"),
            other => panic!("expected params error, got {:?}", other),
        }
    }

    #[test]
    fn bad_guard_is_rejected_at_compile_time() {
        let doc = json!({
            "id": "f", "panel": "p",
            "trigger": { "type": "Trigger.NewPost" },
            "nodes": [
                { "id": "n1", "type": "Enrich.Merge", "params": { "with": {} } },
                { "id": "n2", "type": "Enrich.Merge", "params": { "with": {} }, "if": "n1.running" }
            ],
            "edges": [ { "from": "n1", "to": "n2" } ]
        });
        match compile_json(&doc, &registry()) {
            Err(FlowError::Guard { node, .. }) => assert_eq!(node, "n2"),
            other => panic!("expected guard error, got {:?}", other),
        }
    }

    #[test]
    fn guard_referencing_undeclared_node_is_rejected() {
        let doc = json!({
            "id": "f", "panel": "p",
            "trigger": { "type": "Trigger.NewPost" },
            "nodes": [
                { "id": "n1", "type": "Enrich.Merge", "params": { "with": {} }, "if": "ghost.succeeded" }
            ],
            "edges": []
        });
        assert!(matches!(compile_json(&doc, &registry()), Err(FlowError::Guard { .. })));
    }

    #[test]
    fn unreachable_node_is_a_warning_not_an_error() {
        // n1 hangs off the trigger explicitly, so the parentless n2 is
        // unreachable rather than implicitly attached
        let doc = json!({
            "id": "f", "panel": "p",
            "trigger": { "type": "Trigger.NewPost" },
            "nodes": [
                { "id": "n1", "type": "Enrich.Merge", "params": { "with": {} } },
                { "id": "n2", "type": "Enrich.Merge", "params": { "with": {} } }
            ],
            "edges": [ { "from": "trigger", "to": "n1" } ]
        });
        let flow = compile_json(&doc, &registry()).unwrap();
        assert!(flow.is_reachable("n1"));
        assert!(!flow.is_reachable("n2"));
        assert_eq!(flow.warnings().len(), 1);
        assert!(flow.warnings()[0].contains("n2"));
    }

    #[test]
    fn roots_implicitly_attach_to_the_trigger() {
        let flow = compile_json(&diamond_doc(), &registry()).unwrap();
        assert!(flow.is_reachable("a"));
        assert!(flow.is_reachable("d"));
        assert!(flow.warnings().is_empty());
        // a has no upstream node; d depends on both middles
        assert!(flow.deps("a").is_empty());
        assert_eq!(flow.deps("d"), &["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn match_predicate_walks_dotted_paths() {
        let predicate =
            MatchPredicate(BTreeMap::from([("post.panel".to_string(), json!("user"))]));
        assert!(predicate.matches(&json!({ "post": { "panel": "user" } })));
        assert!(!predicate.matches(&json!({ "post": { "panel": "ops" } })));
        assert!(!predicate.matches(&json!({})));
        assert!(MatchPredicate::default().matches(&json!({ "anything": 1 })));
    }
}
