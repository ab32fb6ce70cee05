use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::path::{ContextPath, Section};

/// Immutable, versioned workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    pub initial_node_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_schema: Option<serde_json::Value>,
    /// Final output field -> context path.
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
}

fn default_version() -> u32 {
    1
}

/// A node runs one task. Nodes never branch; transitions do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(rename = "ref")]
    pub node_ref: String,
    pub task_id: String,
    #[serde(default = "default_task_version")]
    pub task_version: String,
    /// Task input field -> context path.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// Context path -> task output field.
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
}

fn default_task_version() -> String {
    "1".to_string()
}

impl Node {
    /// Create a new node with minimal configuration.
    pub fn new(node_ref: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            node_ref: node_ref.into(),
            task_id: task_id.into(),
            task_version: default_task_version(),
            input_mapping: BTreeMap::new(),
            output_mapping: BTreeMap::new(),
        }
    }

    /// Map a task input field from a context path.
    pub fn with_input(mut self, field: impl Into<String>, path: impl Into<String>) -> Self {
        self.input_mapping.insert(field.into(), path.into());
        self
    }

    /// Map a task output field into a context path.
    pub fn with_output(mut self, path: impl Into<String>, field: impl Into<String>) -> Self {
        self.output_mapping.insert(path.into(), field.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.task_version = version.into();
        self
    }
}

/// A directed, optionally conditional edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    /// Derived as `from->to#index` when omitted.
    #[serde(default)]
    pub id: String,
    pub from_node_ref: String,
    pub to_node_ref: String,
    /// Lower is evaluated first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sibling_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<Synchronization>,
}

impl Transition {
    /// Create an unconditional transition.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            from_node_ref: from.into(),
            to_node_ref: to.into(),
            priority: 0,
            condition: None,
            spawn_count: None,
            sibling_group: None,
            synchronization: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Spawn `count` sibling tokens belonging to cohort `sibling_group`.
    pub fn fan_out(mut self, count: u32, sibling_group: impl Into<String>) -> Self {
        self.spawn_count = Some(count);
        self.sibling_group = Some(sibling_group.into());
        self
    }

    pub fn synchronize(mut self, sync: Synchronization) -> Self {
        self.synchronization = Some(sync);
        self
    }

    /// Effective spawn count (absent means one).
    pub fn spawn_count(&self) -> u32 {
        self.spawn_count.unwrap_or(1)
    }

    pub fn is_fan_out(&self) -> bool {
        self.spawn_count() > 1
    }
}

/// Condition for taking a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Simple expression evaluated against context paths.
    /// Supported: `path == "value"`, `path != "value"`, `path contains "substr"`,
    /// `path exists`.
    Expr { expr: String },
    /// True when the path resolves to a value.
    Exists { path: String },
    /// Opaque predicate registered on the engine under this name.
    Predicate { name: String },
}

/// Fan-in block attached to the transition that joins a sibling group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Synchronization {
    #[serde(default)]
    pub strategy: SyncStrategy,
    /// Names the fan-out cohort (a transition's `siblingGroup`) being joined.
    pub sibling_group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    pub merge: MergeSpec,
}

impl Synchronization {
    pub fn all(sibling_group: impl Into<String>, merge: MergeSpec) -> Self {
        Self {
            strategy: SyncStrategy::All,
            sibling_group: sibling_group.into(),
            timeout_ms: None,
            on_timeout: TimeoutPolicy::Fail,
            merge,
        }
    }

    pub fn any(sibling_group: impl Into<String>, merge: MergeSpec) -> Self {
        Self {
            strategy: SyncStrategy::Any,
            ..Self::all(sibling_group, merge)
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64, policy: TimeoutPolicy) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self.on_timeout = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Every branch index must arrive.
    #[default]
    All,
    /// The first arrival completes the group.
    Any,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    #[default]
    Fail,
    ProceedWithAvailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    /// Per-branch source, conventionally `_branch.output...`.
    pub source: String,
    /// Shared `state.*` or `output.*` path receiving the merged sequence.
    pub target: String,
    pub strategy: MergeStrategy,
}

impl MergeSpec {
    pub fn new(source: impl Into<String>, target: impl Into<String>, strategy: MergeStrategy) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            strategy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Push each branch value; array values are spliced in element by element.
    Append,
    /// Push each branch value as one element, composites kept whole.
    Collect,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, initial_node_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            nodes: vec![],
            transitions: vec![],
            initial_node_ref: initial_node_ref.into(),
            input_schema: None,
            output_schema: None,
            context_schema: None,
            output_mapping: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_output_mapping(mut self, field: impl Into<String>, path: impl Into<String>) -> Self {
        self.output_mapping.insert(field.into(), path.into());
        self
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Parse a JSON definition, fill derived transition ids and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let def: WorkflowDefinition = serde_json::from_str(json)?;
        def.normalized()
    }

    /// Load a JSON definition from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowError::InvalidDefinition(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Fill missing transition ids and run structural validation.
    pub fn normalized(mut self) -> Result<Self> {
        for (idx, t) in self.transitions.iter_mut().enumerate() {
            if t.id.is_empty() {
                t.id = format!("{}->{}#{}", t.from_node_ref, t.to_node_ref, idx);
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// `"<id>@<version>"`, the reference stored in run records.
    pub fn reference(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }

    pub fn node(&self, node_ref: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_ref == node_ref)
    }

    pub fn transition(&self, id: &str) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.id == id)
    }

    /// Outgoing transitions in evaluation order: priority ascending, ties in
    /// declaration order.
    pub fn outgoing(&self, node_ref: &str) -> Vec<&Transition> {
        let mut out: Vec<&Transition> = self
            .transitions
            .iter()
            .filter(|t| t.from_node_ref == node_ref)
            .collect();
        out.sort_by_key(|t| t.priority);
        out
    }

    /// Names of every predicate referenced by a condition.
    pub fn predicate_names(&self) -> Vec<&str> {
        self.transitions
            .iter()
            .filter_map(|t| match &t.condition {
                Some(Condition::Predicate { name }) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Structural checks. Runs before any token is created.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FlowError::InvalidDefinition(msg));

        if self.nodes.is_empty() {
            return invalid("workflow has no nodes".into());
        }

        let mut refs = HashSet::new();
        for node in &self.nodes {
            if node.node_ref.is_empty() {
                return invalid("node with empty ref".into());
            }
            if !refs.insert(node.node_ref.as_str()) {
                return invalid(format!("duplicate node ref '{}'", node.node_ref));
            }
            for (field, path) in &node.input_mapping {
                check_path(path, &format!("node '{}' input '{}'", node.node_ref, field))?;
            }
            for path in node.output_mapping.keys() {
                let parsed = check_path(path, &format!("node '{}' output", node.node_ref))?;
                if parsed.section() == Section::Input {
                    return invalid(format!(
                        "node '{}' maps output into read-only path '{}'",
                        node.node_ref, path
                    ));
                }
            }
        }

        if !refs.contains(self.initial_node_ref.as_str()) {
            return invalid(format!("initial node '{}' not found", self.initial_node_ref));
        }

        let cohorts: HashSet<&str> = self
            .transitions
            .iter()
            .filter(|t| t.is_fan_out())
            .filter_map(|t| t.sibling_group.as_deref())
            .collect();

        let mut ids = HashSet::new();
        for t in &self.transitions {
            if !ids.insert(t.id.as_str()) {
                return invalid(format!("duplicate transition id '{}'", t.id));
            }
            for endpoint in [&t.from_node_ref, &t.to_node_ref] {
                if !refs.contains(endpoint.as_str()) {
                    return invalid(format!("transition '{}' references unknown node '{}'", t.id, endpoint));
                }
            }
            if t.spawn_count == Some(0) {
                return invalid(format!("transition '{}' has spawnCount 0", t.id));
            }
            if t.is_fan_out() && t.sibling_group.as_deref().map_or(true, str::is_empty) {
                return invalid(format!("fan-out transition '{}' needs a siblingGroup", t.id));
            }
            if let Some(Condition::Exists { path }) = &t.condition {
                check_path(path, &format!("transition '{}' condition", t.id))?;
            }
            if let Some(sync) = &t.synchronization {
                if t.is_fan_out() {
                    return invalid(format!(
                        "transition '{}' cannot both fan out and synchronize",
                        t.id
                    ));
                }
                if !cohorts.contains(sync.sibling_group.as_str()) {
                    return invalid(format!(
                        "transition '{}' synchronizes unknown sibling group '{}'",
                        t.id, sync.sibling_group
                    ));
                }
                if sync.timeout_ms == Some(0) {
                    return invalid(format!("transition '{}' has timeoutMs 0", t.id));
                }
                check_path(&sync.merge.source, &format!("transition '{}' merge source", t.id))?;
                let target = check_path(&sync.merge.target, &format!("transition '{}' merge target", t.id))?;
                if !matches!(target.section(), Section::State | Section::Output) || target.is_section_root() {
                    return invalid(format!(
                        "transition '{}' merge target '{}' must be below state or output",
                        t.id, sync.merge.target
                    ));
                }
            }
        }

        for (field, path) in &self.output_mapping {
            check_path(path, &format!("output field '{}'", field))?;
        }

        Ok(())
    }
}

fn check_path(path: &str, what: &str) -> Result<ContextPath> {
    ContextPath::parse(path)
        .map_err(|_| FlowError::InvalidDefinition(format!("{}: malformed path '{}'", what, path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan_in_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("words", "start")
            .with_node(Node::new("start", "seed"))
            .with_node(Node::new("work", "generate-word"))
            .with_node(Node::new("join", "summarize"))
            .with_transition(Transition::new("start", "work").fan_out(3, "writers"))
            .with_transition(Transition::new("work", "join").synchronize(Synchronization::all(
                "writers",
                MergeSpec::new("_branch.output.word", "state.words", MergeStrategy::Append),
            )))
    }

    #[test]
    fn test_builder_definition_validates() {
        let def = fan_in_definition().normalized().unwrap();
        assert_eq!(def.transitions[0].id, "start->work#0");
        assert_eq!(def.reference(), "words@1");
        assert!(def.transitions[0].is_fan_out());
    }

    #[test]
    fn test_outgoing_sorted_by_priority_then_declaration() {
        let def = WorkflowDefinition::new("p", "a")
            .with_node(Node::new("a", "t"))
            .with_node(Node::new("b", "t"))
            .with_node(Node::new("c", "t"))
            .with_node(Node::new("d", "t"))
            .with_transition(Transition::new("a", "b").with_id("late").with_priority(5))
            .with_transition(Transition::new("a", "c").with_id("first").with_priority(1))
            .with_transition(Transition::new("a", "d").with_id("tie").with_priority(5));
        let ids: Vec<&str> = def.outgoing("a").iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "late", "tie"]);
    }

    #[test]
    fn test_parse_json_definition() {
        let json = r#"{
            "id": "wf",
            "initialNodeRef": "start",
            "nodes": [
                {"ref": "start", "taskId": "seed", "outputMapping": {"state.topic": "topic"}},
                {"ref": "work", "taskId": "write", "inputMapping": {"topic": "state.topic"}},
                {"ref": "join", "taskId": "sum"}
            ],
            "transitions": [
                {"fromNodeRef": "start", "toNodeRef": "work", "spawnCount": 2, "siblingGroup": "w",
                 "condition": {"type": "expr", "expr": "state.topic exists"}},
                {"fromNodeRef": "work", "toNodeRef": "join",
                 "synchronization": {"strategy": "all", "siblingGroup": "w", "timeoutMs": 500,
                    "onTimeout": "proceed_with_available",
                    "merge": {"source": "_branch.output", "target": "state.results", "strategy": "collect"}}}
            ],
            "outputMapping": {"results": "state.results"}
        }"#;
        let def = WorkflowDefinition::from_json(json).unwrap();
        assert_eq!(def.nodes[0].output_mapping["state.topic"], "topic");
        let sync = def.transitions[1].synchronization.as_ref().unwrap();
        assert_eq!(sync.on_timeout, TimeoutPolicy::ProceedWithAvailable);
        assert_eq!(sync.merge.strategy, MergeStrategy::Collect);
        assert!(matches!(def.transitions[0].condition, Some(Condition::Expr { .. })));
    }

    #[test]
    fn test_rejects_unknown_cohort() {
        let def = WorkflowDefinition::new("bad", "a")
            .with_node(Node::new("a", "t"))
            .with_node(Node::new("b", "t"))
            .with_transition(Transition::new("a", "b").synchronize(Synchronization::all(
                "ghost",
                MergeSpec::new("_branch.output", "state.x", MergeStrategy::Append),
            )));
        let err = def.normalized().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_rejects_fan_out_with_sync_and_bad_targets() {
        let merge = MergeSpec::new("_branch.output", "input.x", MergeStrategy::Append);
        let def = WorkflowDefinition::new("bad", "a")
            .with_node(Node::new("a", "t"))
            .with_node(Node::new("b", "t"))
            .with_node(Node::new("c", "t"))
            .with_transition(Transition::new("a", "b").fan_out(2, "g"))
            .with_transition(Transition::new("b", "c").synchronize(Synchronization::all("g", merge)));
        assert!(def.normalized().unwrap_err().to_string().contains("merge target"));

        let both = WorkflowDefinition::new("bad", "a")
            .with_node(Node::new("a", "t"))
            .with_node(Node::new("b", "t"))
            .with_transition(Transition::new("a", "b").fan_out(2, "g").synchronize(
                Synchronization::all(
                    "g",
                    MergeSpec::new("_branch.output", "state.x", MergeStrategy::Append),
                ),
            ));
        assert!(both.normalized().is_err());
    }

    #[test]
    fn test_rejects_structural_errors() {
        assert!(WorkflowDefinition::new("empty", "a").normalized().is_err());

        let missing_initial = WorkflowDefinition::new("x", "nope").with_node(Node::new("a", "t"));
        assert!(missing_initial.normalized().is_err());

        let dup = WorkflowDefinition::new("x", "a")
            .with_node(Node::new("a", "t"))
            .with_node(Node::new("a", "t"));
        assert!(dup.normalized().is_err());

        let dangling = WorkflowDefinition::new("x", "a")
            .with_node(Node::new("a", "t"))
            .with_transition(Transition::new("a", "zzz"));
        assert!(dangling.normalized().is_err());

        let bad_path = WorkflowDefinition::new("x", "a")
            .with_node(Node::new("a", "t").with_input("q", "state..q"));
        assert!(bad_path.normalized().is_err());

        let write_input = WorkflowDefinition::new("x", "a")
            .with_node(Node::new("a", "t").with_output("input.q", "q"));
        assert!(write_input.normalized().is_err());
    }

    #[test]
    fn test_predicate_names() {
        let def = WorkflowDefinition::new("x", "a")
            .with_node(Node::new("a", "t"))
            .with_node(Node::new("b", "t"))
            .with_transition(
                Transition::new("a", "b").with_condition(Condition::Predicate { name: "ready".into() }),
            );
        assert_eq!(def.predicate_names(), vec!["ready"]);
    }
}
