use tokenflow_core::definition::{
    Condition, MergeStrategy, Node, SyncStrategy, TimeoutPolicy, Transition, WorkflowDefinition,
};
use tokenflow_core::error::FlowError;
use tokenflow_test_utils::{temp_file, word_fan_out, WORD_FAN_OUT_JSON};

#[test]
fn test_load_definition_from_file() {
    let (_dir, path) = temp_file("words.json", WORD_FAN_OUT_JSON);
    let def = WorkflowDefinition::load(&path).expect("load definition");

    assert_eq!(def.reference(), "word-fan-out@1");
    assert_eq!(def.nodes.len(), 3);

    let fan_out = &def.transitions[0];
    assert_eq!(fan_out.id, "start->write#0");
    assert!(fan_out.is_fan_out());
    assert_eq!(fan_out.spawn_count(), 3);

    let sync = def.transitions[1].synchronization.as_ref().expect("sync block");
    assert_eq!(sync.strategy, SyncStrategy::All);
    assert_eq!(sync.timeout_ms, Some(2000));
    assert_eq!(sync.on_timeout, TimeoutPolicy::Fail);
    assert_eq!(sync.merge.strategy, MergeStrategy::Append);
    assert_eq!(def.output_mapping.get("words").map(String::as_str), Some("state.words"));
}

#[test]
fn test_builder_and_json_agree() {
    let built = word_fan_out().normalized().expect("valid");
    let parsed = WorkflowDefinition::from_json(WORD_FAN_OUT_JSON).expect("valid");
    assert_eq!(built.id, parsed.id);
    let ids = |d: &WorkflowDefinition| d.transitions.iter().map(|t| t.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&built), ids(&parsed));
}

#[test]
fn test_conditions_deserialize() {
    let json = r#"{
      "id": "cond", "initialNodeRef": "a",
      "nodes": [{"ref": "a", "taskId": "t"}, {"ref": "b", "taskId": "t"}, {"ref": "c", "taskId": "t"}],
      "transitions": [
        {"fromNodeRef": "a", "toNodeRef": "b", "priority": 1,
         "condition": {"type": "expr", "expr": "state.route == \"b\""}},
        {"fromNodeRef": "a", "toNodeRef": "c", "priority": 2,
         "condition": {"type": "predicate", "name": "always"}}
      ]
    }"#;
    let def = WorkflowDefinition::from_json(json).expect("valid");
    assert_eq!(
        def.transitions[0].condition,
        Some(Condition::Expr { expr: "state.route == \"b\"".into() })
    );
    assert_eq!(def.predicate_names(), vec!["always"]);
}

#[test]
fn test_invalid_definitions_are_rejected() {
    let missing_initial = WorkflowDefinition::new("bad", "nowhere").with_node(Node::new("a", "t"));
    assert!(matches!(missing_initial.normalized(), Err(FlowError::InvalidDefinition(_))));

    let dangling = WorkflowDefinition::new("bad", "a")
        .with_node(Node::new("a", "t"))
        .with_transition(Transition::new("a", "ghost"));
    assert!(matches!(dangling.normalized(), Err(FlowError::InvalidDefinition(_))));

    let unreadable = WorkflowDefinition::load(std::path::Path::new("/no/such/definition.json"));
    assert!(matches!(unreadable, Err(FlowError::InvalidDefinition(_))));

    assert!(WorkflowDefinition::from_json("{ not json").is_err());
}
