use std::path::PathBuf;

use serde_json::{json, Value};

use tokenflow_core::definition::{
    MergeSpec, MergeStrategy, Node, Synchronization, Transition, WorkflowDefinition,
};

use crate::executor::ScriptedExecutor;

pub const WORDS: [&str; 3] = ["alpha", "beta", "gamma"];

/// `start` fans out to three `write` branches that join at `gather` through
/// `sync`. Each branch writes `_branch.output.word`.
pub fn fan_out_workflow(sync: Synchronization) -> WorkflowDefinition {
    WorkflowDefinition::new("word-fan-out", "start")
        .with_node(Node::new("start", "plan"))
        .with_node(
            Node::new("write", "write_word")
                .with_input("topic", "input.topic")
                .with_output("_branch.output.word", "word")
                .with_output("_branch.output.items", "items"),
        )
        .with_node(
            Node::new("gather", "summarize")
                .with_input("words", "state.words")
                .with_output("output.summary", "summary"),
        )
        .with_transition(Transition::new("start", "write").fan_out(3, "writers"))
        .with_transition(Transition::new("write", "gather").synchronize(sync))
}

/// The canonical fan-out/fan-in: `all` strategy, append merge into `state.words`.
pub fn word_fan_out() -> WorkflowDefinition {
    fan_out_workflow(Synchronization::all("writers", append_words()))
        .with_output_mapping("words", "state.words")
}

pub fn append_words() -> MergeSpec {
    MergeSpec::new("_branch.output.word", "state.words", MergeStrategy::Append)
}

pub fn collect_items() -> MergeSpec {
    MergeSpec::new("_branch.output.items", "state.batches", MergeStrategy::Collect)
}

/// Executor answering `write` with one word per branch index.
pub fn words_executor() -> ScriptedExecutor {
    ScriptedExecutor::new().per_branch(
        "write",
        WORDS.iter().map(|w| json!({ "word": w })).collect(),
    )
}

/// Executor answering `write` with a four-element `items` array per branch.
pub fn items_executor() -> ScriptedExecutor {
    ScriptedExecutor::new().per_branch(
        "write",
        (0..3)
            .map(|b| json!({ "items": (0..4).map(|i| b * 10 + i).collect::<Vec<_>>() }))
            .collect(),
    )
}

/// Two outer branches, each fanning out into two inner branches. Inner
/// pieces merge into `state.pieces`; each outer branch then writes one
/// `_branch.output.part`, merged into `state.parts`.
pub fn nested_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("nested", "split")
        .with_node(Node::new("split", "split"))
        .with_node(Node::new("part", "part"))
        .with_node(Node::new("piece", "piece").with_output("_branch.output.piece", "piece"))
        .with_node(Node::new("assemble", "assemble").with_output("_branch.output.part", "part"))
        .with_node(Node::new("finish", "finish"))
        .with_transition(Transition::new("split", "part").fan_out(2, "outer"))
        .with_transition(Transition::new("part", "piece").fan_out(2, "inner"))
        .with_transition(Transition::new("piece", "assemble").synchronize(Synchronization::all(
            "inner",
            MergeSpec::new("_branch.output.piece", "state.pieces", MergeStrategy::Append),
        )))
        .with_transition(Transition::new("assemble", "finish").synchronize(Synchronization::all(
            "outer",
            MergeSpec::new("_branch.output.part", "state.parts", MergeStrategy::Append),
        )))
        .with_output_mapping("parts", "state.parts")
}

/// JSON form of [`word_fan_out`], as an operator would write it.
pub const WORD_FAN_OUT_JSON: &str = r#"{
  "id": "word-fan-out",
  "version": 1,
  "initialNodeRef": "start",
  "nodes": [
    { "ref": "start", "taskId": "plan" },
    {
      "ref": "write",
      "taskId": "write_word",
      "inputMapping": { "topic": "input.topic" },
      "outputMapping": { "_branch.output.word": "word" }
    },
    { "ref": "gather", "taskId": "summarize", "inputMapping": { "words": "state.words" } }
  ],
  "transitions": [
    { "fromNodeRef": "start", "toNodeRef": "write", "spawnCount": 3, "siblingGroup": "writers" },
    {
      "fromNodeRef": "write",
      "toNodeRef": "gather",
      "synchronization": {
        "strategy": "all",
        "siblingGroup": "writers",
        "timeoutMs": 2000,
        "onTimeout": "fail",
        "merge": { "source": "_branch.output.word", "target": "state.words", "strategy": "append" }
      }
    }
  ],
  "outputMapping": { "words": "state.words" }
}"#;

/// Write `content` to a fresh temp dir and return the dir guard and file path.
pub fn temp_file(name: &str, content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
    (dir, path)
}

pub fn topic_input() -> Value {
    json!({ "topic": "greek letters" })
}
