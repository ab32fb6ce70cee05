use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use tokenflow_core::definition::{
    MergeSpec, MergeStrategy, Synchronization, TimeoutPolicy, WorkflowDefinition,
};
use tokenflow_core::error::Result;
use tokenflow_core::trace::TraceKind;
use tokenflow_core::traits::{Executor, TaskRequest};
use tokenflow_core::types::{RunStatus, TokenId, TokenStatus};
use tokenflow_engine::{Engine, RunOutcome, TraceQuery};
use tokenflow_test_utils::{
    append_words, collect_items, fan_out_workflow, items_executor, nested_workflow, topic_input,
    word_fan_out, words_executor, ScriptedExecutor, WORDS,
};

fn assert_single_root(outcome: &RunOutcome) {
    let roots: Vec<_> = outcome.tokens.iter().filter(|t| t.parent_token_id.is_none()).collect();
    assert_eq!(roots.len(), 1, "exactly one root token");
    let ids: HashSet<_> = outcome.tokens.iter().map(|t| t.id.clone()).collect();
    for t in &outcome.tokens {
        if let Some(parent) = &t.parent_token_id {
            assert!(ids.contains(parent), "parent of {} resolves", t.id);
        }
    }
}

fn count_status(outcome: &RunOutcome, node: &str, status: TokenStatus) -> usize {
    outcome.tokens_at(node).iter().filter(|t| t.status == status).count()
}

#[tokio::test]
async fn test_word_fan_out_end_to_end() {
    let executor = Arc::new(words_executor());
    let engine = Engine::new(executor.clone());

    let outcome = engine
        .start(word_fan_out(), topic_input())
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.tokens.len(), 8, "root + 3 branches + 3 arrivals + continuation");
    assert_single_root(&outcome);
    assert!(outcome.tokens.iter().all(|t| t.status == TokenStatus::Completed));

    let words = json!(WORDS);
    assert_eq!(outcome.read("state.words"), Some(words.clone()));
    assert_eq!(outcome.output().unwrap().get("words"), Some(&words));

    // Three arrivals plus one continuation at the join node
    let at_gather = outcome.tokens_at("gather");
    assert_eq!(at_gather.len(), 4);
    let continuation = at_gather
        .iter()
        .find(|t| !t.origin_token_ids.is_empty())
        .expect("continuation token");
    assert_eq!(continuation.origin_token_ids.len(), 3);
    assert!(continuation.sibling_group.is_none());
    assert_eq!(continuation.parent_token_id.as_ref(), outcome.tokens_at("start").first().map(|t| &t.id));

    // Branch tokens carry consistent indexes
    let mut indexes: Vec<u32> = outcome
        .tokens_at("write")
        .iter()
        .map(|t| t.branch_index.unwrap())
        .collect();
    indexes.sort();
    assert_eq!(indexes, vec![0, 1, 2]);

    // The join task sees the merged words; each branch saw the run input
    let gather_calls = executor.calls_for("gather");
    assert_eq!(gather_calls.len(), 1);
    assert_eq!(gather_calls[0].input["words"], words);
    for call in executor.calls_for("write") {
        assert_eq!(call.input["topic"], "greek letters");
    }

    // Merged branches are disposed
    assert_eq!(outcome.read("_branch"), Some(json!({})));
    assert_eq!(outcome.trace.of_kind(TraceKind::BranchDisposed).len(), 3);
    assert_eq!(outcome.trace.of_kind(TraceKind::MergeApplied).len(), 1);
    assert_eq!(outcome.trace.last().unwrap().kind, TraceKind::WorkflowCompleted);
}

#[tokio::test]
async fn test_trace_sequence_is_gapless() {
    let engine = Engine::new(Arc::new(words_executor()));
    let outcome = engine.start(word_fan_out(), topic_input()).unwrap().wait().await.unwrap();

    let sequences: Vec<u64> = outcome.trace.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=outcome.trace.len() as u64).collect();
    assert_eq!(sequences, expected);
    assert_eq!(outcome.trace[0].kind, TraceKind::WorkflowStarted);
}

#[tokio::test(start_paused = true)]
async fn test_arrival_order_does_not_change_merge() {
    let orders: [[u64; 3]; 3] = [[10, 20, 30], [30, 10, 20], [20, 30, 10]];
    for delays in orders {
        let mut executor = words_executor();
        for (idx, ms) in delays.iter().enumerate() {
            executor = executor.branch_delay("write", idx as u32, Duration::from_millis(*ms));
        }
        let engine = Engine::new(Arc::new(executor));
        let outcome = engine.start(word_fan_out(), topic_input()).unwrap().wait().await.unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.read("state.words"), Some(json!(WORDS)));

        let arrivals = outcome.trace.of_kind(TraceKind::ArrivalRecorded);
        assert_eq!(arrivals.len(), 3, "count(arrivals) == branchTotal");
        let arrival_order: Vec<u64> = arrivals
            .iter()
            .map(|e| e.payload["branchIndex"].as_u64().unwrap())
            .collect();
        let mut by_delay: Vec<(u64, u64)> = delays.iter().enumerate().map(|(i, d)| (*d, i as u64)).collect();
        by_delay.sort();
        let expected: Vec<u64> = by_delay.into_iter().map(|(_, i)| i).collect();
        assert_eq!(arrival_order, expected);
    }
}

#[tokio::test]
async fn test_collect_keeps_arrays_whole() {
    let def = fan_out_workflow(Synchronization::all("writers", collect_items()));
    let engine = Engine::new(Arc::new(items_executor()));
    let outcome = engine.start(def, topic_input()).unwrap().wait().await.unwrap();

    let batches = outcome.read("state.batches").unwrap();
    let batches = batches.as_array().unwrap();
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|b| b.as_array().map(Vec::len) == Some(4)));
    assert_eq!(batches[1], json!([10, 11, 12, 13]));
}

#[tokio::test]
async fn test_append_splices_arrays() {
    let merge = MergeSpec::new("_branch.output.items", "state.flat", MergeStrategy::Append);
    let def = fan_out_workflow(Synchronization::all("writers", merge));
    let engine = Engine::new(Arc::new(items_executor()));
    let outcome = engine.start(def, topic_input()).unwrap().wait().await.unwrap();

    let flat = outcome.read("state.flat").unwrap();
    assert_eq!(flat.as_array().map(Vec::len), Some(12));
    assert_eq!(flat[4], json!(10));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fail_fails_run() {
    let executor = words_executor()
        .branch_delay("write", 0, Duration::from_millis(150))
        .branch_delay("write", 1, Duration::from_millis(5000))
        .branch_delay("write", 2, Duration::from_millis(5000));
    let def = fan_out_workflow(
        Synchronization::all("writers", append_words()).with_timeout(2000, TimeoutPolicy::Fail),
    );
    let engine = Engine::new(Arc::new(executor));

    let started = tokio::time::Instant::now();
    let outcome = engine.start(def, topic_input()).unwrap().wait().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(elapsed >= Duration::from_millis(2000), "failed after the timeout, not before");
    assert!(elapsed < Duration::from_millis(3000), "failed well before the slow branches");

    let failure = outcome.failure.as_ref().unwrap();
    assert_eq!(failure.kind, "synchronization_timeout");
    assert_eq!(failure.node_ref.as_deref(), Some("gather"));

    // Slow branches timed out; the fast one arrived and was waiting
    assert_eq!(count_status(&outcome, "write", TokenStatus::TimedOut), 2);
    assert_eq!(count_status(&outcome, "write", TokenStatus::Completed), 1);
    let waited = outcome
        .trace
        .of_kind(TraceKind::TokenStatusChanged)
        .iter()
        .filter(|e| e.payload["to"] == "waiting_for_siblings")
        .count();
    assert_eq!(waited, 1);
    assert_eq!(outcome.trace.of_kind(TraceKind::SyncTimedOut).len(), 1);
    assert!(outcome.tokens.iter().all(|t| t.is_terminal()));
    assert!(outcome.output().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_proceeds_with_available() {
    let executor = words_executor()
        .branch_delay("write", 0, Duration::from_millis(150))
        .branch_delay("write", 1, Duration::from_millis(5000))
        .branch_delay("write", 2, Duration::from_millis(5000));
    let def = fan_out_workflow(
        Synchronization::all("writers", append_words())
            .with_timeout(2000, TimeoutPolicy::ProceedWithAvailable),
    )
    .with_output_mapping("words", "state.words");
    let engine = Engine::new(Arc::new(executor));

    let outcome = engine.start(def, topic_input()).unwrap().wait().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.read("state.words"), Some(json!(["alpha"])));
    assert_eq!(count_status(&outcome, "write", TokenStatus::TimedOut), 2);
    assert_eq!(count_status(&outcome, "gather", TokenStatus::Completed), 2);

    let merged = outcome.trace.of_kind(TraceKind::SyncCompleted);
    assert_eq!(merged[0].payload["reason"], "timeout");
    assert_eq!(merged[0].payload["arrived"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_alarm_cancelled_when_group_completes_in_time() {
    let executor = words_executor().delayed("write", Duration::from_millis(100));
    let def = fan_out_workflow(
        Synchronization::all("writers", append_words()).with_timeout(2000, TimeoutPolicy::Fail),
    );
    let engine = Engine::new(Arc::new(executor));
    let outcome = engine.start(def, topic_input()).unwrap().wait().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.trace.of_kind(TraceKind::AlarmArmed).len(), 1);
    assert_eq!(outcome.trace.of_kind(TraceKind::AlarmCancelled).len(), 1);
    assert!(outcome.trace.of_kind(TraceKind::SyncTimedOut).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_any_merges_first_arrival_and_cancels_the_rest() {
    let executor = words_executor()
        .branch_delay("write", 0, Duration::from_millis(100))
        .branch_delay("write", 2, Duration::from_millis(100))
        .delayed("gather", Duration::from_millis(500));
    let def = fan_out_workflow(Synchronization::any("writers", append_words()));
    let engine = Engine::new(Arc::new(executor));

    let outcome = engine.start(def, topic_input()).unwrap().wait().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.read("state.words"), Some(json!(["beta"])));
    assert_eq!(count_status(&outcome, "write", TokenStatus::Cancelled), 2);
    assert_eq!(outcome.tokens.len(), 6, "root + 3 branches + 1 arrival + continuation");
    // Late results from cancelled branches are discarded
    assert_eq!(outcome.trace.of_kind(TraceKind::ResultDiscarded).len(), 2);
}

#[tokio::test]
async fn test_nested_fan_out_returns_to_outer_branch() {
    let executor = ScriptedExecutor::new()
        .per_branch("piece", vec![json!({"piece": "p0"}), json!({"piece": "p1"})])
        .per_branch("assemble", vec![json!({"part": "left"}), json!({"part": "right"})]);
    let engine = Engine::new(Arc::new(executor));

    let outcome = engine.start(nested_workflow(), json!({})).unwrap().wait().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_single_root(&outcome);
    assert_eq!(outcome.read("state.parts"), Some(json!(["left", "right"])));
    assert_eq!(outcome.read("state.pieces").and_then(|p| p.as_array().map(Vec::len)), Some(4));

    // Continuations of the inner joins sit in the outer branches
    let assemble: Vec<_> = outcome
        .tokens_at("assemble")
        .into_iter()
        .filter(|t| !t.origin_token_ids.is_empty())
        .collect();
    assert_eq!(assemble.len(), 2);
    for t in &assemble {
        assert!(t.sibling_group.as_deref().unwrap().starts_with("outer:"));
        assert_eq!(t.branch_total, Some(2));
    }
    let finish = outcome.tokens_at("finish");
    let final_join: Vec<_> = finish.iter().filter(|t| !t.origin_token_ids.is_empty()).collect();
    assert_eq!(final_join.len(), 1);
    assert!(final_join[0].sibling_group.is_none());
}

/// Delays every `piece` task fanned out under one outer branch of
/// `nested_workflow`.
struct SlowOuterBranch {
    scripted: Arc<ScriptedExecutor>,
    slow_branch: u32,
    delay: Duration,
    /// `part` token -> outer branch index.
    parts: Mutex<HashMap<TokenId, u32>>,
}

impl SlowOuterBranch {
    fn new(slow_branch: u32, delay: Duration) -> Self {
        let scripted = ScriptedExecutor::new()
            .per_branch("piece", vec![json!({"piece": "p0"}), json!({"piece": "p1"})])
            .per_branch("assemble", vec![json!({"part": "left"}), json!({"part": "right"})]);
        Self {
            scripted: Arc::new(scripted),
            slow_branch,
            delay,
            parts: Mutex::new(HashMap::new()),
        }
    }

    fn delay_for(&self, request: &TaskRequest) -> Duration {
        let Some(branch) = request.branch.as_ref() else {
            return Duration::ZERO;
        };
        let mut parts = self.parts.lock().unwrap();
        match request.node_ref.as_str() {
            "part" => {
                parts.insert(request.token_id.clone(), branch.branch_index);
                Duration::ZERO
            }
            "piece" => {
                // Inner groups are named after the part token that fanned out
                let origin = branch.sibling_group.rsplit_once(':').map(|(_, id)| id);
                let slow = parts
                    .iter()
                    .any(|(id, idx)| *idx == self.slow_branch && Some(id.as_str()) == origin);
                if slow {
                    self.delay
                } else {
                    Duration::ZERO
                }
            }
            _ => Duration::ZERO,
        }
    }
}

impl Executor for SlowOuterBranch {
    fn dispatch_task(&self, request: TaskRequest) -> BoxFuture<'_, Result<Value>> {
        let delay = self.delay_for(&request);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            self.scripted.dispatch_task(request).await
        })
    }
}

fn nested_with_outer_join(sync: Synchronization) -> WorkflowDefinition {
    let mut def = nested_workflow();
    let outer_join = def
        .transitions
        .iter_mut()
        .find(|t| t.from_node_ref == "assemble")
        .unwrap();
    outer_join.synchronization = Some(sync);
    def
}

fn outer_parts() -> MergeSpec {
    MergeSpec::new("_branch.output.part", "state.parts", MergeStrategy::Append)
}

/// Merges into `state.pieces` recorded after the outer group timed out.
fn late_piece_merges(outcome: &RunOutcome) -> usize {
    let timed_out_at = outcome.trace.of_kind(TraceKind::SyncTimedOut)[0].sequence;
    outcome
        .trace
        .of_kind(TraceKind::MergeApplied)
        .iter()
        .filter(|e| e.sequence > timed_out_at && e.payload["target"] == "state.pieces")
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_nested_timeout_proceeds_without_the_slow_branch() {
    let executor = Arc::new(SlowOuterBranch::new(1, Duration::from_millis(5000)));
    let def = nested_with_outer_join(
        Synchronization::all("outer", outer_parts())
            .with_timeout(1000, TimeoutPolicy::ProceedWithAvailable),
    );
    let engine = Engine::new(executor.clone());

    let started = tokio::time::Instant::now();
    let outcome = engine.start(def, json!({})).unwrap().wait().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(elapsed >= Duration::from_millis(1000));
    assert!(elapsed < Duration::from_millis(2000), "proceeded at the timeout");
    assert_eq!(outcome.read("state.parts"), Some(json!(["left"])));
    assert_eq!(outcome.read("state.pieces"), Some(json!(["p0", "p1"])));

    // The slow branch's inner work timed out and its inner group never merged
    assert_eq!(count_status(&outcome, "piece", TokenStatus::TimedOut), 2);
    assert_eq!(late_piece_merges(&outcome), 0);
    let timed_out = outcome.trace.of_kind(TraceKind::SyncTimedOut);
    assert_eq!(timed_out[0].payload["timedOut"].as_array().map(Vec::len), Some(2));
    assert_eq!(timed_out[0].payload["abandonedGroups"].as_array().map(Vec::len), Some(1));
    assert_eq!(executor.scripted.calls_for("assemble").len(), 1);
    assert!(outcome.tokens.iter().all(|t| t.is_terminal()));
}

#[tokio::test(start_paused = true)]
async fn test_nested_timeout_fail_times_out_inner_work() {
    let executor = Arc::new(SlowOuterBranch::new(1, Duration::from_millis(5000)));
    let def = nested_with_outer_join(
        Synchronization::all("outer", outer_parts()).with_timeout(1000, TimeoutPolicy::Fail),
    );
    let engine = Engine::new(executor.clone());

    let started = tokio::time::Instant::now();
    let outcome = engine.start(def, json!({})).unwrap().wait().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(elapsed < Duration::from_millis(2000), "failed at the timeout");
    assert_eq!(outcome.failure.as_ref().unwrap().kind, "synchronization_timeout");
    assert_eq!(count_status(&outcome, "piece", TokenStatus::TimedOut), 2);
    assert_eq!(outcome.read("state.pieces"), Some(json!(["p0", "p1"])));
    assert_eq!(late_piece_merges(&outcome), 0);
    assert_eq!(executor.scripted.calls_for("assemble").len(), 1);
    assert!(outcome.tokens.iter().all(|t| t.is_terminal()));
}

#[tokio::test(start_paused = true)]
async fn test_nested_any_cancels_inner_work_of_other_branches() {
    let executor = Arc::new(SlowOuterBranch::new(1, Duration::from_millis(5000)));
    let def = nested_with_outer_join(Synchronization::any("outer", outer_parts()));
    let engine = Engine::new(executor.clone());

    let started = tokio::time::Instant::now();
    let outcome = engine.start(def, json!({})).unwrap().wait().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(started.elapsed() < Duration::from_millis(5000));
    assert_eq!(outcome.read("state.parts"), Some(json!(["left"])));
    assert_eq!(outcome.read("state.pieces"), Some(json!(["p0", "p1"])));
    assert_eq!(count_status(&outcome, "piece", TokenStatus::Cancelled), 2);

    let completed = outcome.trace.of_kind(TraceKind::SyncCompleted);
    let outer = completed
        .iter()
        .find(|e| e.payload["siblingGroup"].as_str().is_some_and(|g| g.starts_with("outer:")))
        .unwrap();
    assert_eq!(outer.payload["cancelled"].as_array().map(Vec::len), Some(2));
    assert_eq!(outer.payload["abandonedGroups"].as_array().map(Vec::len), Some(1));
    assert_eq!(executor.scripted.calls_for("assemble").len(), 1);
}
