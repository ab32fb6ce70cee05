use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tokenflow_core::config::FlowConfig;
use tokenflow_core::definition::{Synchronization, TimeoutPolicy, WorkflowDefinition};
use tokenflow_core::error::{FlowError, Result};
use tokenflow_core::event::EventBus;
use tokenflow_core::path::{lookup, ContextPath, Section};
use tokenflow_core::trace::TraceKind;
use tokenflow_core::traits::{Executor, SchemaValidator, TaskRequest};
use tokenflow_core::types::{BranchInfo, RunFailure, RunId, RunStatus, TokenId, TokenStatus};

use crate::completion::{self, FinalOutput};
use crate::condition::PredicateRegistry;
use crate::context::RunContext;
use crate::engine::{RunHandle, RunOutcome};
use crate::merge;
use crate::routing::{self, RoutingDecision};
use crate::snapshot::{Snapshot, SnapshotPolicy, SnapshotReason};
use crate::store::{RunRecord, RunStore};
use crate::sync::{AlarmSet, ArrivalOutcome, GroupStatus, SiblingGroup, SiblingGroups};
use crate::token::{NewToken, Token, TokenStore};
use crate::tracer::Tracer;

/// Messages delivered to a run's coordinator.
pub(crate) enum Command {
    TaskFinished {
        token_id: TokenId,
        result: Result<Value>,
    },
    AlarmFired {
        group_id: String,
        generation: u64,
    },
    Snapshot(oneshot::Sender<Snapshot>),
    Tokens(oneshot::Sender<Vec<Token>>),
}

/// Collaborators shared by every run of one engine.
pub(crate) struct Services {
    pub executor: Arc<dyn Executor>,
    pub validator: Arc<dyn SchemaValidator>,
    pub predicates: PredicateRegistry,
    pub config: FlowConfig,
    pub bus: Arc<EventBus>,
    pub store: Option<Arc<RunStore>>,
}

/// Initial state of a coordinator: a fresh run or a restored record.
pub(crate) struct Seed {
    pub run_id: RunId,
    pub parent_run_id: Option<RunId>,
    pub context: RunContext,
    pub tokens: TokenStore,
    pub groups: SiblingGroups,
    pub last_sequence: u64,
    pub resumed: bool,
}

/// A run-fatal error with the token and node it is attributed to.
struct Fault {
    error: FlowError,
    token_id: Option<TokenId>,
    node_ref: Option<String>,
}

impl From<FlowError> for Fault {
    fn from(error: FlowError) -> Self {
        Self {
            error,
            token_id: None,
            node_ref: None,
        }
    }
}

fn at(token_id: &TokenId, node_ref: &str) -> impl FnOnce(FlowError) -> Fault {
    let token_id = token_id.clone();
    let node_ref = node_ref.to_string();
    move |error| Fault {
        error,
        token_id: Some(token_id),
        node_ref: Some(node_ref),
    }
}

type Step = std::result::Result<(), Fault>;

/// Start the coordinator actor for one run and return its handle.
///
/// Must be called from within a tokio runtime.
pub(crate) fn spawn(services: Arc<Services>, definition: Arc<WorkflowDefinition>, seed: Seed) -> RunHandle {
    let (tx, rx) = mpsc::channel(services.config.engine.mailbox_capacity.max(1));
    let initial = if seed.resumed && seed.tokens.count(TokenStatus::Pending) + seed.tokens.count(TokenStatus::Executing) == 0 {
        RunStatus::Waiting
    } else {
        RunStatus::Running
    };
    let (status_tx, status_rx) = watch::channel(initial);
    let (done_tx, done_rx) = oneshot::channel();
    let cancel = CancellationToken::new();
    let run_id = seed.run_id.clone();

    let coordinator = Coordinator {
        run_id: seed.run_id.clone(),
        parent_run_id: seed.parent_run_id,
        tracer: Tracer::resume_at(seed.run_id, Arc::clone(&services.bus), seed.last_sequence),
        snapshots: {
            let mut policy = SnapshotPolicy::new(services.config.snapshot.clone());
            policy.mark(seed.last_sequence);
            policy
        },
        definition,
        context: seed.context,
        tokens: seed.tokens,
        groups: seed.groups,
        alarms: AlarmSet::new(),
        status: initial,
        final_output: None,
        failure: None,
        resumed: seed.resumed,
        mailbox: tx.clone(),
        status_tx,
        services,
    };

    tokio::spawn(coordinator.run(rx, cancel.clone(), done_tx));
    RunHandle::new(run_id, tx, status_rx, done_rx, cancel)
}

/// Single writer for one run: owns the context, tokens, groups and trace.
struct Coordinator {
    run_id: RunId,
    parent_run_id: Option<RunId>,
    definition: Arc<WorkflowDefinition>,
    services: Arc<Services>,
    context: RunContext,
    tokens: TokenStore,
    groups: SiblingGroups,
    alarms: AlarmSet,
    tracer: Tracer,
    snapshots: SnapshotPolicy,
    status: RunStatus,
    final_output: Option<FinalOutput>,
    failure: Option<RunFailure>,
    resumed: bool,
    mailbox: mpsc::Sender<Command>,
    status_tx: watch::Sender<RunStatus>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command>,
        cancel: CancellationToken,
        done: oneshot::Sender<RunOutcome>,
    ) {
        let begun = if self.resumed { self.resume_work() } else { self.begin() };
        if let Err(fault) = begun {
            self.fail_run(fault);
        }
        self.settle();
        self.after_step();

        let mut ticker = self.snapshots.interval().map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        while !self.status.is_finished() {
            tokio::select! {
                _ = cancel.cancelled() => self.cancel_run(),
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = next_tick(&mut ticker) => {
                    self.take_snapshot(SnapshotReason::Interval);
                }
            }
            self.after_step();
        }

        self.finish(done);
    }

    fn handle(&mut self, command: Command) {
        let step = match command {
            Command::TaskFinished { token_id, result } => self.on_task_finished(token_id, result),
            Command::AlarmFired {
                group_id,
                generation,
            } => self.on_alarm(group_id, generation),
            Command::Snapshot(reply) => {
                let snapshot = self.take_snapshot(SnapshotReason::Requested);
                let _ = reply.send(snapshot);
                Ok(())
            }
            Command::Tokens(reply) => {
                let _ = reply.send(self.tokens.all().to_vec());
                Ok(())
            }
        };
        if let Err(fault) = step {
            self.fail_run(fault);
        }
        self.settle();
    }

    // --- lifecycle ---

    fn begin(&mut self) -> Step {
        let input = self.context.document().get("input").cloned().unwrap_or(Value::Null);
        self.tracer.emit(
            TraceKind::WorkflowStarted,
            None,
            None,
            json!({
                "workflowRef": self.definition.reference(),
                "parentRunId": self.parent_run_id,
                "input": input,
            }),
        );
        info!(run_id = %self.run_id, workflow = %self.definition.reference(), "Workflow started");

        let initial = self.definition.initial_node_ref.clone();
        let root = self.create_token(NewToken::at(&initial))?;
        self.dispatch(&root).map_err(at(&root, &initial))
    }

    fn resume_work(&mut self) -> Step {
        self.tracer.emit(
            TraceKind::WorkflowResumed,
            None,
            None,
            json!({
                "workflowRef": self.definition.reference(),
                "fromSequence": self.tracer.last_sequence(),
                "activeTokens": self.tokens.active_count(),
            }),
        );
        info!(run_id = %self.run_id, active = self.tokens.active_count(), "Workflow resumed");

        let definition = Arc::clone(&self.definition);
        let now = Utc::now();
        let open: Vec<SiblingGroup> = self.groups.open().cloned().collect();
        for group in open {
            let (Some(first), Some(transition_id)) = (group.first_arrival_at, group.sync_transition_id.as_deref()) else {
                continue;
            };
            let Some(timeout_ms) = definition
                .transition(transition_id)
                .and_then(|t| t.synchronization.as_ref())
                .and_then(|s| s.timeout_ms)
            else {
                continue;
            };
            let elapsed = (now - first).num_milliseconds().max(0) as u64;
            let remaining = timeout_ms.saturating_sub(elapsed);
            self.arm_alarm(&group.id, Duration::from_millis(remaining), timeout_ms, true);
        }

        // Results of executing tokens died with the previous coordinator
        let restart: Vec<(TokenId, String)> = self
            .tokens
            .all()
            .iter()
            .filter(|t| matches!(t.status, TokenStatus::Pending | TokenStatus::Executing))
            .map(|t| (t.id.clone(), t.node_ref.clone()))
            .collect();
        for (id, node_ref) in restart {
            self.dispatch(&id).map_err(at(&id, &node_ref))?;
        }
        Ok(())
    }

    /// Decide whether the run is complete, waiting, stalled or still running.
    fn settle(&mut self) {
        if self.status.is_finished() {
            return;
        }
        let moving = self.tokens.count(TokenStatus::Pending) + self.tokens.count(TokenStatus::Executing);
        let waiting = self.tokens.count(TokenStatus::WaitingForSiblings);

        if moving + waiting == 0 {
            self.complete_run();
            return;
        }
        if moving > 0 {
            self.status = RunStatus::Running;
            return;
        }

        // Only fan-in waits remain
        let waiting_groups: Vec<String> = self
            .tokens
            .by_status(TokenStatus::WaitingForSiblings)
            .iter()
            .filter_map(|t| t.sibling_group.clone())
            .collect();
        if waiting_groups.iter().any(|g| self.alarms.is_armed(g)) {
            self.status = RunStatus::Waiting;
        } else if let Some(sibling_group) = waiting_groups.into_iter().next() {
            self.fail_run(FlowError::SynchronizationStalled { sibling_group }.into());
        }
    }

    fn complete_run(&mut self) {
        match completion::extract(&self.definition, &self.context, self.services.validator.as_ref()) {
            Ok(output) => {
                self.tracer.emit(
                    TraceKind::WorkflowCompleted,
                    None,
                    None,
                    json!({ "finalOutput": output, "tokens": self.tokens.len() }),
                );
                info!(run_id = %self.run_id, tokens = self.tokens.len(), "Workflow completed");
                self.final_output = Some(output);
                self.status = RunStatus::Completed;
            }
            Err(e) => self.fail_run(e.into()),
        }
    }

    fn fail_run(&mut self, fault: Fault) {
        if self.status.is_finished() {
            return;
        }
        self.alarms.disarm_all();
        self.cancel_active();
        let failure = RunFailure::from_error(&fault.error, fault.token_id, fault.node_ref);
        self.tracer.emit(
            TraceKind::WorkflowFailed,
            failure.token_id.as_ref(),
            failure.node_ref.as_deref(),
            json!(failure),
        );
        error!(
            run_id = %self.run_id,
            kind = %failure.kind,
            token_id = ?failure.token_id,
            node_ref = ?failure.node_ref,
            error = %failure.message,
            "Workflow failed"
        );
        self.failure = Some(failure);
        self.status = RunStatus::Failed;
    }

    fn cancel_run(&mut self) {
        if self.status.is_finished() {
            return;
        }
        self.alarms.disarm_all();
        let cancelled = self.cancel_active();
        self.tracer.emit(
            TraceKind::WorkflowCancelled,
            None,
            None,
            json!({ "cancelledTokens": cancelled }),
        );
        info!(run_id = %self.run_id, cancelled, "Workflow cancelled");
        self.status = RunStatus::Cancelled;
    }

    fn cancel_active(&mut self) -> usize {
        let ids = self.tokens.active_ids();
        for id in &ids {
            if let Err(e) = self.set_status(id, TokenStatus::Cancelled) {
                warn!(run_id = %self.run_id, token_id = %id, error = %e, "Failed to cancel token");
            }
        }
        ids.len()
    }

    fn after_step(&mut self) {
        if !self.status.is_finished() && self.snapshots.due_by_events(self.tracer.last_sequence()) {
            self.take_snapshot(SnapshotReason::EventCount);
        }
        if self.services.config.store.persist_every_step {
            self.persist();
        }
        self.publish_status();
    }

    fn finish(mut self, done: oneshot::Sender<RunOutcome>) {
        self.alarms.disarm_all();
        self.persist();
        self.publish_status();

        let outcome = RunOutcome {
            run_id: self.run_id.clone(),
            status: self.status,
            final_output: self.final_output.take(),
            failure: self.failure.take(),
            tokens: self.tokens.all().to_vec(),
            trace: self.tracer.events().to_vec(),
            context: self.context.document().clone(),
            snapshots: self.snapshots.retained(),
        };
        debug!(run_id = %self.run_id, status = %outcome.status, "Coordinator finished");
        let _ = done.send(outcome);
    }

    fn publish_status(&self) {
        let status = self.status;
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn record(&self) -> RunRecord {
        RunRecord {
            id: self.run_id.clone(),
            workflow_ref: self.definition.reference(),
            parent_run_id: self.parent_run_id.clone(),
            status: self.status,
            context: self.context.document().clone(),
            tokens: self.tokens.all().to_vec(),
            groups: self.groups.all(),
            last_sequence: self.tracer.last_sequence(),
            final_output: self.final_output.clone(),
            failure: self.failure.clone(),
            updated_at: Utc::now(),
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.services.store {
            if let Err(e) = store.save_run(&self.record()) {
                warn!(run_id = %self.run_id, error = %e, "Failed to persist run record");
            }
        }
    }

    fn take_snapshot(&mut self, reason: SnapshotReason) -> Snapshot {
        let snapshot = Snapshot {
            sequence: self.tracer.last_sequence(),
            reason,
            taken_at: Utc::now(),
            data: self.context.snapshot(),
        };
        self.tracer.emit(
            TraceKind::SnapshotTaken,
            None,
            None,
            json!({ "reason": reason, "sequence": snapshot.sequence }),
        );
        if let Some(store) = &self.services.store {
            if let Err(e) = store.save_snapshot(&self.run_id, &snapshot) {
                warn!(run_id = %self.run_id, error = %e, "Failed to persist snapshot");
            }
        }
        self.snapshots.record(snapshot.clone());
        snapshot
    }

    // --- tokens ---

    fn create_token(&mut self, new: NewToken) -> Result<TokenId> {
        let token = self.tokens.create(new)?.clone();
        self.tracer.emit(
            TraceKind::TokenCreated,
            Some(&token.id),
            Some(&token.node_ref),
            json!({
                "parentTokenId": token.parent_token_id,
                "siblingGroup": token.sibling_group,
                "branchIndex": token.branch_index,
                "branchTotal": token.branch_total,
                "fanOutTransitionId": token.fan_out_transition_id,
                "originTokenIds": token.origin_token_ids,
            }),
        );
        Ok(token.id)
    }

    fn set_status(&mut self, id: &TokenId, to: TokenStatus) -> Result<()> {
        let from = self.tokens.transition(id, to)?;
        let node_ref = self.tokens.get(id).map(|t| t.node_ref.clone());
        debug!(run_id = %self.run_id, token_id = %id, from = %from, to = %to, "Token status changed");
        self.tracer.emit(
            TraceKind::TokenStatusChanged,
            Some(id),
            node_ref.as_deref(),
            json!({ "from": from, "to": to }),
        );
        Ok(())
    }

    /// Hand a token's task to the executor. The result comes back as
    /// `Command::TaskFinished`.
    fn dispatch(&mut self, id: &TokenId) -> Result<()> {
        let token = self.tokens.require(id)?.clone();
        let definition = Arc::clone(&self.definition);
        let node = definition
            .node(&token.node_ref)
            .ok_or_else(|| FlowError::UnknownNode(token.node_ref.clone()))?;

        let redispatch = token.status == TokenStatus::Executing;
        if !redispatch {
            self.set_status(id, TokenStatus::Executing)?;
        }

        let lineage = self.tokens.branch_lineage(id);
        let mut input = Map::new();
        for (field, path) in &node.input_mapping {
            if let Some(value) = self.context.read_scoped(path, &lineage)? {
                input.insert(field.clone(), value);
            }
        }

        let request = TaskRequest {
            run_id: self.run_id.clone(),
            token_id: id.clone(),
            node_ref: node.node_ref.clone(),
            task_id: node.task_id.clone(),
            task_version: node.task_version.clone(),
            branch: token.branch(),
            input: Value::Object(input),
        };
        self.tracer.emit(
            TraceKind::TaskDispatched,
            Some(id),
            Some(&node.node_ref),
            json!({
                "taskId": request.task_id,
                "taskVersion": request.task_version,
                "input": request.input,
                "redispatch": redispatch,
            }),
        );
        debug!(run_id = %self.run_id, token_id = %id, node_ref = %node.node_ref, task = %node.task_id, "Task dispatched");

        // Executor calls always run to completion; a result that outlives
        // its run is dropped at the closed mailbox.
        let executor = Arc::clone(&self.services.executor);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let token_id = request.token_id.clone();
            let result = executor.dispatch_task(request).await;
            let _ = mailbox.send(Command::TaskFinished { token_id, result }).await;
        });
        Ok(())
    }

    fn on_task_finished(&mut self, token_id: TokenId, result: Result<Value>) -> Step {
        let Some(token) = self.tokens.get(&token_id).cloned() else {
            warn!(run_id = %self.run_id, token_id = %token_id, "Result for unknown token");
            return Ok(());
        };

        if token.status != TokenStatus::Executing {
            self.tracer.emit(
                TraceKind::ResultDiscarded,
                Some(&token.id),
                Some(&token.node_ref),
                json!({ "status": token.status, "succeeded": result.is_ok() }),
            );
            debug!(run_id = %self.run_id, token_id = %token.id, status = %token.status, "Executor result discarded");
            return Ok(());
        }

        match result {
            Err(e) => {
                let message = match e {
                    FlowError::TaskExecutionFailed { message, .. } => message,
                    other => other.to_string(),
                };
                self.tracer.emit(
                    TraceKind::TaskFailed,
                    Some(&token.id),
                    Some(&token.node_ref),
                    json!({ "error": message }),
                );
                self.set_status(&token.id, TokenStatus::Failed)
                    .map_err(at(&token.id, &token.node_ref))?;
                Err(at(&token.id, &token.node_ref)(FlowError::TaskExecutionFailed {
                    token_id: token.id.to_string(),
                    node_ref: token.node_ref.clone(),
                    message,
                }))
            }
            Ok(output) => {
                self.tracer.emit(
                    TraceKind::TaskCompleted,
                    Some(&token.id),
                    Some(&token.node_ref),
                    json!({ "output": output }),
                );
                self.apply_output(&token, &output)
                    .map_err(at(&token.id, &token.node_ref))?;
                self.route(&token)
            }
        }
    }

    /// Write task output into context per the node's output mapping.
    fn apply_output(&mut self, token: &Token, output: &Value) -> Result<()> {
        let definition = Arc::clone(&self.definition);
        let node = definition
            .node(&token.node_ref)
            .ok_or_else(|| FlowError::UnknownNode(token.node_ref.clone()))?;

        for (path, field) in &node.output_mapping {
            let Some(value) = output_field(output, field) else {
                debug!(run_id = %self.run_id, token_id = %token.id, field = %field, "Task output has no such field");
                continue;
            };
            let (written, op) = if ContextPath::parse(path)?.section() == Section::Branch {
                (self.context.write_branch(&token.id, path, value)?, "branch_write")
            } else {
                self.context.set_field(path, value)?;
                (path.clone(), "set_field")
            };
            self.tracer.emit(
                TraceKind::ContextWrite,
                Some(&token.id),
                Some(&token.node_ref),
                json!({ "path": written, "op": op }),
            );
        }
        Ok(())
    }

    // --- routing ---

    fn route(&mut self, token: &Token) -> Step {
        let fault = || at(&token.id, &token.node_ref);
        let definition = Arc::clone(&self.definition);
        let lineage = self.tokens.branch_lineage(&token.id);
        let routed = routing::route(
            &definition,
            token.id.as_str(),
            &token.node_ref,
            &self.context.scoped(&lineage),
            &self.services.predicates,
        )
        .map_err(fault())?;

        for evaluation in &routed.evaluated {
            self.tracer.emit(
                TraceKind::TransitionEvaluated,
                Some(&token.id),
                Some(&token.node_ref),
                json!(evaluation),
            );
        }

        match routed.decision {
            RoutingDecision::Terminal => {
                self.tracer.emit(
                    TraceKind::RoutingTerminal,
                    Some(&token.id),
                    Some(&token.node_ref),
                    json!({ "branch": token.branch() }),
                );
                self.set_status(&token.id, TokenStatus::Completed).map_err(fault())
            }
            RoutingDecision::Continue {
                transition_id,
                to_node_ref,
            } => {
                self.emit_selected(token, &transition_id, &to_node_ref, "continue");
                let next = self
                    .create_token(
                        NewToken::at(&to_node_ref)
                            .child_of(&token.id)
                            .in_branch(token.branch(), token.fan_out_transition_id.clone()),
                    )
                    .map_err(fault())?;
                self.set_status(&token.id, TokenStatus::Completed).map_err(fault())?;
                self.dispatch(&next).map_err(at(&next, &to_node_ref))
            }
            RoutingDecision::FanOut {
                transition_id,
                to_node_ref,
                count,
                sibling_group,
            } => {
                self.emit_selected(token, &transition_id, &to_node_ref, "fan_out");
                let group_id = SiblingGroup::runtime_id(&sibling_group, &token.id);
                self.groups.insert(SiblingGroup {
                    id: group_id.clone(),
                    cohort: sibling_group.clone(),
                    fan_out_transition_id: transition_id.clone(),
                    origin_token_id: token.id.clone(),
                    origin_branch: token.branch(),
                    origin_fan_out_transition_id: token.fan_out_transition_id.clone(),
                    expected: count,
                    arrivals: BTreeMap::new(),
                    sync_transition_id: None,
                    first_arrival_at: None,
                    status: GroupStatus::Open,
                });

                let mut children = Vec::with_capacity(count as usize);
                for index in 0..count {
                    let child = self
                        .create_token(
                            NewToken::at(&to_node_ref).child_of(&token.id).in_branch(
                                Some(BranchInfo::new(group_id.clone(), index, count)),
                                Some(transition_id.clone()),
                            ),
                        )
                        .map_err(fault())?;
                    children.push(child);
                }
                self.tracer.emit(
                    TraceKind::FanOut,
                    Some(&token.id),
                    Some(&token.node_ref),
                    json!({
                        "transitionId": transition_id,
                        "siblingGroup": group_id,
                        "cohort": sibling_group,
                        "count": count,
                        "tokenIds": children,
                    }),
                );
                info!(run_id = %self.run_id, sibling_group = %group_id, count, "Fanned out");

                self.set_status(&token.id, TokenStatus::Completed).map_err(fault())?;
                for child in &children {
                    self.dispatch(child).map_err(at(child, &to_node_ref))?;
                }
                Ok(())
            }
            RoutingDecision::Synchronize {
                transition_id,
                to_node_ref,
            } => {
                self.emit_selected(token, &transition_id, &to_node_ref, "synchronize");
                self.arrive(token, &transition_id, &to_node_ref)
            }
        }
    }

    fn emit_selected(&mut self, token: &Token, transition_id: &str, to_node_ref: &str, kind: &str) {
        self.tracer.emit(
            TraceKind::TransitionSelected,
            Some(&token.id),
            Some(&token.node_ref),
            json!({ "transitionId": transition_id, "toNodeRef": to_node_ref, "kind": kind }),
        );
    }

    // --- synchronization ---

    /// Record a branch token's arrival at a fan-in and merge once the
    /// strategy is satisfied.
    fn arrive(&mut self, token: &Token, transition_id: &str, to_node_ref: &str) -> Step {
        let fault = || at(&token.id, &token.node_ref);
        let mismatch = |reason: String| FlowError::SynchronizationMismatch {
            token_id: token.id.to_string(),
            reason,
        };

        let definition = Arc::clone(&self.definition);
        let sync = definition
            .transition(transition_id)
            .and_then(|t| t.synchronization.as_ref())
            .ok_or_else(|| mismatch(format!("transition '{}' does not synchronize", transition_id)))
            .map_err(fault())?;
        let branch = token
            .branch()
            .ok_or_else(|| mismatch("token is not part of a sibling group".into()))
            .map_err(fault())?;
        let group = self
            .groups
            .get(&branch.sibling_group)
            .ok_or_else(|| mismatch(format!("unknown sibling group '{}'", branch.sibling_group)))
            .map_err(fault())?;
        if group.cohort != sync.sibling_group {
            return Err(fault()(mismatch(format!(
                "token belongs to cohort '{}' but the transition joins '{}'",
                group.cohort, sync.sibling_group
            ))));
        }

        if let Some(reason) = group.check_arrival(branch.branch_index, transition_id) {
            self.reject_arrival(token, &branch, reason);
            return self.set_status(&token.id, TokenStatus::Completed).map_err(fault());
        }

        let arrival = self
            .create_token(
                NewToken::at(to_node_ref)
                    .child_of(&token.id)
                    .in_branch(Some(branch.clone()), token.fan_out_transition_id.clone()),
            )
            .map_err(fault())?;
        self.set_status(&arrival, TokenStatus::WaitingForSiblings)
            .map_err(fault())?;
        self.set_status(&token.id, TokenStatus::Completed).map_err(fault())?;

        let outcome = match self.groups.get_mut(&branch.sibling_group) {
            Some(group) => group.record_arrival(branch.branch_index, arrival.clone(), transition_id, Utc::now()),
            None => ArrivalOutcome::Rejected("unknown sibling group"),
        };
        let (first, arrived) = match outcome {
            ArrivalOutcome::Recorded { first, arrived } => (first, arrived),
            ArrivalOutcome::Rejected(reason) => {
                self.reject_arrival(token, &branch, reason);
                return self.set_status(&arrival, TokenStatus::Cancelled).map_err(fault());
            }
        };

        self.tracer.emit(
            TraceKind::ArrivalRecorded,
            Some(&arrival),
            Some(to_node_ref),
            json!({
                "siblingGroup": branch.sibling_group,
                "branchIndex": branch.branch_index,
                "arrived": arrived,
                "expected": branch.branch_total,
                "fromTokenId": token.id,
                "strategy": sync.strategy,
            }),
        );
        debug!(
            run_id = %self.run_id,
            sibling_group = %branch.sibling_group,
            branch_index = branch.branch_index,
            arrived,
            expected = branch.branch_total,
            "Arrival recorded"
        );

        if first {
            if let Some(timeout_ms) = sync.timeout_ms {
                self.arm_alarm(&branch.sibling_group, Duration::from_millis(timeout_ms), timeout_ms, false);
            }
        }

        let satisfied = self
            .groups
            .get(&branch.sibling_group)
            .is_some_and(|g| g.is_satisfied(sync.strategy));
        if satisfied {
            self.complete_group(&branch.sibling_group, sync, to_node_ref, "satisfied")?;
        }
        Ok(())
    }

    fn reject_arrival(&mut self, token: &Token, branch: &BranchInfo, reason: &str) {
        self.tracer.emit(
            TraceKind::ArrivalRejected,
            Some(&token.id),
            Some(&token.node_ref),
            json!({
                "siblingGroup": branch.sibling_group,
                "branchIndex": branch.branch_index,
                "reason": reason,
            }),
        );
        warn!(
            run_id = %self.run_id,
            token_id = %token.id,
            sibling_group = %branch.sibling_group,
            reason,
            "Arrival rejected"
        );
    }

    fn arm_alarm(&mut self, group_id: &str, delay: Duration, timeout_ms: u64, resumed: bool) {
        let target = group_id.to_string();
        let generation = self.alarms.arm(group_id, delay, self.mailbox.clone(), move |generation| {
            Command::AlarmFired {
                group_id: target,
                generation,
            }
        });
        self.tracer.emit(
            TraceKind::AlarmArmed,
            None,
            None,
            json!({
                "siblingGroup": group_id,
                "timeoutMs": timeout_ms,
                "delayMs": delay.as_millis() as u64,
                "generation": generation,
                "resumed": resumed,
            }),
        );
    }

    /// Merge the arrived branches, resolve the group and create the single
    /// continuation token.
    fn complete_group(&mut self, group_id: &str, sync: &Synchronization, to_node_ref: &str, reason: &str) -> Step {
        let at_join = |error: FlowError| Fault {
            error,
            token_id: None,
            node_ref: Some(to_node_ref.to_string()),
        };

        if self.alarms.disarm(group_id) {
            self.tracer.emit(
                TraceKind::AlarmCancelled,
                None,
                Some(to_node_ref),
                json!({ "siblingGroup": group_id }),
            );
        }

        let group = self
            .groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| FlowError::SynchronizationStalled {
                sibling_group: group_id.to_string(),
            })
            .map_err(at_join)?;
        let arrivals = group.arrival_ids();

        let mut values = Vec::with_capacity(arrivals.len());
        let mut merged_indexes = Vec::new();
        let mut missing_source = Vec::new();
        for (index, arrival) in &arrivals {
            let lineage = self.tokens.branch_lineage(arrival);
            match self.context.read_scoped(&sync.merge.source, &lineage).map_err(at_join)? {
                Some(value) => {
                    values.push(value);
                    merged_indexes.push(*index);
                }
                None => missing_source.push(*index),
            }
        }
        let existing = self.context.read(&sync.merge.target).map_err(at_join)?;
        let folded = merge::fold(&sync.merge.target, existing, values, sync.merge.strategy).map_err(at_join)?;
        self.context
            .set_field(&sync.merge.target, folded)
            .map_err(at_join)?;
        self.tracer.emit(
            TraceKind::ContextWrite,
            None,
            Some(to_node_ref),
            json!({ "path": sync.merge.target, "op": "merge" }),
        );
        self.tracer.emit(
            TraceKind::MergeApplied,
            None,
            Some(to_node_ref),
            json!({
                "siblingGroup": group_id,
                "source": sync.merge.source,
                "target": sync.merge.target,
                "strategy": sync.merge.strategy,
                "branches": merged_indexes,
                "missingSource": missing_source,
            }),
        );

        for (_, arrival) in &arrivals {
            self.set_status(arrival, TokenStatus::Completed).map_err(at_join)?;
        }
        if let Some(g) = self.groups.get_mut(group_id) {
            g.status = GroupStatus::Completed;
        }

        // Branches still in flight can no longer be merged
        let stragglers = self.unresolved_members(group_id);
        for id in &stragglers {
            self.set_status(id, TokenStatus::Cancelled).map_err(at_join)?;
        }
        let abandoned = self.abandon_nested(group_id);

        self.tracer.emit(
            TraceKind::SyncCompleted,
            None,
            Some(to_node_ref),
            json!({
                "siblingGroup": group_id,
                "cohort": group.cohort,
                "strategy": sync.strategy,
                "arrived": arrivals.len(),
                "expected": group.expected,
                "reason": reason,
                "cancelled": stragglers,
                "abandonedGroups": abandoned,
            }),
        );
        info!(
            run_id = %self.run_id,
            sibling_group = %group_id,
            arrived = arrivals.len(),
            expected = group.expected,
            "Sibling group merged"
        );

        if self.services.config.engine.dispose_merged_branches {
            let members: Vec<TokenId> = self
                .tokens
                .by_sibling_group(group_id)
                .iter()
                .map(|t| t.id.clone())
                .collect();
            for id in members {
                if self.context.dispose_branch(&id) {
                    self.tracer.emit(
                        TraceKind::BranchDisposed,
                        Some(&id),
                        None,
                        json!({ "siblingGroup": group_id }),
                    );
                }
            }
        }

        let origins: Vec<TokenId> = arrivals.into_iter().map(|(_, id)| id).collect();
        let continuation = self
            .create_token(
                NewToken::at(to_node_ref)
                    .child_of(&group.origin_token_id)
                    .in_branch(group.origin_branch.clone(), group.origin_fan_out_transition_id.clone())
                    .with_origins(origins),
            )
            .map_err(at_join)?;

        if self.snapshots.on_fan_in() {
            self.take_snapshot(SnapshotReason::FanIn);
        }
        self.dispatch(&continuation)
            .map_err(at(&continuation, to_node_ref))
    }

    /// Active tokens working for `group_id`, directly or inside a fan-out
    /// nested in one of its branches. The group's own arrivals are excluded.
    fn unresolved_members(&self, group_id: &str) -> Vec<TokenId> {
        let arrived: HashSet<&TokenId> = self
            .groups
            .get(group_id)
            .map(|g| g.arrivals.values().collect())
            .unwrap_or_default();
        self.tokens
            .all()
            .iter()
            .filter(|t| !t.is_terminal() && !arrived.contains(&t.id))
            .filter(|t| {
                t.sibling_group
                    .as_deref()
                    .is_some_and(|g| self.groups.is_within(g, group_id))
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// Close the open groups nested inside a resolved group so they never merge.
    fn abandon_nested(&mut self, group_id: &str) -> Vec<String> {
        let nested = self.groups.open_within(group_id);
        for id in &nested {
            self.alarms.disarm(id);
            if let Some(g) = self.groups.get_mut(id) {
                g.status = GroupStatus::Abandoned;
            }
        }
        nested
    }

    fn on_alarm(&mut self, group_id: String, generation: u64) -> Step {
        if !self.alarms.claim(&group_id, generation) {
            debug!(run_id = %self.run_id, sibling_group = %group_id, generation, "Stale alarm ignored");
            return Ok(());
        }
        let Some(group) = self.groups.get(&group_id).cloned() else {
            return Ok(());
        };
        if !group.is_open() {
            return Ok(());
        }
        let definition = Arc::clone(&self.definition);
        let Some(transition) = group
            .sync_transition_id
            .as_deref()
            .and_then(|id| definition.transition(id))
        else {
            return Ok(());
        };
        let Some(sync) = transition.synchronization.as_ref() else {
            return Ok(());
        };

        let unarrived = self.unresolved_members(&group_id);
        let nested = self.groups.open_within(&group_id);

        self.tracer.emit(
            TraceKind::SyncTimedOut,
            None,
            Some(&transition.to_node_ref),
            json!({
                "siblingGroup": group_id,
                "arrived": group.arrived(),
                "expected": group.expected,
                "missing": group.missing(),
                "timedOut": unarrived,
                "abandonedGroups": nested,
                "onTimeout": sync.on_timeout,
            }),
        );
        warn!(
            run_id = %self.run_id,
            sibling_group = %group_id,
            arrived = group.arrived(),
            expected = group.expected,
            "Synchronization timed out"
        );

        let fault = |error: FlowError| Fault {
            error,
            token_id: unarrived.first().cloned(),
            node_ref: Some(transition.to_node_ref.clone()),
        };
        for id in &unarrived {
            self.set_status(id, TokenStatus::TimedOut).map_err(fault)?;
        }
        self.abandon_nested(&group_id);

        match sync.on_timeout {
            TimeoutPolicy::Fail => {
                if let Some(g) = self.groups.get_mut(&group_id) {
                    g.status = GroupStatus::TimedOut;
                }
                Err(fault(FlowError::SynchronizationTimeout {
                    sibling_group: group_id.clone(),
                    arrived: group.arrived(),
                    expected: group.expected as usize,
                }))
            }
            TimeoutPolicy::ProceedWithAvailable => {
                self.complete_group(&group_id, sync, &transition.to_node_ref, "timeout")
            }
        }
    }
}

/// Resolve `field` (dotted) inside a task's output. An empty field or `.`
/// selects the whole output.
fn output_field(output: &Value, field: &str) -> Option<Value> {
    if field.is_empty() || field == "." {
        return Some(output.clone());
    }
    let segments: Vec<String> = field.split('.').map(str::to_string).collect();
    lookup(output, &segments).cloned()
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
