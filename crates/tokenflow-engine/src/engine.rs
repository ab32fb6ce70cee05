use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tokenflow_core::config::FlowConfig;
use tokenflow_core::definition::WorkflowDefinition;
use tokenflow_core::error::{FlowError, Result};
use tokenflow_core::event::EventBus;
use tokenflow_core::path::{lookup, ContextPath};
use tokenflow_core::trace::TraceEvent;
use tokenflow_core::traits::{AcceptAll, Executor, Predicate, SchemaValidator};
use tokenflow_core::types::{RunFailure, RunId, RunStatus, TokenId};

use crate::completion::FinalOutput;
use crate::condition::PredicateRegistry;
use crate::context::RunContext;
use crate::coordinator::{self, Command, Seed, Services};
use crate::run_log::TraceWriter;
use crate::snapshot::Snapshot;
use crate::store::{RunRecord, RunStore};
use crate::sync::SiblingGroups;
use crate::token::{Token, TokenStore};

/// Entry point: validates definitions and starts one coordinator per run.
pub struct Engine {
    executor: Arc<dyn Executor>,
    validator: Arc<dyn SchemaValidator>,
    predicates: PredicateRegistry,
    config: FlowConfig,
    bus: Arc<EventBus>,
    store: Option<Arc<RunStore>>,
    trace_dir: Option<PathBuf>,
}

impl Engine {
    /// Engine with default configuration, no persistence and no trace files.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        let config = FlowConfig::default();
        Self {
            executor,
            validator: Arc::new(AcceptAll),
            predicates: PredicateRegistry::new(),
            bus: Arc::new(EventBus::new(config.engine.event_bus_capacity)),
            config,
            store: None,
            trace_dir: None,
        }
    }

    /// Engine wired from configuration: opens the run store and enables JSONL
    /// traces when the config asks for them.
    pub fn from_config(executor: Arc<dyn Executor>, config: FlowConfig) -> Result<Self> {
        let mut engine = Self::new(executor).with_config(config);
        if engine.config.store.enabled {
            let path = engine.config.store_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            engine.store = Some(Arc::new(RunStore::open(&path)?));
        }
        if engine.config.log.enabled {
            engine.trace_dir = Some(engine.config.log_dir());
        }
        Ok(engine)
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Register a named predicate for `predicate` conditions.
    pub fn with_predicate(mut self, name: impl Into<String>, predicate: Arc<dyn Predicate>) -> Self {
        self.predicates.register(name, predicate);
        self
    }

    pub fn with_config(mut self, config: FlowConfig) -> Self {
        self.bus = Arc::new(EventBus::new(config.engine.event_bus_capacity));
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    /// Bus carrying the trace events of every run of this engine.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> Option<&Arc<RunStore>> {
        self.store.as_ref()
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Start a new run of `definition` with `input`.
    pub fn start(&self, definition: WorkflowDefinition, input: Value) -> Result<RunHandle> {
        self.launch(definition, input, None)
    }

    /// Start a run on behalf of a parent run. Nothing is shared with the
    /// parent beyond the recorded id.
    pub fn start_child(&self, definition: WorkflowDefinition, input: Value, parent: RunId) -> Result<RunHandle> {
        self.launch(definition, input, Some(parent))
    }

    fn launch(&self, definition: WorkflowDefinition, input: Value, parent: Option<RunId>) -> Result<RunHandle> {
        let definition = self.prepare(definition)?;
        if let Some(schema) = &definition.input_schema {
            let report = self.validator.validate(schema, &input);
            if !report.valid {
                return Err(FlowError::InputValidation(report.errors));
            }
        }

        let run_id = RunId::new();
        info!(run_id = %run_id, workflow = %definition.reference(), parent = ?parent, "Starting run");
        self.spawn_trace_writer(&run_id);

        let seed = Seed {
            run_id,
            parent_run_id: parent,
            context: RunContext::new(input),
            tokens: TokenStore::with_limit(self.config.engine.max_tokens_per_run),
            groups: SiblingGroups::new(),
            last_sequence: 0,
            resumed: false,
        };
        Ok(coordinator::spawn(self.services(), Arc::new(definition), seed))
    }

    /// Continue a persisted run. Executing tokens are re-dispatched since
    /// their results were lost with the previous process.
    pub fn resume(&self, definition: WorkflowDefinition, record: RunRecord) -> Result<RunHandle> {
        if record.status.is_finished() {
            return Err(FlowError::RunClosed(format!(
                "run {} is already {}",
                record.id, record.status
            )));
        }
        let definition = self.prepare(definition)?;
        if definition.reference() != record.workflow_ref {
            return Err(FlowError::InvalidDefinition(format!(
                "run {} was started from {}, not {}",
                record.id,
                record.workflow_ref,
                definition.reference()
            )));
        }

        info!(run_id = %record.id, workflow = %record.workflow_ref, "Resuming run");
        self.spawn_trace_writer(&record.id);

        let seed = Seed {
            run_id: record.id,
            parent_run_id: record.parent_run_id,
            context: RunContext::from_document(record.context)?,
            tokens: TokenStore::restore(record.tokens, Some(self.config.engine.max_tokens_per_run))?,
            groups: SiblingGroups::restore(record.groups),
            last_sequence: record.last_sequence,
            resumed: true,
        };
        Ok(coordinator::spawn(self.services(), Arc::new(definition), seed))
    }

    /// Normalize, validate and check that every named predicate is registered.
    fn prepare(&self, definition: WorkflowDefinition) -> Result<WorkflowDefinition> {
        let definition = definition.normalized()?;
        let missing: Vec<&str> = definition
            .predicate_names()
            .into_iter()
            .filter(|name| !self.predicates.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(FlowError::InvalidDefinition(format!(
                "unregistered predicates: {}",
                missing.join(", ")
            )));
        }
        Ok(definition)
    }

    fn services(&self) -> Arc<Services> {
        Arc::new(Services {
            executor: Arc::clone(&self.executor),
            validator: Arc::clone(&self.validator),
            predicates: self.predicates.clone(),
            config: self.config.clone(),
            bus: Arc::clone(&self.bus),
            store: self.store.clone(),
        })
    }

    /// Subscribe before the coordinator exists so the first event is not missed.
    fn spawn_trace_writer(&self, run_id: &RunId) {
        let Some(dir) = &self.trace_dir else {
            return;
        };
        let writer = TraceWriter::new(dir.clone(), self.config.log.level);
        tokio::spawn(writer.run(self.bus.subscribe(), run_id.clone(), CancellationToken::new()));
    }
}

/// Caller's handle on a running workflow.
pub struct RunHandle {
    run_id: RunId,
    mailbox: mpsc::Sender<Command>,
    status: watch::Receiver<RunStatus>,
    done: oneshot::Receiver<RunOutcome>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: RunId,
        mailbox: mpsc::Sender<Command>,
        status: watch::Receiver<RunStatus>,
        done: oneshot::Receiver<RunOutcome>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            mailbox,
            status,
            done,
            cancel,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Last status published by the coordinator.
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Wait until the run reaches `target` or finishes, returning the status
    /// that ended the wait.
    pub async fn wait_for_status(&mut self, target: RunStatus) -> Result<RunStatus> {
        let status = self
            .status
            .wait_for(|s| *s == target || s.is_finished())
            .await
            .map_err(|_| FlowError::RunClosed(self.run_id.to_string()))?;
        Ok(*status)
    }

    /// Request cancellation. Active tokens become cancelled and late executor
    /// results are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Take an on-demand snapshot of the run's context.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| FlowError::RunClosed(self.run_id.to_string()))
    }

    /// Current tokens of the run, in creation order.
    pub async fn tokens(&self) -> Result<Vec<Token>> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Tokens(tx)).await?;
        rx.await.map_err(|_| FlowError::RunClosed(self.run_id.to_string()))
    }

    async fn request(&self, command: Command) -> Result<()> {
        if self.status().is_finished() {
            return Err(FlowError::RunClosed(self.run_id.to_string()));
        }
        self.mailbox
            .send(command)
            .await
            .map_err(|_| FlowError::RunClosed(self.run_id.to_string()))
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunOutcome> {
        let run_id = self.run_id;
        self.done.await.map_err(|_| {
            warn!(run_id = %run_id, "Coordinator dropped without an outcome");
            FlowError::RunClosed(run_id.to_string())
        })
    }
}

/// Everything a finished run leaves behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub final_output: Option<FinalOutput>,
    pub failure: Option<RunFailure>,
    pub tokens: Vec<Token>,
    pub trace: Vec<TraceEvent>,
    /// Final context document, `_branch` included unless disposed.
    pub context: Value,
    pub snapshots: Vec<Snapshot>,
}

impl RunOutcome {
    pub fn tokens_at(&self, node_ref: &str) -> Vec<&Token> {
        self.tokens.iter().filter(|t| t.node_ref == node_ref).collect()
    }

    pub fn token(&self, id: &TokenId) -> Option<&Token> {
        self.tokens.iter().find(|t| &t.id == id)
    }

    /// Read a dot path from the final context.
    pub fn read(&self, path: &str) -> Option<Value> {
        let parsed = ContextPath::parse(path).ok()?;
        let section = self.context.get(parsed.section().key())?;
        lookup(section, parsed.segments()).cloned()
    }

    /// The final output, or the reason there is none.
    pub fn output(&self) -> Result<&FinalOutput> {
        match (self.status, &self.final_output, &self.failure) {
            (RunStatus::Completed, Some(output), _) => Ok(output),
            (RunStatus::Cancelled, _, _) => Err(FlowError::Cancelled),
            (_, _, Some(failure)) => Err(FlowError::RunFailed {
                kind: failure.kind.clone(),
                message: failure.message.clone(),
            }),
            (status, _, _) => Err(FlowError::RunClosed(format!("run {} is {}", self.run_id, status))),
        }
    }
}
