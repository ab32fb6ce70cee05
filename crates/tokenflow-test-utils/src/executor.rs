use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use tokenflow_core::error::{FlowError, Result};
use tokenflow_core::traits::{Executor, TaskRequest};

type Responder = Arc<dyn Fn(&TaskRequest) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
struct Script {
    respond: Responder,
    delay: Duration,
    branch_delays: HashMap<u32, Duration>,
    hang: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            respond: Arc::new(|_| Ok(json!({}))),
            delay: Duration::ZERO,
            branch_delays: HashMap::new(),
            hang: false,
        }
    }
}

/// Executor driven by per-node scripts. Unscripted nodes answer `{}`.
///
/// Delays use `tokio::time::sleep`, so tests under `start_paused` advance
/// through them deterministically.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<TaskRequest>>,
    /// Calls whose future ran to the end, in completion order.
    finished: Mutex<Vec<TaskRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&mut self, node_ref: &str) -> &mut Script {
        self.scripts.entry(node_ref.to_string()).or_default()
    }

    /// Answer tasks at `node_ref` with `f(request)`.
    pub fn on<F>(mut self, node_ref: &str, f: F) -> Self
    where
        F: Fn(&TaskRequest) -> Result<Value> + Send + Sync + 'static,
    {
        self.script(node_ref).respond = Arc::new(f);
        self
    }

    /// Answer tasks at `node_ref` with a fixed value.
    pub fn returning(self, node_ref: &str, output: Value) -> Self {
        self.on(node_ref, move |_| Ok(output.clone()))
    }

    /// Answer tasks at `node_ref` with one value per branch index.
    pub fn per_branch(self, node_ref: &str, outputs: Vec<Value>) -> Self {
        self.on(node_ref, move |req| {
            let idx = req.branch.as_ref().map_or(0, |b| b.branch_index as usize);
            Ok(outputs.get(idx).cloned().unwrap_or(Value::Null))
        })
    }

    /// Fail every task at `node_ref`.
    pub fn failing(self, node_ref: &str, message: &str) -> Self {
        let message = message.to_string();
        self.on(node_ref, move |req| {
            Err(FlowError::TaskExecutionFailed {
                token_id: req.token_id.to_string(),
                node_ref: req.node_ref.clone(),
                message: message.clone(),
            })
        })
    }

    pub fn delayed(mut self, node_ref: &str, delay: Duration) -> Self {
        self.script(node_ref).delay = delay;
        self
    }

    /// Delay only the branch with `branch_index` at `node_ref`.
    pub fn branch_delay(mut self, node_ref: &str, branch_index: u32, delay: Duration) -> Self {
        self.script(node_ref).branch_delays.insert(branch_index, delay);
        self
    }

    /// Tasks at `node_ref` never finish.
    pub fn hanging(mut self, node_ref: &str) -> Self {
        self.script(node_ref).hang = true;
        self
    }

    /// Every request received so far, in dispatch order.
    pub fn calls(&self) -> Vec<TaskRequest> {
        self.lock_calls().clone()
    }

    pub fn calls_for(&self, node_ref: &str) -> Vec<TaskRequest> {
        self.lock_calls()
            .iter()
            .filter(|r| r.node_ref == node_ref)
            .cloned()
            .collect()
    }

    pub fn finished_for(&self, node_ref: &str) -> Vec<TaskRequest> {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.node_ref == node_ref)
            .cloned()
            .collect()
    }

    fn lock_calls(&self) -> MutexGuard<'_, Vec<TaskRequest>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Executor for ScriptedExecutor {
    fn dispatch_task(&self, request: TaskRequest) -> BoxFuture<'_, Result<Value>> {
        self.lock_calls().push(request.clone());
        let script = self.scripts.get(&request.node_ref).cloned().unwrap_or_default();
        Box::pin(async move {
            let delay = request
                .branch
                .as_ref()
                .and_then(|b| script.branch_delays.get(&b.branch_index).copied())
                .unwrap_or(script.delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if script.hang {
                std::future::pending::<()>().await;
            }
            let result = (script.respond)(&request);
            self.finished
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request);
            result
        })
    }
}
