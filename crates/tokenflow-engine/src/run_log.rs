use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tokenflow_core::trace::{TraceCategory, TraceEvent};
use tokenflow_core::types::RunId;

/// JSONL trace writer.
///
/// Consumes trace events from the EventBus and writes the events of one run
/// as JSONL (one JSON object per line) to `{log_dir}/{run_id}.jsonl`. The file
/// is append-only and flushed per line, so a crash keeps every line written
/// before it.
pub struct TraceWriter {
    log_dir: PathBuf,
    level: u8,
}

impl TraceWriter {
    /// `level` controls verbosity: 1=operation, 2=+decision and dispatch,
    /// 3=+context writes.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Run the writer as a background task.
    ///
    /// `rx` must be subscribed before the run emits its first event. Stops at
    /// the run's final event, on cancellation, or when the bus closes.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<TraceEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create trace directory");
            return;
        }

        let log_path = self.path_for(&run_id);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open trace file");
                return;
            }
        };

        info!(path = %log_path.display(), run_id = %run_id, "TraceWriter started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("TraceWriter cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id != run_id {
                                continue;
                            }
                            if self.accepts(&event) {
                                if let Ok(json) = serde_json::to_string(&event) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write trace entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush trace");
                                    }
                                }
                            }
                            if event.kind.ends_run() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "TraceWriter lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, TraceWriter stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "TraceWriter finished");
    }

    /// Level filter by category.
    fn accepts(&self, event: &TraceEvent) -> bool {
        let needed = match event.category {
            TraceCategory::Operation => 1,
            TraceCategory::Decision | TraceCategory::Dispatch => 2,
            TraceCategory::Sql => 3,
        };
        self.level >= needed
    }
}
