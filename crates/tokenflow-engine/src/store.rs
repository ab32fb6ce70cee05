use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use tokenflow_core::error::{FlowError, Result};
use tokenflow_core::types::{RunFailure, RunId, RunStatus};

use crate::completion::FinalOutput;
use crate::snapshot::{Snapshot, SnapshotReason};
use crate::sync::SiblingGroup;
use crate::token::Token;

/// Everything needed to inspect or resume a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: RunId,
    /// `"<definition id>@<version>"`.
    pub workflow_ref: String,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
    pub status: RunStatus,
    /// Full context document, `_branch` included.
    pub context: serde_json::Value,
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub groups: Vec<SiblingGroup>,
    pub last_sequence: u64,
    #[serde(default)]
    pub final_output: Option<FinalOutput>,
    #[serde(default)]
    pub failure: Option<RunFailure>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Tokens that still keep the run alive.
    pub fn active_tokens(&self) -> Vec<&Token> {
        self.tokens.iter().filter(|t| !t.is_terminal()).collect()
    }
}

/// One row of `list_runs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: RunId,
    pub workflow_ref: String,
    pub parent_run_id: Option<RunId>,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

/// Persistent run store backed by SQLite.
pub struct RunStore {
    conn: Mutex<Connection>,
}

impl RunStore {
    /// Open or create the run database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| FlowError::Database(format!("Failed to open run store: {}", e)))?;
        Self::init(conn)
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| FlowError::Database(format!("Failed to open run store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS runs (
                 id TEXT PRIMARY KEY,
                 workflow_ref TEXT NOT NULL,
                 parent_run_id TEXT,
                 status TEXT NOT NULL,
                 record TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 sequence INTEGER NOT NULL,
                 reason TEXT NOT NULL,
                 data TEXT NOT NULL,
                 taken_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_snapshots_run
                 ON snapshots(run_id, sequence);
             CREATE INDEX IF NOT EXISTS idx_runs_updated
                 ON runs(updated_at DESC);",
        )
        .map_err(|e| FlowError::Database(format!("Failed to initialize run store schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))
    }

    /// Insert or replace a run record.
    pub fn save_run(&self, record: &RunRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (id, workflow_ref, parent_run_id, status, record, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 record = excluded.record,
                 updated_at = excluded.updated_at",
            params![
                record.id.as_str(),
                record.workflow_ref,
                record.parent_run_id.as_ref().map(|p| p.as_str()),
                record.status.as_str(),
                json,
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| FlowError::Database(format!("Failed to save run: {}", e)))?;
        Ok(())
    }

    pub fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record FROM runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| FlowError::Database(format!("Failed to load run: {}", e)))?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Most recently updated runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, workflow_ref, parent_run_id, status, updated_at
                 FROM runs
                 ORDER BY updated_at DESC
                 LIMIT ?1",
            )
            .map_err(|e| FlowError::Database(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let parent: Option<String> = row.get(2)?;
                let status: String = row.get(3)?;
                let ts: String = row.get(4)?;
                Ok(RunSummary {
                    id: RunId(row.get(0)?),
                    workflow_ref: row.get(1)?,
                    parent_run_id: parent.map(RunId),
                    status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
                    updated_at: parse_ts(&ts),
                })
            })
            .map_err(|e| FlowError::Database(format!("Failed to list runs: {}", e)))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FlowError::Database(format!("Failed to read run row: {}", e)))
    }

    pub fn save_snapshot(&self, run_id: &RunId, snapshot: &Snapshot) -> Result<()> {
        let data = serde_json::to_string(&snapshot.data)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO snapshots (run_id, sequence, reason, data, taken_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id.as_str(),
                snapshot.sequence as i64,
                snapshot.reason.as_str(),
                data,
                snapshot.taken_at.to_rfc3339(),
            ],
        )
        .map_err(|e| FlowError::Database(format!("Failed to save snapshot: {}", e)))?;
        Ok(())
    }

    /// Snapshots of a run in sequence order.
    pub fn snapshots(&self, run_id: &str) -> Result<Vec<Snapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT sequence, reason, data, taken_at
                 FROM snapshots
                 WHERE run_id = ?1
                 ORDER BY sequence ASC, id ASC",
            )
            .map_err(|e| FlowError::Database(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![run_id], |row| {
                let reason: String = row.get(1)?;
                let data: String = row.get(2)?;
                let ts: String = row.get(3)?;
                Ok((row.get::<_, i64>(0)?, reason, data, ts))
            })
            .map_err(|e| FlowError::Database(format!("Failed to list snapshots: {}", e)))?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (sequence, reason, data, ts) =
                row.map_err(|e| FlowError::Database(format!("Failed to read snapshot row: {}", e)))?;
            snapshots.push(Snapshot {
                sequence: sequence as u64,
                reason: SnapshotReason::parse(&reason).unwrap_or(SnapshotReason::Requested),
                taken_at: parse_ts(&ts),
                data: serde_json::from_str(&data)?,
            });
        }
        Ok(snapshots)
    }

    /// Delete a run and its snapshots. Returns whether the run existed.
    pub fn delete_run(&self, run_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM snapshots WHERE run_id = ?1", params![run_id])
            .map_err(|e| FlowError::Database(format!("Failed to delete snapshots: {}", e)))?;
        let deleted = conn
            .execute("DELETE FROM runs WHERE id = ?1", params![run_id])
            .map_err(|e| FlowError::Database(format!("Failed to delete run: {}", e)))?;
        Ok(deleted > 0)
    }
}

fn parse_ts(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
