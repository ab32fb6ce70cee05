use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tokenflow_core::config::SnapshotConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotReason {
    EventCount,
    Interval,
    FanIn,
    Requested,
}

impl SnapshotReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventCount => "event_count",
            Self::Interval => "interval",
            Self::FanIn => "fan_in",
            Self::Requested => "requested",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "event_count" => Some(Self::EventCount),
            "interval" => Some(Self::Interval),
            "fan_in" => Some(Self::FanIn),
            "requested" => Some(Self::Requested),
            _ => None,
        }
    }
}

/// Point-in-time copy of `{input, state, output}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Trace sequence at the moment of capture.
    pub sequence: u64,
    pub reason: SnapshotReason,
    pub taken_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Decides when to snapshot and keeps the most recent ones.
///
/// Snapshots are advisory: execution never reads them back.
#[derive(Debug)]
pub struct SnapshotPolicy {
    config: SnapshotConfig,
    last_event_mark: u64,
    retained: VecDeque<Snapshot>,
}

impl SnapshotPolicy {
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            config,
            last_event_mark: 0,
            retained: VecDeque::new(),
        }
    }

    /// Start counting events from `sequence` (used on resume).
    pub fn mark(&mut self, sequence: u64) {
        self.last_event_mark = sequence;
    }

    /// True once `every_events` trace events have passed since the last
    /// event-count snapshot.
    pub fn due_by_events(&self, sequence: u64) -> bool {
        self.config.every_events > 0 && sequence >= self.last_event_mark + self.config.every_events
    }

    pub fn on_fan_in(&self) -> bool {
        self.config.on_fan_in
    }

    /// Interval cadence, if configured.
    pub fn interval(&self) -> Option<std::time::Duration> {
        (self.config.interval_ms > 0).then(|| std::time::Duration::from_millis(self.config.interval_ms))
    }

    pub fn record(&mut self, snapshot: Snapshot) {
        if snapshot.reason == SnapshotReason::EventCount {
            self.last_event_mark = snapshot.sequence;
        }
        self.retained.push_back(snapshot);
        let retain = self.config.retain.max(1);
        while self.retained.len() > retain {
            self.retained.pop_front();
        }
    }

    pub fn retained(&self) -> Vec<Snapshot> {
        self.retained.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.retained.back()
    }
}
