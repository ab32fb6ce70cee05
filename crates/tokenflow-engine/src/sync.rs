use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tokenflow_core::definition::SyncStrategy;
use tokenflow_core::types::{BranchInfo, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Open,
    Completed,
    TimedOut,
    /// Closed because an enclosing group resolved first.
    Abandoned,
}

/// Runtime state of one fan-out cohort, from spawn to merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiblingGroup {
    /// Runtime id, fresh per fan-out.
    pub id: String,
    /// The definition's `siblingGroup` name.
    pub cohort: String,
    pub fan_out_transition_id: String,
    pub origin_token_id: TokenId,
    /// Branch of the token that fanned out; continuations return to it.
    #[serde(default)]
    pub origin_branch: Option<BranchInfo>,
    #[serde(default)]
    pub origin_fan_out_transition_id: Option<String>,
    pub expected: u32,
    /// Branch index -> arrival token.
    #[serde(default)]
    pub arrivals: BTreeMap<u32, TokenId>,
    #[serde(default)]
    pub sync_transition_id: Option<String>,
    #[serde(default)]
    pub first_arrival_at: Option<DateTime<Utc>>,
    pub status: GroupStatus,
}

/// Result of presenting an arrival to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrivalOutcome {
    Recorded { first: bool, arrived: usize },
    Rejected(&'static str),
}

impl SiblingGroup {
    /// Runtime group ids are unique per fan-out: a token routes only once.
    pub fn runtime_id(cohort: &str, origin: &TokenId) -> String {
        format!("{}:{}", cohort, origin)
    }

    pub fn is_open(&self) -> bool {
        self.status == GroupStatus::Open
    }

    pub fn arrived(&self) -> usize {
        self.arrivals.len()
    }

    /// Why an arrival would be rejected, if it would.
    pub fn check_arrival(&self, branch_index: u32, sync_transition_id: &str) -> Option<&'static str> {
        if !self.is_open() {
            return Some("group already resolved");
        }
        if branch_index >= self.expected {
            return Some("branch index outside group");
        }
        if self.arrivals.contains_key(&branch_index) {
            return Some("branch already arrived");
        }
        match &self.sync_transition_id {
            Some(existing) if existing != sync_transition_id => {
                Some("group is joining on another transition")
            }
            _ => None,
        }
    }

    pub fn record_arrival(
        &mut self,
        branch_index: u32,
        arrival: TokenId,
        sync_transition_id: &str,
        now: DateTime<Utc>,
    ) -> ArrivalOutcome {
        if let Some(reason) = self.check_arrival(branch_index, sync_transition_id) {
            return ArrivalOutcome::Rejected(reason);
        }

        let first = self.arrivals.is_empty();
        if first {
            self.first_arrival_at = Some(now);
            self.sync_transition_id = Some(sync_transition_id.to_string());
        }
        self.arrivals.insert(branch_index, arrival);
        ArrivalOutcome::Recorded {
            first,
            arrived: self.arrivals.len(),
        }
    }

    pub fn is_satisfied(&self, strategy: SyncStrategy) -> bool {
        match strategy {
            SyncStrategy::All => (0..self.expected).all(|i| self.arrivals.contains_key(&i)),
            SyncStrategy::Any => !self.arrivals.is_empty(),
        }
    }

    /// Branch indexes that have not arrived.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.expected)
            .filter(|i| !self.arrivals.contains_key(i))
            .collect()
    }

    /// Arrival tokens in ascending branch index.
    pub fn arrival_ids(&self) -> Vec<(u32, TokenId)> {
        self.arrivals.iter().map(|(i, id)| (*i, id.clone())).collect()
    }
}

/// All sibling groups of one run.
#[derive(Debug, Default)]
pub struct SiblingGroups {
    groups: BTreeMap<String, SiblingGroup>,
}

impl SiblingGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(groups: Vec<SiblingGroup>) -> Self {
        Self {
            groups: groups.into_iter().map(|g| (g.id.clone(), g)).collect(),
        }
    }

    pub fn insert(&mut self, group: SiblingGroup) {
        self.groups.insert(group.id.clone(), group);
    }

    pub fn get(&self, id: &str) -> Option<&SiblingGroup> {
        self.groups.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SiblingGroup> {
        self.groups.get_mut(id)
    }

    pub fn open(&self) -> impl Iterator<Item = &SiblingGroup> {
        self.groups.values().filter(|g| g.is_open())
    }

    pub fn all(&self) -> Vec<SiblingGroup> {
        self.groups.values().cloned().collect()
    }

    /// True when `group_id` is `ancestor` or was fanned out from a branch
    /// of it, at any depth.
    pub fn is_within(&self, group_id: &str, ancestor: &str) -> bool {
        let mut current = Some(group_id);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self
                .groups
                .get(id)
                .and_then(|g| g.origin_branch.as_ref())
                .map(|b| b.sibling_group.as_str());
        }
        false
    }

    /// Open groups fanned out from inside `ancestor`, excluding it.
    pub fn open_within(&self, ancestor: &str) -> Vec<String> {
        self.open()
            .filter(|g| g.id != ancestor && self.is_within(&g.id, ancestor))
            .map(|g| g.id.clone())
            .collect()
    }
}

struct Alarm {
    generation: u64,
    cancel: CancellationToken,
}

/// One wall-clock alarm per waiting sibling group.
///
/// Each arm gets a fresh generation; a firing whose generation is no longer
/// current is stale and must be ignored.
#[derive(Default)]
pub struct AlarmSet {
    alarms: HashMap<String, Alarm>,
    next_generation: u64,
}

impl AlarmSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `make(generation)` to be delivered to `mailbox` after `delay`.
    pub fn arm<M, F>(&mut self, group_id: &str, delay: Duration, mailbox: mpsc::Sender<M>, make: F) -> u64
    where
        M: Send + 'static,
        F: FnOnce(u64) -> M,
    {
        self.disarm(group_id);
        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = CancellationToken::new();
        let message = make(generation);

        let token = cancel.clone();
        let group = group_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(group = %group, generation, "Alarm cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    // The run may already be gone
                    let _ = mailbox.send(message).await;
                }
            }
        });

        self.alarms
            .insert(group_id.to_string(), Alarm { generation, cancel });
        generation
    }

    pub fn is_armed(&self, group_id: &str) -> bool {
        self.alarms.contains_key(group_id)
    }

    /// Claim a firing. Returns false for stale or already-claimed firings.
    pub fn claim(&mut self, group_id: &str, generation: u64) -> bool {
        match self.alarms.get(group_id) {
            Some(alarm) if alarm.generation == generation => {
                self.alarms.remove(group_id);
                true
            }
            _ => false,
        }
    }

    pub fn disarm(&mut self, group_id: &str) -> bool {
        match self.alarms.remove(group_id) {
            Some(alarm) => {
                alarm.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn disarm_all(&mut self) {
        for (_, alarm) in self.alarms.drain() {
            alarm.cancel.cancel();
        }
    }
}
