use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tokenflow_core::error::{FlowError, Result};
use tokenflow_core::types::{BranchInfo, TokenId, TokenStatus};

/// The unit of execution. Tokens are never deleted, only transitioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: TokenId,
    pub node_ref: String,
    pub status: TokenStatus,
    /// `None` only for the run's root token.
    pub parent_token_id: Option<TokenId>,
    pub sibling_group: Option<String>,
    pub branch_index: Option<u32>,
    pub branch_total: Option<u32>,
    pub fan_out_transition_id: Option<String>,
    /// Arrival tokens folded into this continuation by a fan-in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origin_token_ids: Vec<TokenId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    pub fn branch(&self) -> Option<BranchInfo> {
        match (&self.sibling_group, self.branch_index, self.branch_total) {
            (Some(group), Some(index), Some(total)) => Some(BranchInfo::new(group.clone(), index, total)),
            _ => None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_token_id.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Same sibling group and index, or both outside any group.
    fn same_branch(&self, other: &Token) -> bool {
        self.sibling_group == other.sibling_group && self.branch_index == other.branch_index
    }
}

/// Everything the caller chooses about a new token. Ids, status and
/// timestamps are assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewToken {
    pub node_ref: String,
    pub parent_token_id: Option<TokenId>,
    pub branch: Option<BranchInfo>,
    pub fan_out_transition_id: Option<String>,
    pub origin_token_ids: Vec<TokenId>,
}

impl NewToken {
    pub fn at(node_ref: impl Into<String>) -> Self {
        Self {
            node_ref: node_ref.into(),
            ..Default::default()
        }
    }

    pub fn child_of(mut self, parent: &TokenId) -> Self {
        self.parent_token_id = Some(parent.clone());
        self
    }

    pub fn in_branch(mut self, branch: Option<BranchInfo>, fan_out_transition_id: Option<String>) -> Self {
        self.branch = branch;
        self.fan_out_transition_id = fan_out_transition_id;
        self
    }

    pub fn with_origins(mut self, origins: Vec<TokenId>) -> Self {
        self.origin_token_ids = origins;
        self
    }
}

/// Append-only token arena with secondary indexes on sibling group, node and
/// status.
#[derive(Debug, Default)]
pub struct TokenStore {
    arena: Vec<Token>,
    by_id: HashMap<TokenId, usize>,
    by_group: HashMap<String, Vec<usize>>,
    by_node: HashMap<String, Vec<usize>>,
    by_status: BTreeMap<TokenStatus, BTreeSet<usize>>,
    limit: Option<usize>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to create more than `limit` tokens.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Rebuild a store from persisted tokens, re-checking every invariant.
    pub fn restore(tokens: Vec<Token>, limit: Option<usize>) -> Result<Self> {
        let mut store = Self {
            limit,
            ..Self::default()
        };
        for token in tokens {
            store.check_shape(&token.parent_token_id, &token.branch())?;
            if token.sibling_group.is_some() && token.branch().is_none() {
                return Err(FlowError::InvalidToken(format!(
                    "token {} has a partial branch",
                    token.id
                )));
            }
            if store.by_id.contains_key(&token.id) {
                return Err(FlowError::InvalidToken(format!("duplicate token id {}", token.id)));
            }
            store.insert(token);
        }
        Ok(store)
    }

    fn check_shape(&self, parent: &Option<TokenId>, branch: &Option<BranchInfo>) -> Result<()> {
        match parent {
            None if self.root().is_some() => {
                return Err(FlowError::InvalidToken("run already has a root token".into()));
            }
            Some(parent) if !self.by_id.contains_key(parent) => {
                return Err(FlowError::UnknownToken(parent.to_string()));
            }
            _ => {}
        }
        if let Some(branch) = branch {
            if !branch.is_consistent() {
                return Err(FlowError::InvalidToken(format!(
                    "branch index {} outside 0..{} in group {}",
                    branch.branch_index, branch.branch_total, branch.sibling_group
                )));
            }
        }
        Ok(())
    }

    /// Add a new `pending` token. Creation is the only way tokens enter the store.
    pub fn create(&mut self, new: NewToken) -> Result<&Token> {
        if let Some(limit) = self.limit {
            if self.arena.len() >= limit {
                return Err(FlowError::TokenLimitExceeded(limit));
            }
        }
        self.check_shape(&new.parent_token_id, &new.branch)?;

        let now = Utc::now();
        let branch = new.branch;
        let token = Token {
            id: TokenId::new(),
            node_ref: new.node_ref,
            status: TokenStatus::Pending,
            parent_token_id: new.parent_token_id,
            sibling_group: branch.as_ref().map(|b| b.sibling_group.clone()),
            branch_index: branch.as_ref().map(|b| b.branch_index),
            branch_total: branch.as_ref().map(|b| b.branch_total),
            fan_out_transition_id: new.fan_out_transition_id,
            origin_token_ids: new.origin_token_ids,
            created_at: now,
            updated_at: now,
        };
        let idx = self.insert(token);
        Ok(&self.arena[idx])
    }

    fn insert(&mut self, token: Token) -> usize {
        let idx = self.arena.len();
        self.by_id.insert(token.id.clone(), idx);
        if let Some(group) = &token.sibling_group {
            self.by_group.entry(group.clone()).or_default().push(idx);
        }
        self.by_node.entry(token.node_ref.clone()).or_default().push(idx);
        self.by_status.entry(token.status).or_default().insert(idx);
        self.arena.push(token);
        idx
    }

    /// Move a token along the state machine, returning its previous status.
    pub fn transition(&mut self, id: &TokenId, to: TokenStatus) -> Result<TokenStatus> {
        let idx = *self
            .by_id
            .get(id)
            .ok_or_else(|| FlowError::UnknownToken(id.to_string()))?;
        let token = &mut self.arena[idx];
        let from = token.status;
        if !from.can_transition_to(to) {
            return Err(FlowError::InvalidStateTransition {
                token_id: id.to_string(),
                from,
                to,
            });
        }
        token.status = to;
        token.updated_at = Utc::now();
        if let Some(set) = self.by_status.get_mut(&from) {
            set.remove(&idx);
        }
        self.by_status.entry(to).or_default().insert(idx);
        Ok(from)
    }

    pub fn get(&self, id: &TokenId) -> Option<&Token> {
        self.by_id.get(id).map(|&idx| &self.arena[idx])
    }

    pub fn require(&self, id: &TokenId) -> Result<&Token> {
        self.get(id).ok_or_else(|| FlowError::UnknownToken(id.to_string()))
    }

    pub fn root(&self) -> Option<&Token> {
        self.arena.iter().find(|t| t.is_root())
    }

    /// Every token, in creation order.
    pub fn all(&self) -> &[Token] {
        &self.arena
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn by_sibling_group(&self, group: &str) -> Vec<&Token> {
        self.collect(self.by_group.get(group))
    }

    pub fn by_node(&self, node_ref: &str) -> Vec<&Token> {
        self.collect(self.by_node.get(node_ref))
    }

    pub fn by_status(&self, status: TokenStatus) -> Vec<&Token> {
        self.by_status
            .get(&status)
            .map(|set| set.iter().map(|&idx| &self.arena[idx]).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, status: TokenStatus) -> usize {
        self.by_status.get(&status).map_or(0, BTreeSet::len)
    }

    /// Tokens in pending, executing or waiting_for_siblings.
    pub fn active_count(&self) -> usize {
        TokenStatus::ALL
            .iter()
            .filter(|s| s.is_active())
            .map(|s| self.count(*s))
            .sum()
    }

    /// Ids of every non-terminal token, in creation order.
    pub fn active_ids(&self) -> Vec<TokenId> {
        self.arena
            .iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect()
    }

    /// The token followed by its same-branch ancestors, nearest first.
    pub fn branch_lineage(&self, id: &TokenId) -> Vec<TokenId> {
        let mut lineage = Vec::new();
        let Some(mut current) = self.get(id) else {
            return lineage;
        };
        lineage.push(current.id.clone());
        while let Some(parent) = current.parent_token_id.as_ref().and_then(|p| self.get(p)) {
            if !parent.same_branch(current) {
                break;
            }
            lineage.push(parent.id.clone());
            current = parent;
        }
        lineage
    }

    fn collect(&self, indexes: Option<&Vec<usize>>) -> Vec<&Token> {
        indexes
            .map(|v| v.iter().map(|&idx| &self.arena[idx]).collect())
            .unwrap_or_default()
    }
}
