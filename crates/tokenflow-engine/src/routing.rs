use serde::Serialize;

use tokenflow_core::definition::{Transition, WorkflowDefinition};
use tokenflow_core::error::{FlowError, Result};
use tokenflow_core::traits::ContextRead;

use crate::condition::{self, PredicateRegistry};

/// What a completed token does next.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    /// The node has no outgoing transitions; the branch ends here.
    Terminal,
    /// Exactly one continuation token on `to_node_ref`.
    Continue { transition_id: String, to_node_ref: String },
    /// `count` sibling tokens on `to_node_ref`, forming cohort `sibling_group`.
    FanOut {
        transition_id: String,
        to_node_ref: String,
        count: u32,
        sibling_group: String,
    },
    /// Arrive at the fan-in on `transition_id`.
    Synchronize { transition_id: String, to_node_ref: String },
}

impl RoutingDecision {
    pub fn transition_id(&self) -> Option<&str> {
        match self {
            Self::Terminal => None,
            Self::Continue { transition_id, .. }
            | Self::FanOut { transition_id, .. }
            | Self::Synchronize { transition_id, .. } => Some(transition_id),
        }
    }

    fn from_transition(t: &Transition) -> Self {
        if t.synchronization.is_some() {
            return Self::Synchronize {
                transition_id: t.id.clone(),
                to_node_ref: t.to_node_ref.clone(),
            };
        }
        match (t.is_fan_out(), &t.sibling_group) {
            (true, Some(group)) => Self::FanOut {
                transition_id: t.id.clone(),
                to_node_ref: t.to_node_ref.clone(),
                count: t.spawn_count(),
                sibling_group: group.clone(),
            },
            _ => Self::Continue {
                transition_id: t.id.clone(),
                to_node_ref: t.to_node_ref.clone(),
            },
        }
    }
}

/// One condition evaluation, kept for the trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub transition_id: String,
    pub priority: i32,
    pub matched: bool,
}

#[derive(Debug, Clone)]
pub struct Routed {
    pub decision: RoutingDecision,
    pub evaluated: Vec<Evaluation>,
}

/// Pick the first outgoing transition (priority ascending) whose condition
/// is absent or true.
///
/// A node without outgoing transitions is terminal. A node whose transitions
/// all evaluate false fails with `RoutingExhausted`.
pub fn route(
    definition: &WorkflowDefinition,
    token_id: &str,
    node_ref: &str,
    context: &dyn ContextRead,
    predicates: &PredicateRegistry,
) -> Result<Routed> {
    if definition.node(node_ref).is_none() {
        return Err(FlowError::UnknownNode(node_ref.to_string()));
    }

    let outgoing = definition.outgoing(node_ref);
    if outgoing.is_empty() {
        return Ok(Routed {
            decision: RoutingDecision::Terminal,
            evaluated: vec![],
        });
    }

    let mut evaluated = Vec::new();
    for t in outgoing {
        let matched = t
            .condition
            .as_ref()
            .map_or(true, |c| condition::evaluate(c, context, predicates));
        evaluated.push(Evaluation {
            transition_id: t.id.clone(),
            priority: t.priority,
            matched,
        });
        if matched {
            return Ok(Routed {
                decision: RoutingDecision::from_transition(t),
                evaluated,
            });
        }
    }

    Err(FlowError::RoutingExhausted {
        token_id: token_id.to_string(),
        node_ref: node_ref.to_string(),
    })
}
