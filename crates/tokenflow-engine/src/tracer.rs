use std::sync::Arc;

use chrono::Utc;

use tokenflow_core::event::EventBus;
use tokenflow_core::trace::{TraceCategory, TraceEvent, TraceKind};
use tokenflow_core::types::{RunId, TokenId};

/// Append-only, sequence-numbered trace of one run.
///
/// Every event is kept in memory for the run's outcome and published on the
/// shared bus for sinks such as the JSONL trace writer.
pub struct Tracer {
    run_id: RunId,
    sequence: u64,
    events: Vec<TraceEvent>,
    bus: Arc<EventBus>,
}

impl Tracer {
    pub fn new(run_id: RunId, bus: Arc<EventBus>) -> Self {
        Self::resume_at(run_id, bus, 0)
    }

    /// Continue numbering after `last_sequence`, e.g. after a resume.
    pub fn resume_at(run_id: RunId, bus: Arc<EventBus>, last_sequence: u64) -> Self {
        Self {
            run_id,
            sequence: last_sequence,
            events: Vec::new(),
            bus,
        }
    }

    pub fn emit(
        &mut self,
        kind: TraceKind,
        token_id: Option<&TokenId>,
        node_ref: Option<&str>,
        payload: serde_json::Value,
    ) -> u64 {
        self.sequence += 1;
        let event = TraceEvent {
            sequence: self.sequence,
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
            kind,
            category: kind.category(),
            token_id: token_id.cloned(),
            node_ref: node_ref.map(str::to_string),
            payload,
        };
        self.bus.publish(event.clone());
        self.events.push(event);
        self.sequence
    }

    /// Sequence number of the last emitted event (0 before the first).
    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }
}

/// Query helpers over a slice of trace events.
pub trait TraceQuery {
    fn of_kind(&self, kind: TraceKind) -> Vec<&TraceEvent>;
    fn of_category(&self, category: TraceCategory) -> Vec<&TraceEvent>;
    fn for_token(&self, token_id: &TokenId) -> Vec<&TraceEvent>;
    fn for_node(&self, node_ref: &str) -> Vec<&TraceEvent>;
}

impl TraceQuery for [TraceEvent] {
    fn of_kind(&self, kind: TraceKind) -> Vec<&TraceEvent> {
        self.iter().filter(|e| e.kind == kind).collect()
    }

    fn of_category(&self, category: TraceCategory) -> Vec<&TraceEvent> {
        self.iter().filter(|e| e.category == category).collect()
    }

    fn for_token(&self, token_id: &TokenId) -> Vec<&TraceEvent> {
        self.iter()
            .filter(|e| e.token_id.as_ref() == Some(token_id))
            .collect()
    }

    fn for_node(&self, node_ref: &str) -> Vec<&TraceEvent> {
        self.iter()
            .filter(|e| e.node_ref.as_deref() == Some(node_ref))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_is_monotonic_from_one() {
        let mut tracer = Tracer::new(RunId::from_string("r"), Arc::new(EventBus::new(8)));
        assert_eq!(tracer.last_sequence(), 0);
        let a = tracer.emit(TraceKind::WorkflowStarted, None, None, json!({}));
        let b = tracer.emit(TraceKind::TokenCreated, None, Some("start"), json!({}));
        assert_eq!((a, b), (1, 2));
        let seqs: Vec<u64> = tracer.events().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_resume_continues_numbering() {
        let mut tracer = Tracer::resume_at(RunId::from_string("r"), Arc::new(EventBus::new(8)), 41);
        assert_eq!(tracer.emit(TraceKind::WorkflowResumed, None, None, json!({})), 42);
    }

    #[test]
    fn test_events_are_published() {
        let bus = Arc::new(EventBus::new(8));
        let mut rx = bus.subscribe();
        let mut tracer = Tracer::new(RunId::from_string("r"), bus);
        tracer.emit(TraceKind::WorkflowStarted, None, None, json!({"x": 1}));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, TraceKind::WorkflowStarted);
        assert_eq!(event.category, TraceCategory::Operation);
    }

    #[test]
    fn test_queries() {
        let mut tracer = Tracer::new(RunId::from_string("r"), Arc::new(EventBus::new(8)));
        let t = TokenId::from_string("t1");
        tracer.emit(TraceKind::TokenCreated, Some(&t), Some("a"), json!({}));
        tracer.emit(TraceKind::TaskDispatched, Some(&t), Some("a"), json!({}));
        tracer.emit(TraceKind::TransitionSelected, None, Some("b"), json!({}));
        let events = tracer.events();
        assert_eq!(events.for_token(&t).len(), 2);
        assert_eq!(events.for_node("b").len(), 1);
        assert_eq!(events.of_category(TraceCategory::Dispatch).len(), 1);
        assert_eq!(events.of_kind(TraceKind::TokenCreated).len(), 1);
    }
}
