pub mod completion;
pub mod condition;
pub mod context;
mod coordinator;
pub mod engine;
pub mod merge;
pub mod routing;
pub mod run_log;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod token;
pub mod tracer;

pub use completion::FinalOutput;
pub use context::RunContext;
pub use engine::{Engine, RunHandle, RunOutcome};
pub use run_log::TraceWriter;
pub use snapshot::{Snapshot, SnapshotReason};
pub use store::{RunRecord, RunStore, RunSummary};
pub use token::Token;
pub use tracer::TraceQuery;
