pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod path;
pub mod trace;
pub mod traits;
pub mod types;

pub use config::FlowConfig;
pub use definition::WorkflowDefinition;
pub use error::{FlowError, Result};
pub use event::EventBus;
pub use trace::{TraceCategory, TraceEvent, TraceKind};
pub use types::*;
