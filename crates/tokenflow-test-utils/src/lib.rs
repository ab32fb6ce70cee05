//! Shared test utilities for Tokenflow crates.

mod executor;
mod fixtures;
mod validator;

pub use executor::ScriptedExecutor;
pub use fixtures::*;
pub use validator::RequiredKeysValidator;
