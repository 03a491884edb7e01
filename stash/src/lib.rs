//! Run orchestration for conversational project work.
//!
//! A user message becomes a run: an external planner proposes tagged command
//! blocks, the blocks are validated against the project root and a denylist,
//! and each accepted command is executed by an external coding agent. Every
//! step is recorded durably and published as an event.
//!
//! - **[`core`]**: Pure, deterministic logic (record types, block protocol,
//!   path/denylist policy, outcome rendering). No I/O.
//! - **[`io`]**: Side effects (SQLite history store, config, child processes,
//!   prompt rendering).
//! - **[`engine`]**: Worker pool driving runs through the pipeline.
//! - **[`bus`]**: Live fan-out of recorded events and a replay reducer.

pub mod bus;
pub mod core;
pub mod engine;
pub mod error;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{StashError, StashResult};
