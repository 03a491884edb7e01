//! Side-effecting code: persistence, configuration, process execution, and prompts.

pub mod adapter;
pub mod config;
pub mod ids;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod store;
