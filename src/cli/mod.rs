//! CLI layer for the task runner.
//!
//! Provides the command-line interface using clap, with commands for
//! running orchestrated tasks and inspecting the memory store.

pub mod commands;
pub mod parser;

pub use commands::{execute, CommandOutcome};
pub use parser::{Cli, Commands, OutputFormat, StoreCommands, TaskArgs};
