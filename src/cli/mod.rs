//! Command-line interface for ml-forge.
//!
//! Provides commands to start and resume runs, inspect their status, and
//! check or run a single Python file through the sandbox.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
