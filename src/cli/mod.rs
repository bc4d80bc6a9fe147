//! Command-line interface for orderflow.
//!
//! Provides commands for running the demo scenarios and inspecting the
//! effective configuration.

mod commands;

pub use commands::{parse_cli, resolve_config, run, run_with_cli, Cli, Commands, Scenario};
