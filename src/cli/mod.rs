//! Command-line interface

pub mod commands;

pub use commands::{cmd_fetch, cmd_init, cmd_start, load_config, CliResult};
