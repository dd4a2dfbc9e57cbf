//! Operator command-line interface.
//!
//! One binary covers the whole node: the long-running worker pool plus
//! one-shot commands for dispatching, cancelling and inspecting work.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
