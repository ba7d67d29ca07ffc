//! The `dhgen` command line: argument definitions, command handlers and
//! terminal rendering of progress and results.

pub mod args;
pub mod commands;
pub mod render;
