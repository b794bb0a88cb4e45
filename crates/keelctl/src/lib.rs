//! keelctl library - exposes the CLI surface and handlers for tests

pub mod cli;
pub mod commands;
pub mod errors;
pub mod logging;
pub mod output;
