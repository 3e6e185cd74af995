//! CLI command handlers.

pub mod config;
pub mod layers;
pub mod probe;
pub mod run;
