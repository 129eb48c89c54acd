//! CLI command handlers

pub mod backup;
pub mod checkpoint;
pub mod config;
pub mod status;
pub mod sync;
