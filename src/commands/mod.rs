//! CLI command handlers

pub mod discover;
pub mod extract;
pub mod probe;
pub mod reset;
pub mod status;
