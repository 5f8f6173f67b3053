//! Shared utilities across pipeline stages.

pub mod files;

pub use files::{ensure_line, write_if_changed};
