//! emcomm-iso library exports.
//!
//! The binary is a thin clap front end over these modules; integration tests
//! drive them directly.

pub mod artifact;
pub mod cache;
pub mod chroot;
pub mod commands;
pub mod common;
pub mod config;
pub mod error;
pub mod extract;
pub mod interrupt;
pub mod lock;
pub mod logging;
pub mod partition;
pub mod pipeline;
pub mod preflight;
pub mod preseed;
pub mod process;
pub mod release;
pub mod template;
pub mod timing;
pub mod verify;
