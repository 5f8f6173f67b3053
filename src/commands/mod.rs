//! Subcommand entry points. `main` parses arguments and loads the
//! configuration; everything after that lives here.

pub mod build;
pub mod clean;
pub mod download;
pub mod extract;
mod preflight;
pub mod show;

pub use build::{cmd_build, run_build, BuildOutcome};
pub use clean::cmd_clean;
pub use download::cmd_download;
pub use extract::cmd_extract;
pub use preflight::cmd_preflight;
pub use show::cmd_show;
