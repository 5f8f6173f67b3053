//! SIGINT/SIGTERM handling.
//!
//! Signals set a process-wide flag instead of killing the process, however
//! many arrive. Child tools in the foreground process group still receive
//! the signal and fail, the failure unwinds through the chroot guard, and the
//! pipeline stops at the next stage boundary. The handler never exits the
//! process, so the chroot mounts are always released on the way out.

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

static INTERRUPTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// The process-wide interrupt flag.
pub fn flag() -> Arc<AtomicBool> {
    INTERRUPTED
        .get_or_init(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

pub fn is_interrupted() -> bool {
    flag().load(Ordering::SeqCst)
}

/// Register the handlers for the process-wide flag.
pub fn install() -> Result<()> {
    register(flag())
}

fn register(flag: Arc<AtomicBool>) -> Result<()> {
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, flag.clone())
            .with_context(|| format!("Failed to register handler for signal {}", sig))?;
    }
    debug!("signal handlers installed");
    Ok(())
}
