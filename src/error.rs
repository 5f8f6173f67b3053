//! Error taxonomy for a build run.
//!
//! Leaf code works with `anyhow::Result` and attaches context; the pipeline
//! driver classifies a fatal failure into one of these variants so the
//! operator sees which class of problem stopped the build. Best-effort step
//! failures never become a `BuildError`, they are recorded as warnings.

use thiserror::Error;

/// Fatal failure classes.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Missing tool, missing privilege, or unusable host environment.
    #[error("prerequisite check failed: {0}")]
    Prerequisite(String),

    /// Release metadata or artifact download failed.
    #[error("network error: {0}")]
    Network(String),

    /// The requested release tag does not exist upstream.
    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    /// The base image could not be unpacked.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The vendor installer failed inside the chroot.
    #[error("vendor install failed inside chroot: {0}")]
    ChrootInstall(String),

    /// Partitioning could not be resolved safely.
    #[error("partition strategy error: {0}")]
    PartitionStrategy(String),

    /// Recompression or ISO generation failed.
    #[error("image rebuild failed: {0}")]
    ImageRebuild(String),

    /// Critical post-build checks failed and strict verification is on.
    #[error("verification failed: {0} critical check(s) did not pass")]
    Verification(usize),

    /// Another run holds the working directory.
    #[error("working directory {0} is locked by another build")]
    Locked(String),

    /// SIGINT/SIGTERM arrived while the build was running.
    #[error("build interrupted")]
    Interrupted,
}

/// Which `BuildError` a fatal stage failure turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Extraction,
    ChrootInstall,
    PartitionStrategy,
    ImageRebuild,
}

impl ErrorClass {
    /// Wrap an underlying failure in the matching `BuildError`.
    pub fn wrap(self, err: &anyhow::Error) -> BuildError {
        let msg = format!("{:#}", err);
        match self {
            ErrorClass::Extraction => BuildError::Extraction(msg),
            ErrorClass::ChrootInstall => BuildError::ChrootInstall(msg),
            ErrorClass::PartitionStrategy => BuildError::PartitionStrategy(msg),
            ErrorClass::ImageRebuild => BuildError::ImageRebuild(msg),
        }
    }
}
