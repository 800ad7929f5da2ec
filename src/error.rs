//! Session-level error taxonomy.
//!
//! Errors raised before the pool lock is held abort the run with no
//! cleanup; everything after the lock routes through the cleanup path
//! first. Cleanup failures never surface here: they are collected on
//! the `SessionResult` so the primary outcome is always reported.

use thiserror::Error;

/// Errors a test session can fail with.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A required host binary is not on PATH. Pre-flight, nothing was created.
    #[error("required host tool not found on PATH: {0}")]
    DependencyMissing(String),

    /// The hypervisor endpoint could not be reached.
    #[error("cannot reach hypervisor at {uri}: {reason}")]
    HypervisorUnavailable { uri: String, reason: String },

    /// Another session holds the pool lock and --force was not given.
    #[error("pool '{pool}' is locked by another session (pid {holder})")]
    LockContention { pool: String, holder: u32 },

    /// A size string had no valid K/M/G suffix.
    #[error("invalid size '{0}': expected a number followed by K, M or G")]
    InvalidSize(String),

    /// The spec is malformed or an artifact could not be provisioned.
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// The domain was defined but could not be started or supervised.
    /// Covers both a rejected start request and a domain that never
    /// reaches a supervisable state: direct kernel boot makes start
    /// synchronous, so there is no separate boot-timeout window.
    #[error("domain failed to start: {0}")]
    Boot(String),

    /// Aggregated teardown failures. Non-fatal, reported after the
    /// primary outcome.
    #[error("cleanup left residue: {}", .0.join("; "))]
    Cleanup(Vec<String>),
}

impl SessionError {
    /// Process exit code for pre-lock failures. Terminal outcomes that
    /// reach cleanup map through [`crate::SessionResult::exit_code`]
    /// instead.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::DependencyMissing(_) => 5,
            SessionError::LockContention { .. } => 6,
            _ => 4,
        }
    }
}
