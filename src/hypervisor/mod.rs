//! Hypervisor connection capability.
//!
//! The orchestrator only ever talks to a [`Hypervisor`]: domain
//! define/start/destroy/undefine/state plus pool volume operations.
//! There is one production implementation driving `virsh` and one
//! in-memory fake for exercising the session state machine.

pub mod fake;
pub mod virsh;

pub use fake::FakeHypervisor;
pub use virsh::VirshHypervisor;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from hypervisor operations.
#[derive(Debug, Error)]
pub enum HvError {
    #[error("cannot reach hypervisor: {0}")]
    Unavailable(String),

    #[error("domain '{0}' not found")]
    DomainNotFound(String),

    #[error("volume '{0}' not found")]
    VolumeNotFound(String),

    #[error("hypervisor operation failed: {0}")]
    Operation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Observable state of a named domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    /// No such domain, or its runtime was destroyed.
    Absent,
    /// Defined but never started.
    Defined,
    Running,
    Paused,
    /// Guest shut itself down.
    Shutoff,
    /// Guest kernel crashed (on_crash=preserve keeps it observable).
    Crashed,
}

impl DomainState {
    /// True when the guest no longer has a running runtime.
    pub fn is_down(&self) -> bool {
        matches!(self, DomainState::Absent | DomainState::Shutoff)
    }
}

/// An open connection to a hypervisor endpoint.
///
/// Implementations are cheap to share behind an `Arc`; no method takes
/// `&mut self`.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Register a domain description without starting it.
    async fn domain_define(&self, xml: &str) -> Result<(), HvError>;

    /// Start a defined domain.
    async fn domain_start(&self, name: &str) -> Result<(), HvError>;

    /// Immediately destroy a domain's runtime.
    async fn domain_destroy(&self, name: &str) -> Result<(), HvError>;

    /// Remove a domain definition.
    async fn domain_undefine(&self, name: &str) -> Result<(), HvError>;

    /// Poll a domain's state. Never mutates; unknown names report
    /// [`DomainState::Absent`].
    async fn domain_state(&self, name: &str) -> Result<DomainState, HvError>;

    /// Create an empty volume in a pool.
    async fn vol_create(&self, pool: &str, name: &str, capacity: u64) -> Result<(), HvError>;

    /// Upload a local file into an existing volume.
    async fn vol_upload(&self, pool: &str, name: &str, local: &Path) -> Result<(), HvError>;

    /// Delete a volume.
    async fn vol_delete(&self, pool: &str, name: &str) -> Result<(), HvError>;

    /// List volume names in a pool.
    async fn vol_list(&self, pool: &str) -> Result<Vec<String>, HvError>;

    /// Bytes currently allocated to a volume.
    async fn vol_allocation(&self, pool: &str, name: &str) -> Result<u64, HvError>;

    /// Host-side path backing a volume.
    async fn vol_path(&self, pool: &str, name: &str) -> Result<PathBuf, HvError>;

    /// Download a volume's contents into a local file.
    async fn vol_download(&self, pool: &str, name: &str, dest: &Path) -> Result<(), HvError>;

    /// Close the connection. Safe to call at any point of the session.
    async fn close(&self) -> Result<(), HvError>;
}
