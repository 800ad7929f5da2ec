//! ktest - boot a kernel build in a short-lived libvirt VM.
//!
//! One invocation is one test session: the kernel under test and a
//! freshly composed initramfs are uploaded into a storage pool, a
//! transient domain is defined and booted, and the guest is supervised
//! until it shuts down, times out, panics, or the operator interrupts.
//! Every hypervisor-side resource the session created is released
//! before the process exits, whatever the outcome.
//!
//! ## Modules
//!
//! - `session`: top-level state machine driving a whole run
//! - `hv_session`: pool lock and hypervisor-side cleanup
//! - `controller`: define/start/stop/status/delete for one domain
//! - `initramfs`: composes the ephemeral boot payload
//! - `pool`: volume provisioning and device descriptor assembly
//! - `hypervisor`: connection capability (virsh backend + in-memory fake)

pub mod cli;
pub mod config;
pub mod console;
pub mod controller;
pub mod deps;
pub mod domain_xml;
pub mod error;
pub mod hv_session;
pub mod hypervisor;
pub mod initramfs;
pub mod pool;
pub mod session;
pub mod spec;

// Re-export commonly used types
pub use error::SessionError;
pub use hypervisor::{DomainState, FakeHypervisor, Hypervisor, VirshHypervisor};
pub use session::{Outcome, SessionOrchestrator, SessionResult};
pub use spec::VmSpec;
