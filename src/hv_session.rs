//! Hypervisor session: pool locking and teardown.
//!
//! The pool lock is the only cross-session shared resource. It is a
//! host-side lock file created with `O_EXCL`, scoped to the pool name,
//! recording the holder's pid and domain name so `--force` can preempt
//! the conflicting session. Lock and unlock are split from finish and
//! clean so the orchestrator controls teardown ordering: by default it
//! cleans volumes first and unlocks afterwards, so a queued session
//! never adopts a pool whose volumes are mid-deletion.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::hypervisor::Hypervisor;
use crate::pool::ResourcePool;

/// One locked connection to a hypervisor endpoint.
pub struct HypervisorSession {
    hv: Arc<dyn Hypervisor>,
    pool: String,
    lock_path: PathBuf,
    held: bool,
}

impl HypervisorSession {
    /// `run_dir` hosts the lock file; it must be on a filesystem all
    /// sessions targeting the pool share.
    pub fn new(hv: Arc<dyn Hypervisor>, pool: &str, run_dir: &std::path::Path) -> Self {
        Self {
            hv,
            pool: pool.to_string(),
            lock_path: run_dir.join(format!("ktest-{pool}.lock")),
            held: false,
        }
    }

    /// Acquire the exclusive pool lock.
    ///
    /// With `force`, a conflicting session's domain (recorded in its
    /// lock file) is destroyed and the lock taken over. Without it, a
    /// held lock is [`SessionError::LockContention`].
    pub async fn lock(&mut self, domain_name: &str, force: bool) -> Result<(), SessionError> {
        loop {
            match std::fs::File::create_new(&self.lock_path) {
                Ok(file) => {
                    use std::io::Write;
                    let mut file = file;
                    let _ = writeln!(file, "{} {}", std::process::id(), domain_name);
                    self.held = true;
                    info!(pool = %self.pool, lock = %self.lock_path.display(), "Pool lock acquired");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let (holder_pid, holder_domain) = read_lock_file(&self.lock_path);
                    if !force && pid_alive(holder_pid) {
                        return Err(SessionError::LockContention {
                            pool: self.pool.clone(),
                            holder: holder_pid,
                        });
                    }
                    if force {
                        info!(
                            pool = %self.pool,
                            holder_pid,
                            holder_domain = %holder_domain,
                            "Preempting conflicting session"
                        );
                        if !holder_domain.is_empty() {
                            if let Err(e) = self.hv.domain_destroy(&holder_domain).await {
                                debug!(domain = %holder_domain, error = %e, "Preempted domain was not running");
                            }
                        }
                    } else {
                        // Holder process is gone; its session can never
                        // unlock, so the file must not starve the pool.
                        warn!(
                            pool = %self.pool,
                            holder_pid,
                            "Removing stale lock left by a dead session"
                        );
                    }
                    if let Err(e) = std::fs::remove_file(&self.lock_path) {
                        if e.kind() != ErrorKind::NotFound {
                            return Err(SessionError::Provision(format!(
                                "cannot take over lock {}: {e}",
                                self.lock_path.display()
                            )));
                        }
                    }
                    // Retake on the next loop iteration.
                }
                Err(e) => {
                    return Err(SessionError::Provision(format!(
                        "cannot create lock {}: {e}",
                        self.lock_path.display()
                    )));
                }
            }
        }
    }

    /// Release the pool lock. Idempotent; never an error when the lock
    /// is not held.
    pub fn unlock(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => info!(pool = %self.pool, "Pool lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(lock = %self.lock_path.display(), error = %e, "Failed to remove lock file"),
        }
    }

    /// Whether this session currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.held
    }

    /// Remove every volume the session created. Individual failures
    /// are reported, not raised; the sweep always covers all volumes.
    pub async fn clean(&self, resources: &ResourcePool) -> Vec<String> {
        resources.clean().await
    }

    /// Close the hypervisor connection. Safe even if provisioning
    /// never ran.
    pub async fn finish(&self) {
        if let Err(e) = self.hv.close().await {
            warn!(error = %e, "Failed to close hypervisor connection");
        }
    }
}

impl Drop for HypervisorSession {
    fn drop(&mut self) {
        // Last line of defense; the orchestrator unlocks explicitly.
        self.unlock();
    }
}

/// Whether the recorded holder process still exists. A pid of 0 (an
/// unparseable lock file) counts as dead.
fn pid_alive(pid: u32) -> bool {
    pid != 0 && std::path::Path::new(&format!("/proc/{pid}")).exists()
}

fn read_lock_file(path: &std::path::Path) -> (u32, String) {
    let contents = std::fs::read_to_string(path).unwrap_or_default();
    let mut parts = contents.split_whitespace();
    let pid = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let domain = parts.next().unwrap_or("").to_string();
    (pid, domain)
}
