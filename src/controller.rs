//! Domain lifecycle control.
//!
//! Thin, contract-carrying wrapper over the hypervisor capability:
//! `stop` and `delete` are idempotent on absent domains, `define`
//! re-checks device invariants before anything reaches the hypervisor,
//! and `restart` documents the partial outcome when the restart's
//! start half fails.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::domain_xml::{domain_xml, DomainDef};
use crate::error::SessionError;
use crate::hypervisor::{DomainState, HvError, Hypervisor};

/// Handle to a defined domain.
#[derive(Debug, Clone)]
pub struct DomainHandle {
    pub name: String,
}

/// Defines, starts, stops, and deletes one named domain.
pub struct VmController {
    hv: Arc<dyn Hypervisor>,
}

impl VmController {
    pub fn new(hv: Arc<dyn Hypervisor>) -> Self {
        Self { hv }
    }

    /// Register the domain with the hypervisor without starting it.
    pub async fn define(&self, def: &DomainDef) -> Result<DomainHandle, SessionError> {
        let mut serials = HashSet::new();
        for disk in &def.disks {
            if !serials.insert(disk.serial.as_str()) {
                return Err(SessionError::Provision(format!(
                    "duplicate disk serial '{}'",
                    disk.serial
                )));
            }
        }
        let xml = domain_xml(def);
        self.hv
            .domain_define(&xml)
            .await
            .map_err(|e| SessionError::Provision(e.to_string()))?;
        info!(domain = %def.name, "Domain defined");
        Ok(DomainHandle {
            name: def.name.clone(),
        })
    }

    /// Start a defined domain.
    pub async fn start(&self, handle: &DomainHandle) -> Result<(), SessionError> {
        self.hv
            .domain_start(&handle.name)
            .await
            .map_err(|e| SessionError::Boot(e.to_string()))?;
        info!(domain = %handle.name, "Domain started");
        Ok(())
    }

    /// Destroy the domain's runtime. Idempotent on an already-absent
    /// domain.
    pub async fn stop(&self, handle: &DomainHandle) -> Result<(), SessionError> {
        match self.hv.domain_destroy(&handle.name).await {
            Ok(()) => {
                info!(domain = %handle.name, "Domain stopped");
                Ok(())
            }
            Err(HvError::DomainNotFound(_)) => Ok(()),
            // Destroying a domain that is defined but not running is
            // the state we wanted.
            Err(HvError::Operation(msg)) if msg.contains("not running") => Ok(()),
            Err(e) => Err(SessionError::Boot(e.to_string())),
        }
    }

    /// Stop then start, preserving the definition. If the start half
    /// fails the domain is left absent; callers observe that through
    /// [`VmController::status`] rather than a rolled-back state.
    pub async fn restart(&self, handle: &DomainHandle) -> Result<(), SessionError> {
        self.stop(handle).await?;
        self.start(handle).await
    }

    /// Read-only state poll.
    pub async fn status(&self, handle: &DomainHandle) -> Result<DomainState, SessionError> {
        self.hv
            .domain_state(&handle.name)
            .await
            .map_err(|e| SessionError::Boot(e.to_string()))
    }

    /// Remove the domain definition so it does not linger as a
    /// shutoff entry. Idempotent on an already-deleted domain.
    pub async fn delete(&self, handle: &DomainHandle) -> Result<(), SessionError> {
        match self.hv.domain_undefine(&handle.name).await {
            Ok(()) => {
                debug!(domain = %handle.name, "Domain deleted");
                Ok(())
            }
            Err(HvError::DomainNotFound(_)) => Ok(()),
            Err(e) => Err(SessionError::Boot(e.to_string())),
        }
    }
}
