//! In-memory hypervisor for exercising the orchestrator without libvirt.
//!
//! The fake records domain and volume state, supports failure
//! injection, and scripts the guest's behavior: shut off after a number
//! of state polls, crash after a number of polls, and a schedule of
//! crash-volume allocation readings for the kdump stabilization wait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{DomainState, HvError, Hypervisor};

#[derive(Debug, Clone)]
struct FakeDomain {
    xml: String,
    runtime: DomainState,
    polls: u32,
}

#[derive(Debug, Clone)]
struct FakeVolume {
    capacity: u64,
    uploaded: u64,
}

#[derive(Default)]
struct GuestScript {
    /// Report Shutoff after this many Running-state polls.
    shutoff_after: Option<u32>,
    /// Report Crashed after this many Running-state polls.
    crash_after: Option<u32>,
    /// Successive allocation readings for volumes named *crashdrive*.
    /// The last reading repeats once the schedule is exhausted.
    crash_allocations: Vec<u64>,
}

#[derive(Default)]
struct State {
    domains: HashMap<String, FakeDomain>,
    volumes: HashMap<(String, String), FakeVolume>,
    script: GuestScript,
    crash_poll: usize,
    fail_define: bool,
    fail_start: bool,
    /// Remaining successful starts before every start fails.
    start_budget: Option<u32>,
    fail_vol_delete: Vec<String>,
}

/// In-memory [`Hypervisor`] implementation.
pub struct FakeHypervisor {
    state: Mutex<State>,
    closed: AtomicBool,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Guest shuts itself down after `polls` state polls.
    pub fn shutoff_after(self, polls: u32) -> Self {
        self.state.lock().unwrap().script.shutoff_after = Some(polls);
        self
    }

    /// Guest crashes after `polls` state polls.
    pub fn crash_after(self, polls: u32) -> Self {
        self.state.lock().unwrap().script.crash_after = Some(polls);
        self
    }

    /// Allocation readings reported for crash-drive volumes, in order.
    pub fn crash_allocations(self, readings: Vec<u64>) -> Self {
        self.state.lock().unwrap().script.crash_allocations = readings;
        self
    }

    /// All define calls fail.
    pub fn failing_define(self) -> Self {
        self.state.lock().unwrap().fail_define = true;
        self
    }

    /// All start calls fail.
    pub fn failing_start(self) -> Self {
        self.state.lock().unwrap().fail_start = true;
        self
    }

    /// The first `n` start calls succeed, every later one fails.
    pub fn fail_start_after(self, n: u32) -> Self {
        self.state.lock().unwrap().start_budget = Some(n);
        self
    }

    /// Deleting the named volume fails.
    pub fn failing_vol_delete(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .fail_vol_delete
            .push(name.to_string());
        self
    }

    /// Pre-seed a running domain, as left behind by another session.
    pub fn with_running_domain(self, name: &str) -> Self {
        self.state.lock().unwrap().domains.insert(
            name.to_string(),
            FakeDomain {
                xml: String::new(),
                runtime: DomainState::Running,
                polls: 0,
            },
        );
        self
    }

    // Inspection helpers for tests.

    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().unwrap().domains.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<_> = state
            .volumes
            .keys()
            .filter(|(p, _)| p == pool)
            .map(|(_, v)| v.clone())
            .collect();
        names.sort();
        names
    }

    pub fn domain_xml(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .domains
            .get(name)
            .map(|d| d.xml.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn domain_define(&self, xml: &str) -> Result<(), HvError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_define {
            return Err(HvError::Operation("define rejected".to_string()));
        }
        // The fake pulls the name out of the XML the way libvirt would.
        let name = xml_name(xml)
            .ok_or_else(|| HvError::Operation("domain XML has no <name>".to_string()))?;
        state.domains.insert(
            name,
            FakeDomain {
                xml: xml.to_string(),
                runtime: DomainState::Defined,
                polls: 0,
            },
        );
        Ok(())
    }

    async fn domain_start(&self, name: &str) -> Result<(), HvError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(HvError::Operation("start rejected".to_string()));
        }
        if let Some(budget) = state.start_budget.as_mut() {
            if *budget == 0 {
                return Err(HvError::Operation("start rejected".to_string()));
            }
            *budget -= 1;
        }
        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| HvError::DomainNotFound(name.to_string()))?;
        match domain.runtime {
            DomainState::Running | DomainState::Paused => {
                Err(HvError::Operation(format!("domain '{name}' already active")))
            }
            _ => {
                domain.runtime = DomainState::Running;
                domain.polls = 0;
                Ok(())
            }
        }
    }

    async fn domain_destroy(&self, name: &str) -> Result<(), HvError> {
        let mut state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| HvError::DomainNotFound(name.to_string()))?;
        domain.runtime = DomainState::Absent;
        Ok(())
    }

    async fn domain_undefine(&self, name: &str) -> Result<(), HvError> {
        let mut state = self.state.lock().unwrap();
        state
            .domains
            .remove(name)
            .ok_or_else(|| HvError::DomainNotFound(name.to_string()))?;
        Ok(())
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState, HvError> {
        let mut state = self.state.lock().unwrap();
        let script_shutoff = state.script.shutoff_after;
        let script_crash = state.script.crash_after;
        let Some(domain) = state.domains.get_mut(name) else {
            return Ok(DomainState::Absent);
        };
        if domain.runtime == DomainState::Running {
            domain.polls += 1;
            if let Some(n) = script_crash {
                if domain.polls > n {
                    domain.runtime = DomainState::Crashed;
                }
            }
            if let Some(n) = script_shutoff {
                if domain.runtime == DomainState::Running && domain.polls > n {
                    domain.runtime = DomainState::Shutoff;
                }
            }
        }
        Ok(domain.runtime)
    }

    async fn vol_create(&self, pool: &str, name: &str, capacity: u64) -> Result<(), HvError> {
        let mut state = self.state.lock().unwrap();
        let key = (pool.to_string(), name.to_string());
        if state.volumes.contains_key(&key) {
            return Err(HvError::Operation(format!(
                "volume '{name}' already exists in pool '{pool}'"
            )));
        }
        state.volumes.insert(
            key,
            FakeVolume {
                capacity,
                uploaded: 0,
            },
        );
        Ok(())
    }

    async fn vol_upload(&self, pool: &str, name: &str, local: &Path) -> Result<(), HvError> {
        let size = std::fs::metadata(local)?.len();
        let mut state = self.state.lock().unwrap();
        let vol = state
            .volumes
            .get_mut(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| HvError::VolumeNotFound(name.to_string()))?;
        vol.uploaded = size;
        Ok(())
    }

    async fn vol_delete(&self, pool: &str, name: &str) -> Result<(), HvError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_vol_delete.iter().any(|n| n == name) {
            return Err(HvError::Operation(format!("volume '{name}' is busy")));
        }
        state
            .volumes
            .remove(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| HvError::VolumeNotFound(name.to_string()))?;
        Ok(())
    }

    async fn vol_list(&self, pool: &str) -> Result<Vec<String>, HvError> {
        Ok(self.volume_names(pool))
    }

    async fn vol_allocation(&self, pool: &str, name: &str) -> Result<u64, HvError> {
        let mut state = self.state.lock().unwrap();
        let key = (pool.to_string(), name.to_string());
        if !state.volumes.contains_key(&key) {
            return Err(HvError::VolumeNotFound(name.to_string()));
        }
        if name.ends_with("crashdrive") && !state.script.crash_allocations.is_empty() {
            let idx = state.crash_poll.min(state.script.crash_allocations.len() - 1);
            state.crash_poll += 1;
            return Ok(state.script.crash_allocations[idx]);
        }
        Ok(state.volumes[&key].uploaded)
    }

    async fn vol_path(&self, pool: &str, name: &str) -> Result<PathBuf, HvError> {
        let state = self.state.lock().unwrap();
        let key = (pool.to_string(), name.to_string());
        if !state.volumes.contains_key(&key) {
            return Err(HvError::VolumeNotFound(name.to_string()));
        }
        Ok(PathBuf::from(format!("/fake/{pool}/{name}")))
    }

    async fn vol_download(&self, pool: &str, name: &str, dest: &Path) -> Result<(), HvError> {
        let size = {
            let state = self.state.lock().unwrap();
            let key = (pool.to_string(), name.to_string());
            let vol = state
                .volumes
                .get(&key)
                .ok_or_else(|| HvError::VolumeNotFound(name.to_string()))?;
            vol.capacity
        };
        std::fs::write(dest, format!("fake volume {name} ({size} bytes)"))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), HvError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Extract the `<name>` element, the only piece of XML the fake reads.
fn xml_name(xml: &str) -> Option<String> {
    let start = xml.find("<name>")? + "<name>".len();
    let end = xml[start..].find("</name>")? + start;
    Some(xml[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn define_start_destroy_lifecycle() {
        let hv = FakeHypervisor::new();
        hv.domain_define("<domain><name>ktest-a</name></domain>")
            .await
            .unwrap();
        assert_eq!(
            hv.domain_state("ktest-a").await.unwrap(),
            DomainState::Defined
        );

        hv.domain_start("ktest-a").await.unwrap();
        assert_eq!(
            hv.domain_state("ktest-a").await.unwrap(),
            DomainState::Running
        );

        hv.domain_destroy("ktest-a").await.unwrap();
        assert_eq!(
            hv.domain_state("ktest-a").await.unwrap(),
            DomainState::Absent
        );

        hv.domain_undefine("ktest-a").await.unwrap();
        assert!(hv.domain_names().is_empty());
    }

    #[tokio::test]
    async fn unknown_domain_state_is_absent() {
        let hv = FakeHypervisor::new();
        assert_eq!(
            hv.domain_state("nothing").await.unwrap(),
            DomainState::Absent
        );
    }

    #[tokio::test]
    async fn scripted_shutoff_fires_after_polls() {
        let hv = FakeHypervisor::new().shutoff_after(2);
        hv.domain_define("<domain><name>d</name></domain>")
            .await
            .unwrap();
        hv.domain_start("d").await.unwrap();
        assert_eq!(hv.domain_state("d").await.unwrap(), DomainState::Running);
        assert_eq!(hv.domain_state("d").await.unwrap(), DomainState::Running);
        assert_eq!(hv.domain_state("d").await.unwrap(), DomainState::Shutoff);
    }

    #[tokio::test]
    async fn scripted_crash_fires_after_polls() {
        let hv = FakeHypervisor::new().crash_after(1);
        hv.domain_define("<domain><name>d</name></domain>")
            .await
            .unwrap();
        hv.domain_start("d").await.unwrap();
        assert_eq!(hv.domain_state("d").await.unwrap(), DomainState::Running);
        assert_eq!(hv.domain_state("d").await.unwrap(), DomainState::Crashed);
    }

    #[tokio::test]
    async fn duplicate_volume_rejected() {
        let hv = FakeHypervisor::new();
        hv.vol_create("default", "v", 1024).await.unwrap();
        assert!(hv.vol_create("default", "v", 1024).await.is_err());
    }

    #[tokio::test]
    async fn crash_allocation_schedule_repeats_last_reading() {
        let hv = FakeHypervisor::new().crash_allocations(vec![0, 4096, 4096]);
        hv.vol_create("default", "ktest-t-crashdrive", 1 << 30)
            .await
            .unwrap();
        assert_eq!(
            hv.vol_allocation("default", "ktest-t-crashdrive")
                .await
                .unwrap(),
            0
        );
        for _ in 0..3 {
            assert_eq!(
                hv.vol_allocation("default", "ktest-t-crashdrive")
                    .await
                    .unwrap(),
                4096
            );
        }
    }
}
