//! Top-level session state machine.
//!
//! One run walks INIT → LOCKED → PROVISIONED → DEFINED → RUNNING →
//! terminal → CLEANED → DONE. Errors before the pool lock abort with
//! no side effects; everything after the lock flows through the
//! cleanup path, which is unconditional and best-effort. The running
//! guest is supervised by three racing signal sources (timeout timer,
//! console panic scanner, operator interrupt) plus a state poll;
//! the first committed signal wins and the losers are cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::console;
use crate::controller::{DomainHandle, VmController};
use crate::error::SessionError;
use crate::hv_session::HypervisorSession;
use crate::hypervisor::{DomainState, Hypervisor};
use crate::initramfs::InitramfsBuilder;
use crate::pool::ResourcePool;
use crate::spec::{SpecError, VmSpec};

/// Terminal outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    TimedOut,
    CrashedWithDump,
    CrashedNoDump,
    UserStopped,
    ProvisionFailed,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::CrashedWithDump => "crashed_with_dump",
            Outcome::CrashedNoDump => "crashed_no_dump",
            Outcome::UserStopped => "user_stopped",
            Outcome::ProvisionFailed => "provision_failed",
            Outcome::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished session reports. Produced exactly once, at the
/// terminal transition.
#[derive(Debug)]
pub struct SessionResult {
    pub outcome: Outcome,
    /// Failure or crash cause, when there is one.
    pub cause: Option<String>,
    pub console_log: Option<PathBuf>,
    pub kdump_image: Option<PathBuf>,
    /// Teardown failures; reported alongside, never instead of, the
    /// primary outcome.
    pub cleanup_failures: Vec<String>,
}

impl SessionResult {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Completed | Outcome::UserStopped => 0,
            Outcome::TimedOut => 2,
            Outcome::CrashedWithDump | Outcome::CrashedNoDump => 3,
            Outcome::ProvisionFailed | Outcome::Failed => 4,
        }
    }
}

/// Signals racing to end the supervision loop.
#[derive(Debug)]
pub enum SessionSignal {
    /// Guest shut itself down.
    GuestOff,
    /// Hypervisor reports the guest crashed.
    GuestCrashed,
    /// Run timeout elapsed.
    Timeout,
    /// Panic signature observed on the console.
    Panic(String),
    /// Operator requested a stop.
    Interrupt,
    /// Hypervisor-side error while supervising.
    Failure(String),
}

/// Drives one session end to end.
pub struct SessionOrchestrator {
    hv: Arc<dyn Hypervisor>,
    spec: VmSpec,
    run_dir: PathBuf,
    poll_interval: Duration,
    kdump_poll: Duration,
}

impl SessionOrchestrator {
    pub fn new(hv: Arc<dyn Hypervisor>, spec: VmSpec) -> Self {
        Self {
            hv,
            spec,
            run_dir: std::env::temp_dir(),
            poll_interval: Duration::from_secs(1),
            kdump_poll: Duration::from_secs(1),
        }
    }

    /// Directory for the pool lock file and session scratch.
    pub fn with_run_dir(mut self, dir: &Path) -> Self {
        self.run_dir = dir.to_path_buf();
        self
    }

    /// Domain state poll granularity.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Crash-volume allocation poll granularity.
    pub fn with_kdump_poll(mut self, interval: Duration) -> Self {
        self.kdump_poll = interval;
        self
    }

    /// Run the session to completion.
    ///
    /// `Err` is only returned for failures before the pool lock is
    /// held (malformed spec, contention, unreachable endpoint); those
    /// leave no hypervisor-side state behind. Once the lock is held
    /// every path, including provisioning failures, produces a
    /// [`SessionResult`] after the cleanup phase has run.
    pub async fn run(self) -> Result<SessionResult, SessionError> {
        self.spec.validate().map_err(|e| match e {
            SpecError::InvalidSize(s) => SessionError::InvalidSize(s),
            other => SessionError::Provision(other.to_string()),
        })?;
        if let Some(output) = &self.spec.output_dir {
            std::fs::create_dir_all(output)
                .map_err(|e| SessionError::Provision(format!("cannot create output dir: {e}")))?;
        }

        // The interrupt listener lives for the whole run, not just the
        // supervision loop: a ctrl-C during provisioning or cleanup
        // must route through the same teardown path instead of killing
        // the process with the lock held.
        let (tx, mut rx) = mpsc::channel::<SessionSignal>(8);
        let interrupt = tokio::spawn({
            let tx = tx.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = tx.send(SessionSignal::Interrupt).await;
                }
            }
        });

        let domain_name = self.spec.domain_name();
        let mut session = HypervisorSession::new(Arc::clone(&self.hv), &self.spec.pool, &self.run_dir);
        if let Err(e) = session.lock(&domain_name, self.spec.force).await {
            interrupt.abort();
            return Err(e);
        }
        info!(domain = %domain_name, pool = %self.spec.pool, "Session locked");

        let resources = ResourcePool::new(Arc::clone(&self.hv), &self.spec.pool, &self.spec.owner);
        let controller = VmController::new(Arc::clone(&self.hv));

        let mut handle: Option<DomainHandle> = None;
        let (outcome, cause, kdump_image) = match tempfile::Builder::new()
            .prefix("ktest-session-")
            .tempdir_in(&self.run_dir)
        {
            Ok(work) => {
                self.boot_and_supervise(&controller, &resources, work.path(), &mut handle, tx, &mut rx)
                    .await
            }
            Err(e) => (
                Outcome::ProvisionFailed,
                Some(format!("cannot create session work dir: {e}")),
                None,
            ),
        };

        let cleanup_failures = self
            .cleanup(&controller, &mut session, &resources, handle.as_ref())
            .await;
        interrupt.abort();

        let console_log = self.transcript_path().filter(|p| p.exists());
        let result = SessionResult {
            outcome,
            cause,
            console_log,
            kdump_image,
            cleanup_failures,
        };
        info!(
            outcome = %result.outcome,
            cleanup_failures = result.cleanup_failures.len(),
            "Session finished"
        );
        Ok(result)
    }

    /// LOCKED → PROVISIONED → DEFINED → RUNNING → terminal signal.
    /// Never early-returns past a created resource: the caller always
    /// runs cleanup afterwards.
    async fn boot_and_supervise(
        &self,
        controller: &VmController,
        resources: &ResourcePool,
        work: &Path,
        handle_slot: &mut Option<DomainHandle>,
        tx: mpsc::Sender<SessionSignal>,
        rx: &mut mpsc::Receiver<SessionSignal>,
    ) -> (Outcome, Option<String>, Option<PathBuf>) {
        if interrupt_pending(rx) {
            return (Outcome::UserStopped, None, None);
        }
        let initramfs_path = work.join("initramfs.img");
        if let Err(e) = InitramfsBuilder::from_spec(&self.spec)
            .build(&initramfs_path)
            .await
        {
            return (Outcome::ProvisionFailed, Some(e.to_string()), None);
        }

        if interrupt_pending(rx) {
            return (Outcome::UserStopped, None, None);
        }
        let console_sock = work.join("console.sock");
        let artifacts = match resources
            .provision(&self.spec, &initramfs_path, Some(console_sock.clone()))
            .await
        {
            Ok(artifacts) => artifacts,
            Err(e) => return (Outcome::ProvisionFailed, Some(e.to_string()), None),
        };

        if interrupt_pending(rx) {
            return (Outcome::UserStopped, None, None);
        }
        let handle = match controller.define(&artifacts.domain).await {
            Ok(handle) => handle,
            Err(e) => return (Outcome::ProvisionFailed, Some(e.to_string()), None),
        };
        *handle_slot = Some(handle.clone());

        if let Err(e) = controller.start(&handle).await {
            error!(error = %e, "Domain failed to start");
            return (Outcome::Failed, Some(e.to_string()), None);
        }
        info!(domain = %handle.name, timeout_secs = self.spec.timeout_secs, "Guest running");

        let signal = self.supervise(controller, &handle, console_sock, tx, rx).await;
        debug!(signal = ?signal, "Supervision committed");

        match signal {
            SessionSignal::GuestOff => (Outcome::Completed, None, None),
            SessionSignal::Timeout => (Outcome::TimedOut, None, None),
            SessionSignal::Interrupt => (Outcome::UserStopped, None, None),
            SessionSignal::Failure(msg) => (Outcome::Failed, Some(msg), None),
            SessionSignal::Panic(_) | SessionSignal::GuestCrashed => {
                let cause = match &signal {
                    SessionSignal::Panic(line) => Some(line.clone()),
                    _ => Some("guest crashed".to_string()),
                };
                match &artifacts.crash_vol {
                    Some(vol) => match self.wait_for_dump(vol).await {
                        Some(path) => (Outcome::CrashedWithDump, cause, Some(path)),
                        None => (Outcome::CrashedNoDump, cause, None),
                    },
                    None => (Outcome::CrashedNoDump, cause, None),
                }
            }
        }
    }

    /// Block until the first terminal signal. Timer, console scanner
    /// and the run-wide interrupt listener race through one channel;
    /// the state poll runs inline. Whichever arrives first is
    /// committed and the losing tasks are cancelled (the console
    /// watcher is left to drain the transcript until EOF).
    async fn supervise(
        &self,
        controller: &VmController,
        handle: &DomainHandle,
        console_sock: PathBuf,
        tx: mpsc::Sender<SessionSignal>,
        rx: &mut mpsc::Receiver<SessionSignal>,
    ) -> SessionSignal {
        let timeout = Duration::from_secs(self.spec.timeout_secs);
        let timer = tokio::spawn({
            let tx = tx.clone();
            async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(SessionSignal::Timeout).await;
            }
        });

        let transcript = self.transcript_path();
        tokio::spawn(console::watch_console(console_sock, transcript, tx));

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let signal = loop {
            tokio::select! {
                Some(signal) = rx.recv() => break signal,
                _ = poll.tick() => {
                    match controller.status(handle).await {
                        Ok(state) if state.is_down() => break SessionSignal::GuestOff,
                        Ok(DomainState::Crashed) => break SessionSignal::GuestCrashed,
                        Ok(_) => {}
                        Err(e) => break SessionSignal::Failure(e.to_string()),
                    }
                }
            }
        };
        timer.abort();
        signal
    }

    /// Wait for the crash volume to grow and then hold a stable
    /// allocation, bounded by the kdump timeout, and download it.
    /// `None` means no usable dump within the window.
    async fn wait_for_dump(&self, crash_vol: &str) -> Option<PathBuf> {
        let Some(output) = &self.spec.output_dir else {
            warn!("Guest crashed but no output directory is configured; dump not collected");
            return None;
        };
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.spec.kdump_timeout_secs);

        let initial = match self.hv.vol_allocation(&self.spec.pool, crash_vol).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Cannot read crash volume allocation");
                return None;
            }
        };
        info!(
            volume = %crash_vol,
            timeout_secs = self.spec.kdump_timeout_secs,
            "Waiting for crash dump to stabilize"
        );

        let mut prev = initial;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.kdump_poll).await;
            let current = match self.hv.vol_allocation(&self.spec.pool, crash_vol).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Cannot read crash volume allocation");
                    return None;
                }
            };
            if current > initial && current == prev {
                let kernel = self
                    .spec
                    .kernel
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "kernel".to_string());
                let dest = output.join(format!("kdump-{}-{}.img", self.spec.owner, kernel));
                match self.hv.vol_download(&self.spec.pool, crash_vol, &dest).await {
                    Ok(()) => {
                        info!(dump = %dest.display(), bytes = current, "Crash dump collected");
                        return Some(dest);
                    }
                    Err(e) => {
                        warn!(error = %e, "Crash dump download failed");
                        return None;
                    }
                }
            }
            prev = current;
        }
        warn!("Crash dump did not stabilize within the kdump timeout");
        None
    }

    /// CLEANED: stop the domain, delete it when clean-on-exit is set,
    /// sweep session volumes, release the lock, close the connection.
    /// Unconditional and best-effort; failures are collected, never
    /// raised over the primary outcome.
    async fn cleanup(
        &self,
        controller: &VmController,
        session: &mut HypervisorSession,
        resources: &ResourcePool,
        handle: Option<&DomainHandle>,
    ) -> Vec<String> {
        let mut failures = Vec::new();

        if let Some(handle) = handle {
            if self.spec.keep {
                info!(domain = %handle.name, "Keeping domain as requested");
            } else {
                if let Err(e) = controller.stop(handle).await {
                    failures.push(format!("stop domain '{}': {e}", handle.name));
                }
                if self.spec.clean_on_exit {
                    if let Err(e) = controller.delete(handle).await {
                        failures.push(format!("delete domain '{}': {e}", handle.name));
                    }
                }
            }
        }

        if self.spec.keep {
            info!("Keeping session volumes as requested");
        } else {
            failures.extend(session.clean(resources).await);
        }

        session.unlock();
        session.finish().await;

        if !failures.is_empty() {
            warn!(count = failures.len(), "Cleanup finished with failures");
        }
        failures
    }

    fn transcript_path(&self) -> Option<PathBuf> {
        if self.spec.disable_console {
            return None;
        }
        self.spec
            .output_dir
            .as_ref()
            .map(|dir| dir.join("console.log"))
    }
}

/// Drain buffered signals, reporting whether an operator interrupt
/// arrived. Used between provisioning phases, where no other signal
/// source is running yet.
fn interrupt_pending(rx: &mut mpsc::Receiver<SessionSignal>) -> bool {
    while let Ok(signal) = rx.try_recv() {
        if matches!(signal, SessionSignal::Interrupt) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_interrupt_is_detected() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(SessionSignal::Interrupt).await.unwrap();
        assert!(interrupt_pending(&mut rx));
    }

    #[tokio::test]
    async fn other_signals_do_not_trip_the_interrupt_check() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(SessionSignal::GuestOff).await.unwrap();
        assert!(!interrupt_pending(&mut rx));
        assert!(!interrupt_pending(&mut rx));
    }
}
