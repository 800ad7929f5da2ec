//! End-to-end session scenarios against the in-memory hypervisor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ktest::hypervisor::FakeHypervisor;
use ktest::session::{Outcome, SessionOrchestrator, SessionResult};
use ktest::spec::VmSpec;
use ktest::{Hypervisor, SessionError};

fn base_spec(kernel: PathBuf, output_dir: Option<PathBuf>) -> VmSpec {
    VmSpec {
        kernel,
        modules: vec![],
        programs: vec![],
        includes: vec![],
        mounts: vec![],
        disks: vec![],
        nets: vec![],
        memory_mib: 512,
        vcpus: 2,
        kernel_opts: vec![],
        entry_point: Some("/bin/runtest".to_string()),
        gdb: None,
        timeout_secs: 30,
        kdump_timeout_secs: 1,
        disable_kdump: false,
        crashdrive_size: 1 << 30,
        owner: "tester".to_string(),
        pool: "default".to_string(),
        clean_on_exit: true,
        keep: false,
        force: false,
        disable_console: false,
        kmoddir: None,
        fwdir: None,
        output_dir,
    }
}

struct Harness {
    hv: Arc<FakeHypervisor>,
    dir: tempfile::TempDir,
    spec: VmSpec,
}

impl Harness {
    fn new(hv: FakeHypervisor) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("bzImage");
        std::fs::write(&kernel, b"not a real kernel").unwrap();
        let output = dir.path().join("out");
        let spec = base_spec(kernel, Some(output));
        Self {
            hv: Arc::new(hv),
            dir,
            spec,
        }
    }

    async fn run(self) -> (Arc<FakeHypervisor>, tempfile::TempDir, SessionResult) {
        let result = self.orchestrator().run().await.unwrap();
        (self.hv, self.dir, result)
    }

    fn orchestrator(&self) -> SessionOrchestrator {
        SessionOrchestrator::new(Arc::clone(&self.hv) as Arc<dyn Hypervisor>, self.spec.clone())
            .with_run_dir(self.dir.path())
            .with_poll_interval(Duration::from_millis(25))
            .with_kdump_poll(Duration::from_millis(25))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.path().join("ktest-default.lock")
    }
}

#[tokio::test]
async fn completed_guest_leaves_nothing_behind() {
    let harness = Harness::new(FakeHypervisor::new().shutoff_after(2));
    let lock = harness.lock_path();
    let (hv, _dir, result) = harness.run().await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.exit_code(), 0);
    assert!(result.cleanup_failures.is_empty());
    assert!(hv.domain_names().is_empty());
    assert!(hv.volume_names("default").is_empty());
    assert!(hv.is_closed());
    assert!(!lock.exists());
}

#[tokio::test]
async fn hung_guest_times_out_near_the_deadline() {
    let mut harness = Harness::new(FakeHypervisor::new());
    harness.spec.timeout_secs = 1;

    let started = std::time::Instant::now();
    let (hv, _dir, result) = harness.run().await;
    let elapsed = started.elapsed();

    assert_eq!(result.outcome, Outcome::TimedOut);
    assert_eq!(result.exit_code(), 2);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    // The hung domain was still torn down.
    assert!(hv.domain_names().is_empty());
    assert!(hv.volume_names("default").is_empty());
}

#[tokio::test]
async fn crash_with_stabilized_dump_is_collected() {
    let harness = Harness::new(
        FakeHypervisor::new()
            .crash_after(2)
            .crash_allocations(vec![0, 4096, 65536, 65536]),
    );
    let (hv, _dir, result) = harness.run().await;

    assert_eq!(result.outcome, Outcome::CrashedWithDump);
    assert_eq!(result.exit_code(), 3);
    let dump = result.kdump_image.expect("dump path");
    assert!(dump.exists());
    assert_eq!(
        dump.file_name().unwrap().to_str().unwrap(),
        "kdump-tester-bzImage.img"
    );
    assert!(hv.volume_names("default").is_empty());
}

#[tokio::test]
async fn crash_without_growth_is_no_dump() {
    let harness = Harness::new(
        FakeHypervisor::new()
            .crash_after(1)
            .crash_allocations(vec![0]),
    );
    let (_hv, _dir, result) = harness.run().await;

    assert_eq!(result.outcome, Outcome::CrashedNoDump);
    assert_eq!(result.exit_code(), 3);
    assert!(result.kdump_image.is_none());
}

#[tokio::test]
async fn disable_kdump_crash_skips_the_dump_wait() {
    let mut harness = Harness::new(FakeHypervisor::new().crash_after(1));
    harness.spec.disable_kdump = true;

    let (hv, _dir, result) = harness.run().await;
    assert_eq!(result.outcome, Outcome::CrashedNoDump);
    assert!(!hv
        .volume_names("default")
        .iter()
        .any(|v| v.contains("crashdrive")));
}

#[tokio::test]
async fn duplicate_disks_fail_before_any_resource_exists() {
    let mut harness = Harness::new(FakeHypervisor::new());
    harness.spec.disks = vec![
        "scratch:blk:1G".parse().unwrap(),
        "scratch:scsi:1G".parse().unwrap(),
    ];
    let lock = harness.lock_path();

    let err = harness.orchestrator().run().await.unwrap_err();
    assert!(matches!(err, SessionError::Provision(_)));
    assert!(harness.hv.domain_names().is_empty());
    assert!(harness.hv.volume_names("default").is_empty());
    assert!(!lock.exists());
}

#[tokio::test]
async fn missing_kernel_is_provision_failure_after_lock() {
    let mut harness = Harness::new(FakeHypervisor::new());
    harness.spec.kernel = harness.dir.path().join("no-such-kernel");
    let lock = harness.lock_path();

    let (hv, _dir, result) = harness.run().await;
    assert_eq!(result.outcome, Outcome::ProvisionFailed);
    assert_eq!(result.exit_code(), 4);
    assert!(result.cause.is_some());
    assert!(hv.domain_names().is_empty());
    assert!(hv.volume_names("default").is_empty());
    assert!(!lock.exists());
}

#[tokio::test]
async fn rejected_start_is_failed_and_cleaned() {
    let harness = Harness::new(FakeHypervisor::new().failing_start());
    let (hv, _dir, result) = harness.run().await;

    assert_eq!(result.outcome, Outcome::Failed);
    assert_eq!(result.exit_code(), 4);
    assert!(result.cause.is_some());
    assert!(hv.domain_names().is_empty());
    assert!(hv.volume_names("default").is_empty());
}

#[tokio::test]
async fn held_lock_without_force_is_contention() {
    let harness = Harness::new(FakeHypervisor::new().shutoff_after(1));
    // The holder must be a live process or the lock counts as stale;
    // this test's own pid serves.
    let holder_pid = std::process::id();
    std::fs::write(
        harness.lock_path(),
        format!("{holder_pid} ktest-other\n"),
    )
    .unwrap();

    let err = harness.orchestrator().run().await.unwrap_err();
    match err {
        SessionError::LockContention { pool, holder } => {
            assert_eq!(pool, "default");
            assert_eq!(holder, holder_pid);
        }
        other => panic!("expected lock contention, got {other}"),
    }
    assert!(harness.hv.volume_names("default").is_empty());
}

#[tokio::test]
async fn stale_lock_from_dead_holder_does_not_block_the_session() {
    let harness = Harness::new(FakeHypervisor::new().shutoff_after(1));
    std::fs::write(harness.lock_path(), "999999999 ktest-other\n").unwrap();
    let lock = harness.lock_path();

    let (_hv, _dir, result) = harness.run().await;
    assert_eq!(result.outcome, Outcome::Completed);
    assert!(!lock.exists());
}

#[tokio::test]
async fn force_preempts_the_holding_session() {
    let harness = Harness::new(
        FakeHypervisor::new()
            .shutoff_after(1)
            .with_running_domain("ktest-other"),
    );
    std::fs::write(harness.lock_path(), "4242 ktest-other\n").unwrap();
    let mut harness = harness;
    harness.spec.force = true;

    let (hv, _dir, result) = harness.run().await;
    assert_eq!(result.outcome, Outcome::Completed);
    // The preempted session's domain was stopped, but only its runtime.
    assert_eq!(hv.domain_names(), vec!["ktest-other"]);
}

#[tokio::test]
async fn keep_leaves_domain_and_volumes_but_unlocks() {
    let mut harness = Harness::new(FakeHypervisor::new().shutoff_after(1));
    harness.spec.keep = true;
    harness.spec.clean_on_exit = false;
    let lock = harness.lock_path();

    let (hv, _dir, result) = harness.run().await;
    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(hv.domain_names(), vec!["ktest-tester"]);
    assert!(!hv.volume_names("default").is_empty());
    assert!(!lock.exists());
    assert!(hv.is_closed());
}

#[tokio::test]
async fn stuck_volume_is_reported_without_masking_the_outcome() {
    let harness = Harness::new(
        FakeHypervisor::new()
            .shutoff_after(1)
            .failing_vol_delete("ktest-tester-kernel"),
    );
    let (hv, _dir, result) = harness.run().await;

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.cleanup_failures.len(), 1);
    assert!(result.cleanup_failures[0].contains("ktest-tester-kernel"));
    assert_eq!(hv.volume_names("default"), vec!["ktest-tester-kernel"]);
}

#[tokio::test]
async fn scratch_disks_are_provisioned_and_swept() {
    let mut harness = Harness::new(FakeHypervisor::new().shutoff_after(2));
    harness.spec.disks = vec!["scratch:blk:1G".parse().unwrap()];
    harness.spec.timeout_secs = 30;

    let (hv, _dir, result) = harness.run().await;
    assert_eq!(result.outcome, Outcome::Completed);
    assert!(hv.volume_names("default").is_empty());
}
