//! Storage-pool provisioning.
//!
//! Translates the spec's disks and the built kernel/initramfs images
//! into pool volumes and a resolved [`DomainDef`], and remembers every
//! volume it created so `clean()` can release exactly those.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain_xml::{DiskDevice, DomainDef, ShareDevice};
use crate::hypervisor::{HvError, Hypervisor};
use crate::initramfs::share_tag;
use crate::spec::{DiskTransport, VmSpec};

/// Serial of the session-provisioned crash drive. Reserved; user disks
/// may not take it.
pub const CRASHDRIVE_SERIAL: &str = "crashdrive";

/// Deletion attempts per volume before recording a cleanup failure.
const DELETE_RETRIES: u32 = 3;

/// Errors from volume provisioning.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("hypervisor rejected volume operation: {0}")]
    Hv(#[from] HvError),

    #[error("cannot read {path}: {source}")]
    ReadArtifact {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Everything `define` needs, produced once per session.
#[derive(Debug)]
pub struct ProvisionedArtifacts {
    pub kernel_vol: String,
    pub initrd_vol: String,
    pub crash_vol: Option<String>,
    pub domain: DomainDef,
}

/// Session-scoped view of one storage pool.
pub struct ResourcePool {
    hv: Arc<dyn Hypervisor>,
    pool: String,
    owner: String,
    created: Mutex<Vec<String>>,
}

impl ResourcePool {
    pub fn new(hv: Arc<dyn Hypervisor>, pool: &str, owner: &str) -> Self {
        Self {
            hv,
            pool: pool.to_string(),
            owner: owner.to_string(),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool
    }

    /// Session-unique volume name for a given kind.
    pub fn volume_name(&self, kind: &str) -> String {
        format!("ktest-{}-{}", self.owner, kind)
    }

    /// Create volumes for the kernel, initramfs, scratch disks, and
    /// crash drive, and assemble the resolved domain definition.
    pub async fn provision(
        &self,
        spec: &VmSpec,
        initramfs: &Path,
        console_sock: Option<PathBuf>,
    ) -> Result<ProvisionedArtifacts, PoolError> {
        let kernel_vol = self.upload_image("kernel", &spec.kernel).await?;
        let initrd_vol = self.upload_image("initramfs", initramfs).await?;

        let mut disks = Vec::new();
        let mut scsi_index = 0usize;
        let mut blk_index = 0usize;
        for disk in &spec.disks {
            let vol = self.volume_name(&format!("disk-{}", disk.name));
            self.create_volume(&vol, disk.size).await?;
            let target = match disk.transport {
                DiskTransport::Scsi => {
                    scsi_index += 1;
                    format!("sd{}", dev_letter(scsi_index - 1))
                }
                DiskTransport::Blk => {
                    blk_index += 1;
                    format!("vd{}", dev_letter(blk_index - 1))
                }
            };
            disks.push(DiskDevice {
                path: self.hv.vol_path(&self.pool, &vol).await?,
                serial: disk.name.clone(),
                transport: disk.transport,
                target,
            });
        }

        let crash_vol = if spec.disable_kdump {
            None
        } else {
            let vol = self.volume_name(CRASHDRIVE_SERIAL);
            self.create_volume(&vol, spec.crashdrive_size).await?;
            blk_index += 1;
            disks.push(DiskDevice {
                path: self.hv.vol_path(&self.pool, &vol).await?,
                serial: CRASHDRIVE_SERIAL.to_string(),
                transport: DiskTransport::Blk,
                target: format!("vd{}", dev_letter(blk_index - 1)),
            });
            Some(vol)
        };

        let shares = spec
            .mounts
            .iter()
            .enumerate()
            .map(|(i, m)| ShareDevice {
                local: m.local.clone(),
                // Same tag the generated init script mounts.
                tag: share_tag(i),
                remote: m.remote.clone(),
            })
            .collect();

        let mut cmdline = vec!["console=ttyS0".to_string()];
        cmdline.extend(spec.kernel_opts.iter().cloned());

        let domain = DomainDef {
            name: spec.domain_name(),
            memory_mib: spec.memory_mib,
            vcpus: spec.vcpus,
            kernel_path: self.hv.vol_path(&self.pool, &kernel_vol).await?,
            initrd_path: self.hv.vol_path(&self.pool, &initrd_vol).await?,
            cmdline: cmdline.join(" "),
            disks,
            nets: spec.nets.clone(),
            shares,
            console_sock,
            gdb: spec.gdb.clone(),
        };

        info!(
            pool = %self.pool,
            kernel_vol = %kernel_vol,
            initrd_vol = %initrd_vol,
            disk_count = domain.disks.len(),
            "Pool provisioning complete"
        );

        Ok(ProvisionedArtifacts {
            kernel_vol,
            initrd_vol,
            crash_vol,
            domain,
        })
    }

    /// Create a volume sized to a local file and upload it.
    async fn upload_image(&self, kind: &str, local: &Path) -> Result<String, PoolError> {
        let size = std::fs::metadata(local)
            .map_err(|source| PoolError::ReadArtifact {
                path: local.to_path_buf(),
                source,
            })?
            .len();
        let name = self.volume_name(kind);
        self.create_volume(&name, size).await?;
        self.hv.vol_upload(&self.pool, &name, local).await?;
        debug!(volume = %name, bytes = size, "Uploaded image volume");
        Ok(name)
    }

    async fn create_volume(&self, name: &str, capacity: u64) -> Result<(), PoolError> {
        self.hv.vol_create(&self.pool, name, capacity).await?;
        self.created.lock().await.push(name.to_string());
        Ok(())
    }

    /// Volumes this session created so far.
    pub async fn created(&self) -> Vec<String> {
        self.created.lock().await.clone()
    }

    /// Delete every volume this session created. Already-deleted
    /// volumes are fine; each failing volume is retried a bounded
    /// number of times and then recorded, never aborting the sweep.
    pub async fn clean(&self) -> Vec<String> {
        let created: Vec<String> = std::mem::take(&mut *self.created.lock().await);
        let mut failures = Vec::new();
        for name in created {
            let mut last_err = None;
            for attempt in 1..=DELETE_RETRIES {
                match self.hv.vol_delete(&self.pool, &name).await {
                    Ok(()) => {
                        debug!(volume = %name, "Volume deleted");
                        last_err = None;
                        break;
                    }
                    Err(HvError::VolumeNotFound(_)) => {
                        // Already gone: the clean state we wanted.
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        warn!(volume = %name, attempt, error = %e, "Volume deletion failed");
                        last_err = Some(e);
                    }
                }
            }
            if let Some(e) = last_err {
                failures.push(format!("volume '{name}': {e}"));
            }
        }
        failures
    }
}

/// Device letter for index 0..25 (a..z). Sessions never get close to 26
/// disks on one bus.
fn dev_letter(index: usize) -> char {
    (b'a' + (index % 26) as u8) as char
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::FakeHypervisor;

    fn spec_with_disks(disks: &[&str]) -> VmSpec {
        VmSpec {
            kernel: PathBuf::from("/does/not/matter"),
            modules: vec![],
            programs: vec![],
            includes: vec![],
            mounts: vec![],
            disks: disks.iter().map(|d| d.parse().unwrap()).collect(),
            nets: vec![],
            memory_mib: 512,
            vcpus: 2,
            kernel_opts: vec!["loglevel=7".to_string()],
            entry_point: None,
            gdb: None,
            timeout_secs: 30,
            kdump_timeout_secs: 10,
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
            output_dir: None,
        }
    }

    async fn provisioned(
        hv: Arc<FakeHypervisor>,
        spec: &VmSpec,
    ) -> (ResourcePool, ProvisionedArtifacts) {
        let kernel = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(kernel.path(), b"kernel image").unwrap();
        let initramfs = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(initramfs.path(), b"initramfs").unwrap();

        let mut spec = spec.clone();
        spec.kernel = kernel.path().to_path_buf();
        let pool = ResourcePool::new(hv, &spec.pool, &spec.owner);
        let artifacts = pool
            .provision(&spec, initramfs.path(), None)
            .await
            .unwrap();
        (pool, artifacts)
    }

    #[tokio::test]
    async fn provision_creates_and_tracks_volumes() {
        let hv = Arc::new(FakeHypervisor::new());
        let spec = spec_with_disks(&["scratch:blk:1G", "logs:scsi:512M"]);
        let (pool, artifacts) = provisioned(Arc::clone(&hv), &spec).await;

        let vols = hv.volume_names("default");
        assert!(vols.contains(&"ktest-tester-kernel".to_string()));
        assert!(vols.contains(&"ktest-tester-initramfs".to_string()));
        assert!(vols.contains(&"ktest-tester-disk-scratch".to_string()));
        assert!(vols.contains(&"ktest-tester-disk-logs".to_string()));
        assert!(vols.contains(&"ktest-tester-crashdrive".to_string()));
        assert_eq!(pool.created().await.len(), 5);
        assert_eq!(artifacts.crash_vol.as_deref(), Some("ktest-tester-crashdrive"));
        assert!(artifacts.domain.cmdline.contains("console=ttyS0"));
        assert!(artifacts.domain.cmdline.contains("loglevel=7"));
    }

    #[tokio::test]
    async fn disk_targets_count_per_bus() {
        let hv = Arc::new(FakeHypervisor::new());
        let spec = spec_with_disks(&["a:scsi:1G", "b:blk:1G", "c:scsi:1G"]);
        let (_pool, artifacts) = provisioned(Arc::clone(&hv), &spec).await;

        let targets: Vec<_> = artifacts
            .domain
            .disks
            .iter()
            .map(|d| (d.serial.as_str(), d.target.as_str()))
            .collect();
        assert!(targets.contains(&("a", "sda")));
        assert!(targets.contains(&("c", "sdb")));
        assert!(targets.contains(&("b", "vda")));
        // Crash drive lands after the user's virtio disks.
        assert!(targets.contains(&(CRASHDRIVE_SERIAL, "vdb")));
    }

    #[tokio::test]
    async fn share_tags_agree_with_the_init_script() {
        let hv = Arc::new(FakeHypervisor::new());
        let mut spec = spec_with_disks(&[]);
        spec.mounts = vec![
            "/src:/mnt/src".parse().unwrap(),
            "/data:/mnt/data".parse().unwrap(),
        ];
        let (_pool, artifacts) = provisioned(Arc::clone(&hv), &spec).await;

        let tags: Vec<String> = artifacts
            .domain
            .shares
            .iter()
            .map(|s| s.tag.clone())
            .collect();
        assert_eq!(tags, vec![share_tag(0), share_tag(1)]);
        assert_eq!(artifacts.domain.shares[1].remote, "/mnt/data");
    }

    #[tokio::test]
    async fn disable_kdump_skips_crash_drive() {
        let hv = Arc::new(FakeHypervisor::new());
        let mut spec = spec_with_disks(&[]);
        spec.disable_kdump = true;
        let (_pool, artifacts) = provisioned(Arc::clone(&hv), &spec).await;
        assert!(artifacts.crash_vol.is_none());
        assert!(!hv
            .volume_names("default")
            .contains(&"ktest-tester-crashdrive".to_string()));
    }

    #[tokio::test]
    async fn clean_removes_everything_and_tolerates_missing() {
        let hv = Arc::new(FakeHypervisor::new());
        let spec = spec_with_disks(&["scratch:blk:1G"]);
        let (pool, _artifacts) = provisioned(Arc::clone(&hv), &spec).await;

        // One volume already deleted out from under us.
        hv.vol_delete("default", "ktest-tester-disk-scratch")
            .await
            .unwrap();

        let failures = pool.clean().await;
        assert!(failures.is_empty());
        assert!(hv.volume_names("default").is_empty());
        assert!(pool.created().await.is_empty());
    }

    #[tokio::test]
    async fn clean_reports_stuck_volume_without_aborting() {
        let hv = Arc::new(FakeHypervisor::new().failing_vol_delete("ktest-tester-kernel"));
        let spec = spec_with_disks(&[]);
        let (pool, _artifacts) = provisioned(Arc::clone(&hv), &spec).await;

        let failures = pool.clean().await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("ktest-tester-kernel"));
        // The rest of the sweep still ran.
        assert_eq!(hv.volume_names("default"), vec!["ktest-tester-kernel"]);
    }
}
