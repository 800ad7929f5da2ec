//! Command line surface.
//!
//! Flags mirror the session defaults file field for field; a flag
//! given on the command line overrides the file value, and repeated
//! flags replace (not extend) the file's list. The merged result is a
//! [`VmSpec`] plus the hypervisor URI.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use crate::config::FileConfig;
use crate::spec::{
    parse_size, DiskSpec, IncludeEntry, MountEntry, NetSpec, SpecError, VmSpec,
    DEFAULT_CRASHDRIVE_SIZE, DEFAULT_KDUMP_TIMEOUT_SECS, DEFAULT_MEMORY_MIB, DEFAULT_TIMEOUT_SECS,
    DEFAULT_VCPUS,
};

/// Default hypervisor endpoint.
pub const DEFAULT_URI: &str = "qemu:///system";
/// Default storage pool.
pub const DEFAULT_POOL: &str = "default";

/// Boot a kernel build in a short-lived libvirt VM.
#[derive(Debug, Parser)]
#[command(name = "ktest", version, about)]
pub struct Cli {
    /// Kernel image to boot.
    #[arg(value_name = "KERNEL")]
    pub kernel: PathBuf,

    /// Attach a scratch disk, NAME:<scsi|blk>:SIZE. Repeatable.
    #[arg(short = 'D', long = "disk", value_name = "SPEC")]
    pub disks: Vec<String>,

    /// Attach a NIC, <bridge=NAME|network=NAME|ovs=NAME|user>[:mac=ADDR][:dhcp]. Repeatable.
    #[arg(short = 'n', long = "net", value_name = "SPEC")]
    pub nets: Vec<String>,

    /// Share a host directory into the guest, LOCAL:REMOTE. Repeatable.
    #[arg(short = 'd', long = "dir", value_name = "LOCAL:REMOTE")]
    pub mounts: Vec<String>,

    /// Install a kernel module into the initramfs. Repeatable.
    #[arg(short = 'm', long = "module", value_name = "NAME")]
    pub modules: Vec<String>,

    /// Install a program and its libraries into the initramfs. Repeatable.
    #[arg(short = 'i', long = "install", value_name = "PATH")]
    pub programs: Vec<PathBuf>,

    /// Copy an extra file or directory into the initramfs, SRC[:DST]. Repeatable.
    #[arg(short = 'I', long = "include", value_name = "SRC[:DST]")]
    pub includes: Vec<String>,

    /// Directory for the console transcript and crash dumps.
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Program run by init after setup; interactive shell if omitted.
    #[arg(short = 'e', long = "entry-point", value_name = "PATH")]
    pub entry_point: Option<String>,

    /// Append a kernel command-line option. Repeatable, order preserved.
    #[arg(short = 'k', long = "kopt", value_name = "OPT")]
    pub kernel_opts: Vec<String>,

    /// Guest memory in MiB.
    #[arg(long = "memory", value_name = "MIB")]
    pub memory_mib: Option<u64>,

    /// vCPU count.
    #[arg(long = "vcpus", value_name = "N")]
    pub vcpus: Option<u32>,

    /// Run timeout in seconds.
    #[arg(short = 't', long = "timeout", value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    /// Crash-dump stabilization window in seconds.
    #[arg(long = "kdump-timeout", value_name = "SECS")]
    pub kdump_timeout_secs: Option<u64>,

    /// Crash drive capacity, e.g. 5G.
    #[arg(long = "crashdrive-size", value_name = "SIZE")]
    pub crashdrive_size: Option<String>,

    /// Skip crash-drive provisioning and guest kdump setup.
    #[arg(long = "disable-kdump")]
    pub disable_kdump: bool,

    /// Do not write a console transcript.
    #[arg(long = "disable-console")]
    pub disable_console: bool,

    /// Hypervisor connection URI.
    #[arg(long = "uri", value_name = "URI", env = "KTEST_URI")]
    pub uri: Option<String>,

    /// Storage pool for session volumes.
    #[arg(long = "pool", value_name = "NAME")]
    pub pool: Option<String>,

    /// Session owner; part of every domain and volume name.
    #[arg(long = "owner", value_name = "NAME")]
    pub owner: Option<String>,

    /// Preempt a conflicting session instead of failing.
    #[arg(short = 'f', long = "force")]
    pub force: bool,

    /// Remove the domain definition after the run.
    #[arg(short = 'c', long = "clean")]
    pub clean: bool,

    /// Leave the domain and volumes in place after the run.
    #[arg(short = 'K', long = "keep", conflicts_with = "clean")]
    pub keep: bool,

    /// Expose a QEMU gdb stub, HOST:PORT.
    #[arg(short = 'G', long = "gdb", value_name = "HOST:PORT")]
    pub gdb: Option<String>,

    /// Module search root containing modules.dep.
    #[arg(long = "kmoddir", value_name = "DIR")]
    pub kmoddir: Option<PathBuf>,

    /// Firmware search root.
    #[arg(long = "fwdir", value_name = "DIR")]
    pub fwdir: Option<PathBuf>,
}

impl Cli {
    /// Merge with file defaults into the final spec and URI.
    pub fn into_spec(self, defaults: FileConfig) -> Result<(VmSpec, String), SpecError> {
        let uri = self
            .uri
            .or(defaults.uri)
            .unwrap_or_else(|| DEFAULT_URI.to_string());
        let owner = self
            .owner
            .or(defaults.owner)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "ktest".to_string());
        let crashdrive_size = self
            .crashdrive_size
            .or(defaults.crashdrive_size)
            .unwrap_or_else(|| DEFAULT_CRASHDRIVE_SIZE.to_string());

        let spec = VmSpec {
            kernel: self.kernel,
            modules: pick(self.modules, defaults.modules),
            programs: pick(self.programs, defaults.programs),
            includes: parse_list(pick(self.includes, defaults.includes))?,
            mounts: parse_list(pick(self.mounts, defaults.mounts))?,
            disks: parse_list(pick(self.disks, defaults.disks))?,
            nets: parse_list(pick(self.nets, defaults.nets))?,
            memory_mib: self
                .memory_mib
                .or(defaults.memory_mib)
                .unwrap_or(DEFAULT_MEMORY_MIB),
            vcpus: self.vcpus.or(defaults.vcpus).unwrap_or(DEFAULT_VCPUS),
            kernel_opts: pick(self.kernel_opts, defaults.kernel_opts),
            entry_point: self.entry_point.or(defaults.entry_point),
            gdb: self.gdb.or(defaults.gdb),
            timeout_secs: self
                .timeout_secs
                .or(defaults.timeout_secs)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            kdump_timeout_secs: self
                .kdump_timeout_secs
                .or(defaults.kdump_timeout_secs)
                .unwrap_or(DEFAULT_KDUMP_TIMEOUT_SECS),
            disable_kdump: self.disable_kdump || defaults.disable_kdump.unwrap_or(false),
            crashdrive_size: parse_size(&crashdrive_size)?,
            owner,
            pool: self
                .pool
                .or(defaults.pool)
                .unwrap_or_else(|| DEFAULT_POOL.to_string()),
            clean_on_exit: self.clean || defaults.clean.unwrap_or(false),
            keep: self.keep,
            force: self.force,
            disable_console: self.disable_console || defaults.disable_console.unwrap_or(false),
            kmoddir: self.kmoddir.or(defaults.kmoddir),
            fwdir: self.fwdir.or(defaults.fwdir),
            output_dir: self.output_dir.or(defaults.output_dir),
        };
        Ok((spec, uri))
    }
}

/// Flag values replace file values; an unset flag falls back to the file.
fn pick<T>(cli: Vec<T>, file: Option<Vec<T>>) -> Vec<T> {
    if cli.is_empty() {
        file.unwrap_or_default()
    } else {
        cli
    }
}

fn parse_list<T: FromStr<Err = SpecError>>(items: Vec<String>) -> Result<Vec<T>, SpecError> {
    items.iter().map(|s| s.parse()).collect()
}
