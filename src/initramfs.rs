//! Ephemeral boot payload composition.
//!
//! Builds the per-session initramfs: requested programs with their
//! resolved shared libraries, kernel modules in modules.dep dependency
//! order, firmware, include entries, and a generated init script, all
//! packed as a gzip-compressed newc cpio archive.
//!
//! Given the same inputs the archive's logical contents are identical
//! across builds: entries are walked in sorted order and all archive
//! metadata (uid, gid, mtime) is pinned to zero.

use std::collections::HashSet;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::spec::VmSpec;

/// Errors from initramfs composition.
#[derive(Debug, Error)]
pub enum InitramfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("program '{0}' not found")]
    ProgramNotFound(PathBuf),

    #[error("library '{library}' required by '{program}' not found")]
    MissingLibrary { library: String, program: String },

    #[error("ldd failed for '{program}': {reason}")]
    LddFailed { program: String, reason: String },

    #[error("kernel module '{0}' not found in the module directory")]
    ModuleNotFound(String),

    #[error("module directory has no modules.dep: {0}")]
    NoModulesDep(PathBuf),

    #[error("include source '{0}' does not exist")]
    IncludeMissing(PathBuf),
}

/// Mount tag for the i-th shared directory; the domain XML and the
/// guest init script must agree on these.
pub fn share_tag(index: usize) -> String {
    format!("ktestfs{index}")
}

/// Composes the initramfs for one session.
pub struct InitramfsBuilder {
    programs: Vec<PathBuf>,
    modules: Vec<String>,
    includes: Vec<(PathBuf, Option<String>)>,
    mounts: Vec<(String, String)>,
    entry_point: Option<String>,
    disable_kdump: bool,
    kmoddir: Option<PathBuf>,
    fwdir: Option<PathBuf>,
}

impl InitramfsBuilder {
    pub fn from_spec(spec: &VmSpec) -> Self {
        Self {
            programs: spec.programs.clone(),
            modules: spec.modules.clone(),
            includes: spec
                .includes
                .iter()
                .map(|i| (i.source.clone(), i.dest.clone()))
                .collect(),
            mounts: spec
                .mounts
                .iter()
                .enumerate()
                .map(|(i, m)| (share_tag(i), m.remote.clone()))
                .collect(),
            entry_point: spec.entry_point.clone(),
            disable_kdump: spec.disable_kdump,
            kmoddir: spec.kmoddir.clone(),
            fwdir: spec.fwdir.clone(),
        }
    }

    /// Build the initramfs image at `dest`.
    pub async fn build(&self, dest: &Path) -> Result<(), InitramfsError> {
        let staging = tempfile::Builder::new().prefix("ktest-initramfs-").tempdir()?;
        let root = staging.path();

        for dir in [
            "bin", "sbin", "dev", "proc", "sys", "run", "tmp", "etc", "mnt", "lib",
            "lib/modules", "lib/firmware",
        ] {
            std::fs::create_dir_all(root.join(dir))?;
        }

        for program in &self.programs {
            self.install_program(root, program).await?;
        }

        let module_files = self.install_modules(root)?;

        if let Some(fwdir) = &self.fwdir {
            copy_tree(fwdir, &root.join("lib/firmware"))?;
        }

        for (source, dest_rel) in &self.includes {
            self.install_include(root, source, dest_rel.as_deref())?;
        }

        let script = init_script(
            &module_files,
            &self.mounts,
            self.entry_point.as_deref(),
            self.disable_kdump,
        );
        let init_path = root.join("init");
        std::fs::write(&init_path, script)?;
        std::fs::set_permissions(&init_path, std::fs::Permissions::from_mode(0o755))?;

        let entries = collect_entries(root)?;
        let archive = write_cpio(&entries);

        let file = std::fs::File::create(dest)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&archive)?;
        encoder.finish()?;

        info!(
            dest = %dest.display(),
            entries = entries.len(),
            modules = module_files.len(),
            programs = self.programs.len(),
            "Initramfs built"
        );
        Ok(())
    }

    /// Copy a program into /bin and every shared library it needs to
    /// its host path inside the staging tree.
    async fn install_program(&self, root: &Path, program: &Path) -> Result<(), InitramfsError> {
        if !program.exists() {
            return Err(InitramfsError::ProgramNotFound(program.to_path_buf()));
        }
        let name = program
            .file_name()
            .ok_or_else(|| InitramfsError::ProgramNotFound(program.to_path_buf()))?;
        let target = root.join("bin").join(name);
        std::fs::copy(program, &target)?;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))?;

        for lib in resolve_libraries(program).await? {
            let rel = lib.strip_prefix("/").unwrap_or(&lib);
            let lib_target = root.join(rel);
            if let Some(parent) = lib_target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !lib_target.exists() {
                // fs::copy follows symlinks, so chains like
                // libc.so.6 -> libc-2.xx.so flatten into one file.
                std::fs::copy(&lib, &lib_target)?;
            }
        }
        debug!(program = %program.display(), "Installed program");
        Ok(())
    }

    /// Copy requested modules plus their dependency closure into
    /// /lib/modules, returning base names in insmod load order.
    fn install_modules(&self, root: &Path) -> Result<Vec<String>, InitramfsError> {
        if self.modules.is_empty() {
            return Ok(Vec::new());
        }
        // Validation guarantees kmoddir is set when modules are requested.
        let kmoddir = self
            .kmoddir
            .as_ref()
            .ok_or_else(|| InitramfsError::NoModulesDep(PathBuf::from("<unset>")))?;
        let deps_path = kmoddir.join("modules.dep");
        let deps_text = std::fs::read_to_string(&deps_path)
            .map_err(|_| InitramfsError::NoModulesDep(deps_path.clone()))?;

        let ordered = resolve_modules(&deps_text, &self.modules)?;
        let mut basenames = Vec::new();
        for rel in &ordered {
            let source = kmoddir.join(rel);
            if !source.exists() {
                return Err(InitramfsError::ModuleNotFound(rel.clone()));
            }
            let base = Path::new(rel)
                .file_name()
                .ok_or_else(|| InitramfsError::ModuleNotFound(rel.clone()))?
                .to_string_lossy()
                .into_owned();
            std::fs::copy(&source, root.join("lib/modules").join(&base))?;
            basenames.push(base);
        }
        Ok(basenames)
    }

    fn install_include(
        &self,
        root: &Path,
        source: &Path,
        dest_rel: Option<&str>,
    ) -> Result<(), InitramfsError> {
        if !source.exists() {
            return Err(InitramfsError::IncludeMissing(source.to_path_buf()));
        }
        let rel = match dest_rel {
            Some(d) => d.trim_start_matches('/').to_string(),
            None => source
                .file_name()
                .ok_or_else(|| InitramfsError::IncludeMissing(source.to_path_buf()))?
                .to_string_lossy()
                .into_owned(),
        };
        let target = root.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if source.is_dir() {
            copy_tree(source, &target)?;
        } else {
            std::fs::copy(source, &target)?;
        }
        Ok(())
    }
}

/// Resolve a program's shared library dependencies via ldd.
async fn resolve_libraries(program: &Path) -> Result<Vec<PathBuf>, InitramfsError> {
    let name = program.to_string_lossy().into_owned();
    let output = Command::new("ldd")
        .arg(program)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| InitramfsError::LddFailed {
            program: name.clone(),
            reason: e.to_string(),
        })?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        // Statically linked programs have no dependencies to resolve.
        if stdout.contains("not a dynamic executable")
            || String::from_utf8_lossy(&output.stderr).contains("not a dynamic executable")
        {
            return Ok(Vec::new());
        }
        return Err(InitramfsError::LddFailed {
            program: name,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    parse_ldd_output(&stdout, &name)
}

/// Parse ldd output into library paths. A `not found` entry is an
/// error, not a silently thinner initramfs.
fn parse_ldd_output(out: &str, program: &str) -> Result<Vec<PathBuf>, InitramfsError> {
    let mut libs = Vec::new();
    for line in out.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((lhs, rhs)) = line.split_once("=>") {
            let rhs = rhs.trim();
            if rhs.starts_with("not found") {
                return Err(InitramfsError::MissingLibrary {
                    library: lhs.trim().to_string(),
                    program: program.to_string(),
                });
            }
            if let Some(path) = rhs.split_whitespace().next() {
                if path.starts_with('/') {
                    libs.push(PathBuf::from(path));
                }
            }
        } else if line.starts_with('/') {
            // The dynamic loader line: /lib64/ld-linux-x86-64.so.2 (0x...)
            if let Some(path) = line.split_whitespace().next() {
                libs.push(PathBuf::from(path));
            }
        }
        // Anything else (linux-vdso) has no file to copy.
    }
    Ok(libs)
}

/// Resolve requested module names against modules.dep, returning
/// relative module paths with dependencies ordered before dependents.
pub fn resolve_modules(
    deps_text: &str,
    requested: &[String],
) -> Result<Vec<String>, InitramfsError> {
    use std::collections::HashMap;

    let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut by_name: HashMap<String, &str> = HashMap::new();
    for line in deps_text.lines() {
        let Some((path, rest)) = line.split_once(':') else {
            continue;
        };
        let path = path.trim();
        deps.insert(path, rest.split_whitespace().collect());
        if let Some(name) = module_name(path) {
            by_name.insert(name, path);
        }
    }

    let mut ordered = Vec::new();
    let mut seen = HashSet::new();
    for name in requested {
        let key = normalize_module_name(name);
        let path = by_name
            .get(&key)
            .ok_or_else(|| InitramfsError::ModuleNotFound(name.clone()))?;
        push_with_deps(path, &deps, &mut seen, &mut ordered);
    }
    Ok(ordered)
}

fn push_with_deps(
    path: &str,
    deps: &std::collections::HashMap<&str, Vec<&str>>,
    seen: &mut HashSet<String>,
    ordered: &mut Vec<String>,
) {
    if seen.contains(path) {
        return;
    }
    seen.insert(path.to_string());
    if let Some(children) = deps.get(path) {
        for child in children {
            push_with_deps(child, deps, seen, ordered);
        }
    }
    ordered.push(path.to_string());
}

/// Module name from a modules.dep path: base name up to the first dot,
/// dashes normalized to underscores the way modprobe does.
fn module_name(path: &str) -> Option<String> {
    let base = Path::new(path).file_name()?.to_string_lossy().into_owned();
    let name = base.split('.').next()?.to_string();
    Some(normalize_module_name(&name))
}

fn normalize_module_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Generate the init script run as PID 1 in the guest.
///
/// Mounts virtual filesystems, loads modules in dependency order,
/// mounts shared directories, wires kdump capture, then either runs
/// the entry point (powering off when it exits) or drops to a shell.
pub fn init_script(
    modules: &[String],
    mounts: &[(String, String)],
    entry_point: Option<&str>,
    disable_kdump: bool,
) -> String {
    let mut s = String::from(
        "#!/bin/sh\n\
         # Generated by ktest. Runs as PID 1 in the test guest.\n\
         export PATH=/bin:/sbin\n\
         \n\
         mount -t proc proc /proc\n\
         mount -t sysfs sysfs /sys\n\
         mount -t devtmpfs devtmpfs /dev\n",
    );

    if !modules.is_empty() {
        s.push('\n');
        for module in modules {
            s.push_str(&format!("insmod /lib/modules/{module}\n"));
        }
    }

    for (tag, remote) in mounts {
        s.push_str(&format!(
            "\nmkdir -p {remote}\n\
             mount -t 9p -o trans=virtio,version=9p2000.L {tag} {remote}\n"
        ));
    }

    if !disable_kdump {
        s.push_str(
            "\n# Crash capture: locate the crash drive by serial. When this\n\
             # boot is the capture kernel, /proc/vmcore exists; stream it to\n\
             # the drive so the host sees the volume grow and stabilize.\n\
             crashdev=\n\
             for dev in /sys/block/*; do\n\
             \t[ -f \"$dev/serial\" ] || continue\n\
             \tif [ \"$(cat \"$dev/serial\")\" = \"crashdrive\" ]; then\n\
             \t\tcrashdev=/dev/$(basename \"$dev\")\n\
             \tfi\n\
             done\n\
             if [ -e /proc/vmcore ] && [ -n \"$crashdev\" ]; then\n\
             \tdd if=/proc/vmcore of=\"$crashdev\" bs=1M\n\
             \tsync\n\
             \tpoweroff -f\n\
             fi\n",
        );
    }

    s.push_str("\necho 'ktest: init complete'\n");
    match entry_point {
        Some(entry) => {
            s.push_str(&format!(
                "{entry}\n\
                 echo \"ktest: entry point exited with $?\"\n\
                 poweroff -f\n"
            ));
        }
        None => {
            s.push_str("exec sh\n");
        }
    }
    s
}

/// One archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpioEntry {
    /// Relative path inside the image.
    pub name: String,
    /// Full mode including the file type bits.
    pub mode: u32,
    pub data: Vec<u8>,
}

/// Walk a staging tree into archive entries, sorted for determinism.
/// Regular file modes are normalized to 755/644 by the executable bit.
fn collect_entries(root: &Path) -> Result<Vec<CpioEntry>, InitramfsError> {
    fn walk(root: &Path, rel: &Path, out: &mut Vec<CpioEntry>) -> std::io::Result<()> {
        let dir = root.join(rel);
        let mut children: Vec<_> = std::fs::read_dir(&dir)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| e.file_name())
            .collect();
        children.sort();
        for child in children {
            let child_rel = rel.join(&child);
            let path = root.join(&child_rel);
            let meta = std::fs::metadata(&path)?;
            let name = child_rel.to_string_lossy().into_owned();
            if meta.is_dir() {
                out.push(CpioEntry {
                    name,
                    mode: 0o040755,
                    data: Vec::new(),
                });
                walk(root, &child_rel, out)?;
            } else {
                let exec = meta.permissions().mode() & 0o111 != 0;
                out.push(CpioEntry {
                    name,
                    mode: if exec { 0o100755 } else { 0o100644 },
                    data: std::fs::read(&path)?,
                });
            }
        }
        Ok(())
    }

    let mut entries = Vec::new();
    walk(root, Path::new(""), &mut entries)?;
    Ok(entries)
}

/// Serialize entries as a newc cpio archive with pinned metadata
/// (ino sequential, uid/gid/mtime zero).
pub fn write_cpio(entries: &[CpioEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        cpio_member(
            &mut out,
            (i + 1) as u32,
            entry.mode,
            &entry.name,
            &entry.data,
        );
    }
    cpio_member(&mut out, 0, 0, "TRAILER!!!", &[]);
    out
}

fn cpio_member(out: &mut Vec<u8>, ino: u32, mode: u32, name: &str, data: &[u8]) {
    let name_bytes = name.as_bytes();
    out.extend_from_slice(b"070701");
    for field in [
        ino,
        mode,
        0, // uid
        0, // gid
        1, // nlink
        0, // mtime
        data.len() as u32,
        0, // devmajor
        0, // devminor
        0, // rdevmajor
        0, // rdevminor
        (name_bytes.len() + 1) as u32,
        0, // check
    ] {
        out.extend_from_slice(format!("{field:08x}").as_bytes());
    }
    out.extend_from_slice(name_bytes);
    out.push(0);
    pad4(out);
    out.extend_from_slice(data);
    pad4(out);
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
