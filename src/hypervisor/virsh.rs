//! Production hypervisor backend driving the `virsh` binary.
//!
//! Every operation is one `virsh --connect URI ...` invocation. The
//! connection probe at construction time is the only place
//! [`HvError::Unavailable`] originates; later failures surface as
//! operation errors with virsh's stderr attached.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use super::{DomainState, HvError, Hypervisor};
use async_trait::async_trait;

/// Hypervisor connection backed by the `virsh` CLI.
pub struct VirshHypervisor {
    uri: String,
}

impl VirshHypervisor {
    /// Open and probe a connection to `uri`.
    pub async fn connect(uri: &str) -> Result<Self, HvError> {
        let hv = Self {
            uri: uri.to_string(),
        };
        // `virsh version` forces a real connection to the endpoint.
        hv.run(&["version"])
            .await
            .map_err(|e| HvError::Unavailable(e.to_string()))?;
        debug!(uri = %uri, "Hypervisor connection established");
        Ok(hv)
    }

    async fn run(&self, args: &[&str]) -> Result<String, HvError> {
        let output = Command::new("virsh")
            .arg("--connect")
            .arg(&self.uri)
            .arg("--quiet")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(HvError::Operation(format!(
                "virsh {}: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )))
        }
    }

    fn is_missing(err: &HvError) -> bool {
        matches!(err, HvError::Operation(msg)
            if msg.contains("not found") || msg.contains("no domain") || msg.contains("no storage vol"))
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn domain_define(&self, xml: &str) -> Result<(), HvError> {
        let mut file = tempfile::Builder::new()
            .prefix("ktest-domain-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().into_owned();
        self.run(&["define", &path]).await?;
        Ok(())
    }

    async fn domain_start(&self, name: &str) -> Result<(), HvError> {
        self.run(&["start", name]).await?;
        Ok(())
    }

    async fn domain_destroy(&self, name: &str) -> Result<(), HvError> {
        match self.run(&["destroy", name]).await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_missing(&e) => Err(HvError::DomainNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn domain_undefine(&self, name: &str) -> Result<(), HvError> {
        match self.run(&["undefine", name]).await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_missing(&e) => Err(HvError::DomainNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState, HvError> {
        let out = match self.run(&["domstate", name]).await {
            Ok(out) => out,
            Err(e) if Self::is_missing(&e) => return Ok(DomainState::Absent),
            Err(e) => return Err(e),
        };
        Ok(parse_domstate(out.trim()))
    }

    async fn vol_create(&self, pool: &str, name: &str, capacity: u64) -> Result<(), HvError> {
        let capacity = capacity.to_string();
        self.run(&[
            "vol-create-as",
            pool,
            name,
            &capacity,
            "--format",
            "raw",
        ])
        .await?;
        Ok(())
    }

    async fn vol_upload(&self, pool: &str, name: &str, local: &Path) -> Result<(), HvError> {
        let local = local.to_string_lossy().into_owned();
        self.run(&["vol-upload", "--pool", pool, name, &local])
            .await?;
        Ok(())
    }

    async fn vol_delete(&self, pool: &str, name: &str) -> Result<(), HvError> {
        match self.run(&["vol-delete", "--pool", pool, name]).await {
            Ok(_) => Ok(()),
            Err(e) if Self::is_missing(&e) => Err(HvError::VolumeNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn vol_list(&self, pool: &str) -> Result<Vec<String>, HvError> {
        let out = self.run(&["vol-list", "--pool", pool, "--name"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn vol_allocation(&self, pool: &str, name: &str) -> Result<u64, HvError> {
        let out = self
            .run(&["vol-info", "--pool", pool, name, "--bytes"])
            .await?;
        parse_vol_allocation(&out)
            .ok_or_else(|| HvError::Operation(format!("unparseable vol-info for '{name}'")))
    }

    async fn vol_path(&self, pool: &str, name: &str) -> Result<PathBuf, HvError> {
        let out = self.run(&["vol-path", "--pool", pool, name]).await?;
        let path = out.trim();
        if path.is_empty() {
            return Err(HvError::VolumeNotFound(name.to_string()));
        }
        Ok(PathBuf::from(path))
    }

    async fn vol_download(&self, pool: &str, name: &str, dest: &Path) -> Result<(), HvError> {
        let dest = dest.to_string_lossy().into_owned();
        self.run(&["vol-download", "--pool", pool, name, &dest])
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), HvError> {
        // Subprocess-per-operation model: nothing stays open. Logged so
        // session traces still show the connection lifetime.
        debug!(uri = %self.uri, "Hypervisor connection closed");
        Ok(())
    }
}

fn parse_domstate(s: &str) -> DomainState {
    match s {
        "running" | "in shutdown" => DomainState::Running,
        "paused" | "pmsuspended" => DomainState::Paused,
        "shut off" => DomainState::Shutoff,
        "crashed" => DomainState::Crashed,
        other => {
            if !other.is_empty() {
                warn!(state = %other, "Unrecognized domain state, treating as absent");
            }
            DomainState::Absent
        }
    }
}

/// Pull the Allocation row out of `virsh vol-info --bytes` output.
fn parse_vol_allocation(out: &str) -> Option<u64> {
    for line in out.lines() {
        if let Some(rest) = line.trim().strip_prefix("Allocation:") {
            let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            return digits.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domstate_parsing() {
        assert_eq!(parse_domstate("running"), DomainState::Running);
        assert_eq!(parse_domstate("shut off"), DomainState::Shutoff);
        assert_eq!(parse_domstate("crashed"), DomainState::Crashed);
        assert_eq!(parse_domstate(""), DomainState::Absent);
    }

    #[test]
    fn vol_info_allocation_parsing() {
        let out = "Name:           ktest-crashdrive\nType:           file\nCapacity:       5368709120 bytes\nAllocation:     4096 bytes\n";
        assert_eq!(parse_vol_allocation(out), Some(4096));
        assert_eq!(parse_vol_allocation("garbage"), None);
    }
}
