//! Operating-system capabilities the coordinator depends on
//!
//! Everything that touches mounts, block devices, or other processes goes through
//! [`OsOps`], so the coordinator logic can run against a fake in tests.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Signal sent to matching external processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Terminate,
    Kill,
}

impl ProcessSignal {
    fn pkill_flag(&self) -> &'static str {
        match self {
            ProcessSignal::Terminate => "-TERM",
            ProcessSignal::Kill => "-KILL",
        }
    }
}

/// A block device or partition as reported by `lsblk`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Kernel name, e.g. `sdb1`
    pub name: String,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    /// Transport of the owning disk, e.g. `usb`
    pub transport: Option<String>,
    /// Kernel name of the top-level disk; equals `name` for a whole disk
    pub disk: String,
}

impl BlockDevice {
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.name)
    }

    pub fn is_mounted(&self) -> bool {
        self.mountpoint.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// Closed set of OS capabilities used by the coordinator
pub trait OsOps {
    /// Whether `target` is currently a mount point
    fn is_mounted(&self, target: &Path) -> Result<bool>;

    /// Mount `device` on `target`
    fn mount(&self, device: &Path, target: &Path) -> Result<()>;

    /// Mount a removable device through the user-space mount helper
    fn mount_removable(&self, device: &Path) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Enumerate block devices and partitions
    fn block_devices(&self) -> Result<Vec<BlockDevice>>;

    /// Signal every process whose command line matches `pattern`
    ///
    /// Returns whether any process matched.
    fn signal_processes(&self, pattern: &str, signal: ProcessSignal) -> Result<bool>;

    /// Flush filesystem buffers
    fn sync_filesystems(&self) -> Result<()>;
}

/// Captured result of an external command
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` and wait at most `timeout` for it
///
/// A command still running at the deadline is killed and reported as an error.
/// Both pipes are drained on reader threads while waiting.
pub fn run_command(cmd: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to run {cmd}"))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match child
        .wait_timeout(timeout)
        .with_context(|| format!("Failed to wait for {cmd}"))?
    {
        Some(status) => status,
        None => {
            child.kill().ok();
            child.wait().ok();
            // readers finish on their own once every writer has closed the pipe
            bail!("{} timed out after {}s", cmd, timeout.as_secs());
        }
    };

    Ok(CommandOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut bytes).ok();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

/// Run `cmd`, treating a non-zero exit as an error carrying its stderr
fn run_checked(cmd: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let output = run_command(cmd, args, timeout)?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(anyhow::anyhow!("{} failed: {}", cmd, output.stderr.trim()))
    }
}

/// [`OsOps`] backed by the standard Linux utilities
#[derive(Debug, Clone)]
pub struct SystemOps {
    timeout: Duration,
}

impl SystemOps {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl OsOps for SystemOps {
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let target = path_arg(target)?;
        let output = run_command("mountpoint", &["-q", target], self.timeout)?;
        Ok(output.status.success())
    }

    fn mount(&self, device: &Path, target: &Path) -> Result<()> {
        run_checked("mount", &[path_arg(device)?, path_arg(target)?], self.timeout)?;
        Ok(())
    }

    fn mount_removable(&self, device: &Path) -> Result<()> {
        run_checked("udisksctl", &["mount", "-b", path_arg(device)?], self.timeout)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        run_checked("umount", &[path_arg(target)?], self.timeout)?;
        Ok(())
    }

    fn block_devices(&self) -> Result<Vec<BlockDevice>> {
        let output = run_checked(
            "lsblk",
            &["-J", "-o", "NAME,FSTYPE,MOUNTPOINT,TRAN"],
            self.timeout,
        )?;
        parse_lsblk_json(&output.stdout)
    }

    fn signal_processes(&self, pattern: &str, signal: ProcessSignal) -> Result<bool> {
        let output = run_command("pkill", &[signal.pkill_flag(), "-f", pattern], self.timeout)?;
        // pkill exits 1 when nothing matched
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow::anyhow!("pkill failed: {}", output.stderr.trim())),
        }
    }

    fn sync_filesystems(&self) -> Result<()> {
        nix::unistd::sync();
        Ok(())
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("Path contains invalid UTF-8: {}", path.display()))
}

#[derive(Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkEntry>,
}

#[derive(Deserialize)]
struct LsblkEntry {
    name: String,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    tran: Option<String>,
    #[serde(default)]
    children: Vec<LsblkEntry>,
}

/// Flatten `lsblk -J` output; partitions inherit their disk's transport
pub fn parse_lsblk_json(json: &str) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput =
        serde_json::from_str(json).context("Failed to parse lsblk JSON output")?;

    fn flatten(
        entry: LsblkEntry,
        disk: Option<&str>,
        inherited: Option<&str>,
        out: &mut Vec<BlockDevice>,
    ) {
        let transport = entry.tran.or_else(|| inherited.map(str::to_string));
        let disk = disk.unwrap_or(&entry.name).to_string();
        for child in entry.children {
            flatten(child, Some(&disk), transport.as_deref(), out);
        }
        out.push(BlockDevice {
            name: entry.name,
            fstype: entry.fstype,
            mountpoint: entry.mountpoint,
            transport,
            disk,
        });
    }

    let mut devices = Vec::new();
    for entry in parsed.blockdevices {
        flatten(entry, None, None, &mut devices);
    }
    Ok(devices)
}
