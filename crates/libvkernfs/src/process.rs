//! Process service: a thin view over `/proc/<pid>` for a single pid.
//!
//! Construction never fails; every operation re-reads the kernel state and
//! returns `NotFound` once the process is gone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::Pid;

use crate::error::VkernError;
use crate::sysio::FsIo;
use crate::Result;

/// One line of `/proc/<pid>/uid_map` / `gid_map`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdMapEntry {
    pub inside: u32,
    pub outside: u32,
    pub count: u32,
}

#[derive(Clone)]
pub struct ProcessHandle {
    pid: Pid,
    io: Arc<dyn FsIo>,
}

impl ProcessHandle {
    pub fn new(pid: Pid, io: Arc<dyn FsIo>) -> Self {
        Self { pid, io }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn proc_path(&self, tail: &str) -> PathBuf {
        PathBuf::from(format!("/proc/{}/{}", self.pid.as_raw(), tail))
    }

    /// Root directory of the process, i.e. where `/proc/<pid>/root` points.
    /// `/` unless the process is chrooted.
    pub fn root(&self) -> Result<PathBuf> {
        self.io.read_link(&self.proc_path("root"))
    }

    pub fn user_ns_inode(&self) -> Result<u64> {
        self.ns_inode("user")
    }

    pub fn net_ns_inode(&self) -> Result<u64> {
        self.ns_inode("net")
    }

    pub fn pid_ns_inode(&self) -> Result<u64> {
        self.ns_inode("pid")
    }

    pub fn ns_inode(&self, ns: &str) -> Result<u64> {
        self.io.ns_inode(&self.proc_path(&format!("ns/{ns}")))
    }

    pub fn is_alive(&self) -> bool {
        match procfs::process::Process::new(self.pid.as_raw()) {
            Ok(proc) => proc.is_alive(),
            Err(_) => self.io.stat(&self.proc_path("status")).is_ok(),
        }
    }

    pub fn uid(&self) -> Result<u32> {
        let proc = procfs::process::Process::new(self.pid.as_raw())
            .map_err(|_| VkernError::NotFound(format!("process {}", self.pid)))?;
        let status = proc
            .status()
            .map_err(|_| VkernError::NotFound(format!("process {}", self.pid)))?;
        Ok(status.ruid)
    }

    pub fn gid(&self) -> Result<u32> {
        let proc = procfs::process::Process::new(self.pid.as_raw())
            .map_err(|_| VkernError::NotFound(format!("process {}", self.pid)))?;
        let status = proc
            .status()
            .map_err(|_| VkernError::NotFound(format!("process {}", self.pid)))?;
        Ok(status.rgid)
    }

    pub fn uid_map(&self) -> Result<Vec<IdMapEntry>> {
        self.id_map("uid_map")
    }

    pub fn gid_map(&self) -> Result<Vec<IdMapEntry>> {
        self.id_map("gid_map")
    }

    fn id_map(&self, file: &str) -> Result<Vec<IdMapEntry>> {
        let data = self.io.read_to_vec(&self.proc_path(file))?;
        parse_id_map(&data)
    }

    /// Parent pid from `/proc/<pid>/status`, used by the FUSE layer to walk
    /// up when a request pid is not directly known to the store.
    pub fn parent_pid(&self) -> Result<Pid> {
        let data = self.io.read_to_vec(&self.proc_path("status"))?;
        let text = String::from_utf8_lossy(&data);
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("PPid:") {
                let ppid: i32 = rest
                    .trim()
                    .parse()
                    .map_err(|_| VkernError::Invalid(format!("bad PPid line: {line}")))?;
                return Ok(Pid::from_raw(ppid));
            }
        }
        Err(VkernError::NotFound(format!(
            "PPid of process {}",
            self.pid
        )))
    }
}

fn parse_id_map(data: &[u8]) -> Result<Vec<IdMapEntry>> {
    let text = String::from_utf8_lossy(data);
    let mut entries = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() != 3 {
            return Err(VkernError::Invalid(format!("bad id map line: {line}")));
        }
        let parse = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| VkernError::Invalid(format!("bad id map line: {line}")))
        };
        entries.push(IdMapEntry {
            inside: parse(fields[0])?,
            outside: parse(fields[1])?,
            count: parse(fields[2])?,
        });
    }
    Ok(entries)
}

/// Maps a host uid into the range described by `map`, if covered.
pub fn map_host_id(map: &[IdMapEntry], host_id: u32) -> Option<u32> {
    for entry in map {
        if host_id >= entry.outside && host_id < entry.outside.saturating_add(entry.count) {
            return Some(entry.inside + (host_id - entry.outside));
        }
    }
    None
}

pub fn ns_path(pid: Pid, ns: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{}/ns/{}", pid.as_raw(), ns))
}

/// Deterministic namespace inode for tests: stable per (pid, ns) so seeded
/// `MemIo` trees and assertions agree without coordination.
pub fn synth_ns_inode(pid: i32, ns: &str) -> u64 {
    let ns_tag = ns.bytes().fold(0u64, |acc, b| acc * 31 + u64::from(b)) % 1000;
    4_026_000_000 + ns_tag * 1_000_000 + pid as u64
}
