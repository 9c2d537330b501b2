//! Mount table snapshots with the three lookup indices.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::mount::entry::MountEntry;
use crate::nsenter::NsExec;
use crate::process::ProcessHandle;
use crate::sysio::FsIo;
use crate::Result;

/// Read-only snapshot of a process's mount table. Multiple snapshots for the
/// same container may coexist; each is immutable once built.
#[derive(Debug, Default)]
pub struct MountSnapshot {
    entries: Vec<MountEntry>,
    by_mountpoint: HashMap<PathBuf, usize>,
    by_id: HashMap<u32, usize>,
    by_dev: HashMap<String, Vec<usize>>,
}

impl MountSnapshot {
    /// Parses a full mountinfo byte blob. A single malformed line aborts the
    /// parse; no partial snapshot escapes.
    pub fn parse(bytes: &[u8]) -> Result<MountSnapshot> {
        let text = String::from_utf8_lossy(bytes);
        let mut snapshot = MountSnapshot::default();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = MountEntry::parse_line(line)?;
            snapshot.push(entry);
        }
        Ok(snapshot)
    }

    /// Captures the mount table of `process`. When its root is `/` the file
    /// is read directly; otherwise the namespace executor provides the
    /// snapshot from an unchrooted vantage point, since a chrooted process
    /// cannot see its full mount tree through its own `/proc` path.
    pub fn for_process(
        process: &ProcessHandle,
        io: &dyn FsIo,
        nsexec: &dyn NsExec,
    ) -> Result<MountSnapshot> {
        let bytes = if process.root()? == Path::new("/") {
            io.read_to_vec(&mountinfo_path(process.pid()))?
        } else {
            nsexec.mountinfo(process.pid())?
        };
        MountSnapshot::parse(&bytes)
    }

    /// Resolves mountpoint inodes in bulk through the executor, skipping the
    /// daemon-managed paths in `skip` (their inodes belong to the emulation
    /// layer, not the kernel mount).
    pub fn resolve_inodes(
        &mut self,
        pid: Pid,
        nsexec: &dyn NsExec,
        skip: &HashSet<PathBuf>,
    ) -> Result<()> {
        let wanted: Vec<usize> = (0..self.entries.len())
            .filter(|&i| !skip.contains(&self.entries[i].mountpoint))
            .collect();
        let paths: Vec<PathBuf> = wanted
            .iter()
            .map(|&i| self.entries[i].mountpoint.clone())
            .collect();
        let inodes = nsexec.mount_inodes(pid, &paths)?;
        for (slot, ino) in wanted.into_iter().zip(inodes) {
            self.entries[slot].mountpoint_ino = ino;
        }
        Ok(())
    }

    fn push(&mut self, entry: MountEntry) {
        let idx = self.entries.len();
        self.by_mountpoint.insert(entry.mountpoint.clone(), idx);
        self.by_id.insert(entry.mount_id, idx);
        self.by_dev.entry(entry.dev.clone()).or_default().push(idx);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn lookup_by_mountpoint(&self, path: &Path) -> Option<&MountEntry> {
        self.by_mountpoint.get(path).map(|&i| &self.entries[i])
    }

    pub fn lookup_by_id(&self, id: u32) -> Option<&MountEntry> {
        self.by_id.get(&id).map(|&i| &self.entries[i])
    }

    pub fn entries_by_dev(&self, dev: &str) -> Vec<&MountEntry> {
        self.by_dev
            .get(dev)
            .map(|ids| ids.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    pub(crate) fn set_mountpoint_ino(&mut self, idx: usize, ino: u64) {
        if let Some(entry) = self.entries.get_mut(idx) {
            entry.mountpoint_ino = Some(ino);
        }
    }

    pub fn parent_of(&self, entry: &MountEntry) -> Option<&MountEntry> {
        // The root mount of a namespace is its own parent's child in a table
        // we cannot see; guard against self-cycles.
        let parent = self.lookup_by_id(entry.parent_id)?;
        if parent.mount_id == entry.mount_id {
            return None;
        }
        Some(parent)
    }
}

pub fn mountinfo_path(pid: Pid) -> PathBuf {
    PathBuf::from(format!("/proc/{}/mountinfo", pid.as_raw()))
}
