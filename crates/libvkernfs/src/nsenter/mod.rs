//! Namespace-enter executor.
//!
//! The daemon is a single host process, but several emulated resources only
//! have meaningful values inside a container's namespaces. For those, the
//! daemon re-executes itself (`vkernfsd nsenter`) with one end of a
//! socketpair on fd 3; the helper attaches to the requested namespaces of
//! the target pid, performs the operation described by the request record
//! and writes back a response record.
//!
//! The helper never chroots. A mountinfo snapshot taken from it is therefore
//! complete even when the original target process is chrooted. Long-running
//! `Sleep` events are still supported for callers that need a stable
//! in-namespace vantage process to point further events at.

pub mod channel;
pub mod event;
pub mod helper;
pub mod message;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::unistd::Pid;

use crate::error::VkernError;
use crate::Result;

pub use channel::EventChannel;
pub use event::{Executor, NsenterEvent};
pub use message::{NamespaceSet, NsKind, NsRequest, NsResponse};

#[derive(Debug, thiserror::Error)]
pub enum NsenterError {
    #[error("failed to launch helper: {0}")]
    Launch(String),
    #[error("target process {0} is gone")]
    TargetGone(i32),
    #[error("permission denied entering namespaces of {0}")]
    Permission(i32),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("helper io failed: {0}")]
    Io(String),
    #[error("helper response timed out")]
    Timeout,
}

impl From<NsenterError> for VkernError {
    fn from(err: NsenterError) -> Self {
        match err {
            NsenterError::Timeout => VkernError::Timeout,
            NsenterError::TargetGone(pid) => VkernError::NotFound(format!("process {pid}")),
            NsenterError::Permission(pid) => {
                VkernError::PermissionDenied(format!("namespaces of {pid}"))
            }
            other => VkernError::NamespaceEnter(other.to_string()),
        }
    }
}

/// Namespaced filesystem operations as a capability, so handlers and the
/// mountinfo parser can run against a test double.
pub trait NsExec: Send + Sync {
    fn read_file(&self, pid: Pid, ns: NamespaceSet, path: &Path) -> Result<Vec<u8>>;
    fn write_file(&self, pid: Pid, ns: NamespaceSet, path: &Path, data: &[u8]) -> Result<()>;
    /// Bytes of `/proc/self/mountinfo` as observed from inside the mount
    /// namespace of `pid`, captured without a chroot.
    fn mountinfo(&self, pid: Pid) -> Result<Vec<u8>>;
    /// Inode per path, resolved inside the mount namespace of `pid`. `None`
    /// marks a path that could not be stat'ed.
    fn mount_inodes(&self, pid: Pid, paths: &[PathBuf]) -> Result<Vec<Option<u64>>>;
}

impl NsExec for Executor {
    fn read_file(&self, pid: Pid, ns: NamespaceSet, path: &Path) -> Result<Vec<u8>> {
        let event = NsenterEvent::new(
            pid,
            ns,
            NsRequest::ReadFile {
                path: path.to_path_buf(),
            },
            false,
        );
        self.send_request(&event)?;
        match self.receive_response(&event)? {
            NsResponse::FileData(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    fn write_file(&self, pid: Pid, ns: NamespaceSet, path: &Path, data: &[u8]) -> Result<()> {
        let event = NsenterEvent::new(
            pid,
            ns,
            NsRequest::WriteFile {
                path: path.to_path_buf(),
                data: data.to_vec(),
            },
            false,
        );
        self.send_request(&event)?;
        match self.receive_response(&event)? {
            NsResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn mountinfo(&self, pid: Pid) -> Result<Vec<u8>> {
        let event = NsenterEvent::new(pid, NamespaceSet::mnt_only(), NsRequest::MountInfo, false);
        self.send_request(&event)?;
        match self.receive_response(&event)? {
            NsResponse::FileData(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    fn mount_inodes(&self, pid: Pid, paths: &[PathBuf]) -> Result<Vec<Option<u64>>> {
        let event = NsenterEvent::new(
            pid,
            NamespaceSet::mnt_only(),
            NsRequest::MountInodes {
                paths: paths.to_vec(),
            },
            false,
        );
        self.send_request(&event)?;
        match self.receive_response(&event)? {
            NsResponse::Inodes(inodes) => Ok(inodes),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(resp: NsResponse) -> VkernError {
    match resp {
        NsResponse::Error(err) => VkernError::from(map_remote_error(err)),
        other => VkernError::Internal(format!("unexpected helper response: {other:?}")),
    }
}

fn map_remote_error(err: message::RemoteError) -> NsenterError {
    match err {
        message::RemoteError::TargetGone(pid) => NsenterError::TargetGone(pid),
        message::RemoteError::Permission(pid) => NsenterError::Permission(pid),
        message::RemoteError::BadRequest(msg) => NsenterError::BadRequest(msg),
        message::RemoteError::Io(msg) => NsenterError::Io(msg),
    }
}

/// Test double: an in-memory "namespaced" filesystem keyed by net-ns inode,
/// with per-pid mountinfo fixtures. Pids sharing a net-ns inode observe the
/// same files, which is exactly the pod-sharing semantics the handlers rely
/// on.
#[derive(Default)]
pub struct MemNsExec {
    inner: Mutex<MemNsState>,
}

#[derive(Default)]
struct MemNsState {
    netns_of_pid: std::collections::HashMap<i32, u64>,
    files: std::collections::HashMap<(u64, PathBuf), Vec<u8>>,
    mountinfo: std::collections::HashMap<i32, Vec<u8>>,
    inodes: std::collections::HashMap<PathBuf, u64>,
}

impl MemNsExec {
    pub fn set_netns(&self, pid: i32, inode: u64) {
        self.inner.lock().unwrap().netns_of_pid.insert(pid, inode);
    }

    pub fn seed_file(&self, netns: u64, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert((netns, path.into()), data.into());
    }

    pub fn seed_mountinfo(&self, pid: i32, data: impl Into<Vec<u8>>) {
        self.inner.lock().unwrap().mountinfo.insert(pid, data.into());
    }

    pub fn seed_inode(&self, path: impl Into<PathBuf>, ino: u64) {
        self.inner.lock().unwrap().inodes.insert(path.into(), ino);
    }

    fn netns(&self, pid: Pid) -> Result<u64> {
        self.inner
            .lock()
            .unwrap()
            .netns_of_pid
            .get(&pid.as_raw())
            .copied()
            .ok_or_else(|| VkernError::NotFound(format!("process {pid}")))
    }
}

impl NsExec for MemNsExec {
    fn read_file(&self, pid: Pid, _ns: NamespaceSet, path: &Path) -> Result<Vec<u8>> {
        let netns = self.netns(pid)?;
        self.inner
            .lock()
            .unwrap()
            .files
            .get(&(netns, path.to_path_buf()))
            .cloned()
            .ok_or_else(|| VkernError::not_found_path(path))
    }

    fn write_file(&self, pid: Pid, _ns: NamespaceSet, path: &Path, data: &[u8]) -> Result<()> {
        let netns = self.netns(pid)?;
        self.inner
            .lock()
            .unwrap()
            .files
            .insert((netns, path.to_path_buf()), data.to_vec());
        Ok(())
    }

    fn mountinfo(&self, pid: Pid) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .mountinfo
            .get(&pid.as_raw())
            .cloned()
            .ok_or_else(|| VkernError::NotFound(format!("mountinfo of {pid}")))
    }

    fn mount_inodes(&self, _pid: Pid, paths: &[PathBuf]) -> Result<Vec<Option<u64>>> {
        let inner = self.inner.lock().unwrap();
        Ok(paths.iter().map(|p| inner.inodes.get(p).copied()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_nsexec_shares_by_netns() -> anyhow::Result<()> {
        let ns = MemNsExec::default();
        ns.set_netns(100, 7001);
        ns.set_netns(200, 7001);
        ns.set_netns(300, 7002);

        let path = Path::new("/proc/sys/net/ipv6/conf/all/disable_ipv6");
        ns.write_file(Pid::from_raw(100), NamespaceSet::net_only(), path, b"1")?;
        assert_eq!(
            ns.read_file(Pid::from_raw(200), NamespaceSet::net_only(), path)?,
            b"1"
        );
        assert!(ns
            .read_file(Pid::from_raw(300), NamespaceSet::net_only(), path)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_mem_nsexec_unknown_pid() {
        let ns = MemNsExec::default();
        let err = ns
            .read_file(Pid::from_raw(9), NamespaceSet::net_only(), Path::new("/x"))
            .err()
            .unwrap();
        assert!(matches!(err, VkernError::NotFound(_)));
    }
}
