//! Request and response records exchanged with the nsenter helper.

use core::fmt;
use std::path::PathBuf;

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// Namespace kinds the helper can attach to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NsKind {
    User,
    Pid,
    Uts,
    Ipc,
    Net,
    Cgroup,
    Mnt,
}

impl NsKind {
    pub fn clone_flag(&self) -> CloneFlags {
        match self {
            NsKind::User => CloneFlags::CLONE_NEWUSER,
            NsKind::Pid => CloneFlags::CLONE_NEWPID,
            NsKind::Uts => CloneFlags::CLONE_NEWUTS,
            NsKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NsKind::Net => CloneFlags::CLONE_NEWNET,
            NsKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
            NsKind::Mnt => CloneFlags::CLONE_NEWNS,
        }
    }

    /// Name under `/proc/<pid>/ns/`.
    pub fn proc_name(&self) -> &'static str {
        match self {
            NsKind::User => "user",
            NsKind::Pid => "pid",
            NsKind::Uts => "uts",
            NsKind::Ipc => "ipc",
            NsKind::Net => "net",
            NsKind::Cgroup => "cgroup",
            NsKind::Mnt => "mnt",
        }
    }
}

// User first, mount last: entering the user namespace first gains the
// capabilities needed for the rest, and the mount namespace switch changes
// path resolution for everything after it.
const ORDERED_KINDS: &[NsKind] = &[
    NsKind::User,
    NsKind::Pid,
    NsKind::Uts,
    NsKind::Ipc,
    NsKind::Net,
    NsKind::Cgroup,
    NsKind::Mnt,
];

/// Set of namespaces an event enters, iterated in canonical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSet {
    user: bool,
    pid: bool,
    uts: bool,
    ipc: bool,
    net: bool,
    cgroup: bool,
    mnt: bool,
}

impl NamespaceSet {
    pub fn empty() -> Self {
        NamespaceSet {
            user: false,
            pid: false,
            uts: false,
            ipc: false,
            net: false,
            cgroup: false,
            mnt: false,
        }
    }

    pub fn all() -> Self {
        NamespaceSet {
            user: true,
            pid: true,
            uts: true,
            ipc: true,
            net: true,
            cgroup: true,
            mnt: true,
        }
    }

    pub fn all_but_user() -> Self {
        let mut set = Self::all();
        set.user = false;
        set
    }

    pub fn net_only() -> Self {
        Self::empty().with(NsKind::Net)
    }

    pub fn mnt_only() -> Self {
        Self::empty().with(NsKind::Mnt)
    }

    pub fn with(mut self, kind: NsKind) -> Self {
        match kind {
            NsKind::User => self.user = true,
            NsKind::Pid => self.pid = true,
            NsKind::Uts => self.uts = true,
            NsKind::Ipc => self.ipc = true,
            NsKind::Net => self.net = true,
            NsKind::Cgroup => self.cgroup = true,
            NsKind::Mnt => self.mnt = true,
        }
        self
    }

    pub fn contains(&self, kind: NsKind) -> bool {
        match kind {
            NsKind::User => self.user,
            NsKind::Pid => self.pid,
            NsKind::Uts => self.uts,
            NsKind::Ipc => self.ipc,
            NsKind::Net => self.net,
            NsKind::Cgroup => self.cgroup,
            NsKind::Mnt => self.mnt,
        }
    }

    /// Members in the order they must be entered.
    pub fn ordered(&self) -> Vec<NsKind> {
        ORDERED_KINDS
            .iter()
            .copied()
            .filter(|k| self.contains(*k))
            .collect()
    }
}

/// Operation the helper performs inside the target namespaces.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NsRequest {
    /// Snapshot `/proc/self/mountinfo` from inside the mount namespace.
    MountInfo,
    /// Stat the given paths and return one inode per path.
    MountInodes { paths: Vec<PathBuf> },
    ReadFile { path: PathBuf },
    WriteFile { path: PathBuf, data: Vec<u8> },
    /// Hold the helper alive; the response is sent before sleeping so the
    /// caller can retrieve the helper pid and target it with further events.
    Sleep { seconds: u64 },
}

impl fmt::Display for NsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NsRequest::MountInfo => write!(f, "MountInfo"),
            NsRequest::MountInodes { paths } => write!(f, "MountInodes({})", paths.len()),
            NsRequest::ReadFile { path } => write!(f, "ReadFile({})", path.display()),
            NsRequest::WriteFile { path, data } => {
                write!(f, "WriteFile({}, {} bytes)", path.display(), data.len())
            }
            NsRequest::Sleep { seconds } => write!(f, "Sleep({seconds}s)"),
        }
    }
}

/// Error kinds the helper can report back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RemoteError {
    TargetGone(i32),
    Permission(i32),
    BadRequest(String),
    Io(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum NsResponse {
    Ack,
    FileData(Vec<u8>),
    Inodes(Vec<Option<u64>>),
    Error(RemoteError),
}

/// Envelope written to the helper right after launch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelperRequest {
    pub target_pid: i32,
    pub namespaces: NamespaceSet,
    pub request: NsRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_enters_user_first_mount_last() {
        let set = NamespaceSet::all();
        let order = set.ordered();
        assert_eq!(order.first(), Some(&NsKind::User));
        assert_eq!(order.last(), Some(&NsKind::Mnt));
    }

    #[test]
    fn test_all_but_user() {
        let set = NamespaceSet::all_but_user();
        assert!(!set.contains(NsKind::User));
        assert!(set.contains(NsKind::Net));
        assert_eq!(set.ordered().len(), 6);
    }

    #[test]
    fn test_request_roundtrip_through_json() -> anyhow::Result<()> {
        let req = HelperRequest {
            target_pid: 1234,
            namespaces: NamespaceSet::net_only(),
            request: NsRequest::WriteFile {
                path: PathBuf::from("/proc/sys/net/netfilter/nf_conntrack_max"),
                data: b"65535".to_vec(),
            },
        };
        let bytes = serde_json::to_vec(&req)?;
        let back: HelperRequest = serde_json::from_slice(&bytes)?;
        assert_eq!(back.target_pid, 1234);
        assert!(matches!(back.request, NsRequest::WriteFile { .. }));
        Ok(())
    }
}
