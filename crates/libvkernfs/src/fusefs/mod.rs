//! Per-container FUSE serving surface.
//!
//! One server per container, mounted under the daemon's mountpoint root and
//! bind-mounted into the container by the runtime. The server resolves the
//! requesting pid to a container, the path to a handler, and forwards the
//! operation; domain errors come back as POSIX errnos.

pub mod pool;
pub mod server;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::handlers::ResourceAttr;
use crate::sysio::FileKind;

pub use pool::{ensure_fuse_support, FusePool};
pub use server::VkernFs;

pub const ROOT_INO: u64 = 1;

/// Bidirectional inode <-> path table. The emulated tree is small and
/// long-lived, so entries are never evicted; `forget` is a no-op.
#[derive(Debug)]
pub(crate) struct InodeTable {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        let mut table = InodeTable {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.by_ino.insert(ROOT_INO, PathBuf::from("/"));
        table.by_path.insert(PathBuf::from("/"), ROOT_INO);
        table
    }
}

impl InodeTable {
    pub(crate) fn ino_for(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_path_buf());
        self.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    pub(crate) fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.by_ino.get(&ino).cloned()
    }
}

/// Builds the kernel-facing attributes for an emulated resource. The files
/// appear owned by the container's root user so in-container tooling sees
/// the ownership it expects.
pub(crate) fn file_attr(ino: u64, attr: &ResourceAttr, uid: u32, gid: u32) -> fuser::FileAttr {
    let now = SystemTime::now();
    let kind = match attr.kind {
        FileKind::Dir => fuser::FileType::Directory,
        FileKind::Symlink => fuser::FileType::Symlink,
        _ => fuser::FileType::RegularFile,
    };
    fuser::FileAttr {
        ino,
        size: attr.size,
        blocks: (attr.size + 511) / 512,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind,
        perm: (attr.mode & 0o7777) as u16,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}
