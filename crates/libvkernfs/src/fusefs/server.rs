//! The per-container filesystem served over FUSE.
//!
//! All operation logic lives in the `do_*` methods, which work on plain
//! arguments and are unit-testable; the `fuser::Filesystem` impl is a thin
//! shim that unpacks requests and maps domain errors to errnos.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use fuser::{
    Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyWrite, Request, TimeOrNow,
};
use nix::fcntl::OFlag;
use nix::unistd::Pid;

use crate::error::VkernError;
use crate::fusefs::{file_attr, InodeTable, ROOT_INO};
use crate::handlers::{HandlerContext, HandlerRegistry, ResourceAttr};
use crate::nsenter::NsExec;
use crate::process::ProcessHandle;
use crate::state::{Container, ContainerStore};
use crate::sysio::{FileKind, FsIo};
use crate::Result;

/// Hops allowed when walking parent pids to find a known net namespace.
const MAX_PID_HOPS: u32 = 32;

/// Per-open state, threaded from `open` through `read`/`write` to `release`.
#[derive(Debug)]
struct OpenHandle {
    path: PathBuf,
    flags: OFlag,
}

pub struct VkernFs {
    store: Weak<ContainerStore>,
    registry: Arc<HandlerRegistry>,
    io: Arc<dyn FsIo>,
    nsexec: Arc<dyn NsExec>,
    ttl: Duration,
    /// Serving is gated until the container's registration completes.
    ready: Arc<AtomicBool>,
    inodes: Mutex<InodeTable>,
    handles: Mutex<std::collections::HashMap<u64, OpenHandle>>,
    next_fh: AtomicU64,
}

impl VkernFs {
    pub fn new(
        store: Weak<ContainerStore>,
        registry: Arc<HandlerRegistry>,
        io: Arc<dyn FsIo>,
        nsexec: Arc<dyn NsExec>,
        ttl: Duration,
        ready: Arc<AtomicBool>,
    ) -> Self {
        VkernFs {
            store,
            registry,
            io,
            nsexec,
            ttl,
            ready,
            inodes: Mutex::new(InodeTable::default()),
            handles: Mutex::new(std::collections::HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn store(&self) -> Result<Arc<ContainerStore>> {
        self.store
            .upgrade()
            .ok_or_else(|| VkernError::Internal("container store is gone".into()))
    }

    /// Requester pid -> net-ns inode -> container, walking up the parent
    /// chain when the immediate pid's namespace is not tracked.
    fn resolve_container(&self, pid: u32) -> Result<Arc<Container>> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(VkernError::NotFound("container not yet registered".into()));
        }
        let store = self.store()?;
        let mut current = pid as i32;
        for _ in 0..MAX_PID_HOPS {
            if current <= 0 {
                break;
            }
            let process = ProcessHandle::new(Pid::from_raw(current), Arc::clone(&self.io));
            if let Ok(inode) = process.net_ns_inode() {
                if let Some(cntr) = store.lookup_by_netns_inode(inode) {
                    return Ok(cntr);
                }
            }
            current = match process.parent_pid() {
                Ok(parent) => parent.as_raw(),
                Err(_) => break,
            };
        }
        Err(VkernError::NotFound(format!(
            "no container for requester pid {pid}"
        )))
    }

    fn ctx_for(&self, pid: u32) -> Result<HandlerContext> {
        let container = self.resolve_container(pid)?;
        Ok(HandlerContext::new(
            container,
            Arc::clone(&self.io),
            Arc::clone(&self.nsexec),
        ))
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf> {
        self.inodes
            .lock()
            .unwrap()
            .path_of(ino)
            .ok_or_else(|| VkernError::NotFound(format!("inode {ino}")))
    }

    fn attr_reply(&self, ctx: &HandlerContext, ino: u64, attr: &ResourceAttr) -> fuser::FileAttr {
        let (uid, _) = ctx.container.uid_range();
        let (gid, _) = ctx.container.gid_range();
        file_attr(ino, attr, uid, gid)
    }

    // Operation bodies.

    pub fn do_lookup(&self, pid: u32, parent: u64, name: &OsStr) -> Result<fuser::FileAttr> {
        let ctx = self.ctx_for(pid)?;
        let parent_path = self.path_of(parent)?;
        let path = parent_path.join(name);
        let attr = self.registry.lookup(&ctx, &path)?;
        let ino = self.inodes.lock().unwrap().ino_for(&path);
        Ok(self.attr_reply(&ctx, ino, &attr))
    }

    pub fn do_getattr(&self, pid: u32, ino: u64) -> Result<fuser::FileAttr> {
        let ctx = self.ctx_for(pid)?;
        if ino == ROOT_INO {
            return Ok(self.attr_reply(&ctx, ino, &ResourceAttr::dir()));
        }
        let path = self.path_of(ino)?;
        let attr = self.registry.getattr(&ctx, &path)?;
        Ok(self.attr_reply(&ctx, ino, &attr))
    }

    pub fn do_setattr(&self, pid: u32, ino: u64) -> Result<fuser::FileAttr> {
        let ctx = self.ctx_for(pid)?;
        let path = self.path_of(ino)?;
        let attr = self.registry.setattr(&ctx, &path)?;
        Ok(self.attr_reply(&ctx, ino, &attr))
    }

    pub fn do_open(&self, pid: u32, ino: u64, raw_flags: i32) -> Result<u64> {
        let ctx = self.ctx_for(pid)?;
        let path = self.path_of(ino)?;
        let flags = OFlag::from_bits_truncate(raw_flags);
        self.registry.open(&ctx, &path, flags)?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles
            .lock()
            .unwrap()
            .insert(fh, OpenHandle { path, flags });
        Ok(fh)
    }

    pub fn do_read(&self, pid: u32, ino: u64, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let ctx = self.ctx_for(pid)?;
        let path = self
            .handles
            .lock()
            .unwrap()
            .get(&fh)
            .map(|h| h.path.clone())
            .map_or_else(|| self.path_of(ino), Ok)?;
        let mut data = self.registry.read(&ctx, &path, offset.max(0) as u64)?;
        data.truncate(size as usize);
        Ok(data)
    }

    pub fn do_write(&self, pid: u32, ino: u64, fh: u64, offset: i64, data: &[u8]) -> Result<usize> {
        let ctx = self.ctx_for(pid)?;
        let path = self
            .handles
            .lock()
            .unwrap()
            .get(&fh)
            .map(|h| h.path.clone())
            .map_or_else(|| self.path_of(ino), Ok)?;
        self.registry.write(&ctx, &path, offset.max(0) as u64, data)
    }

    pub fn do_release(&self, pid: u32, fh: u64) -> Result<()> {
        if let Some(handle) = self.handles.lock().unwrap().remove(&fh) {
            if let Ok(ctx) = self.ctx_for(pid) {
                self.registry.release(&ctx, &handle.path)?;
            }
        }
        Ok(())
    }

    pub fn do_readdir(&self, pid: u32, ino: u64) -> Result<Vec<(u64, FileKind, OsString)>> {
        let ctx = self.ctx_for(pid)?;
        let path = self.path_of(ino)?;

        // The mount root is virtual: it only fans out into the two emulated
        // kernel trees.
        let children = if path == Path::new("/") {
            vec![
                (FileKind::Dir, OsString::from("proc")),
                (FileKind::Dir, OsString::from("sys")),
            ]
        } else {
            self.registry
                .readdir(&ctx, &path)?
                .into_iter()
                .map(|e| (e.kind, e.name))
                .collect()
        };

        // The kernel does not synthesize the self and parent entries; the
        // filesystem emits them. The root's parent is the root itself.
        let mut table = self.inodes.lock().unwrap();
        let parent_ino = match path.parent() {
            Some(parent) => table.ino_for(parent),
            None => ROOT_INO,
        };
        let mut entries = vec![
            (ino, FileKind::Dir, OsString::from(".")),
            (parent_ino, FileKind::Dir, OsString::from("..")),
        ];
        entries.extend(children.into_iter().map(|(kind, name)| {
            let child_ino = table.ino_for(&path.join(&name));
            (child_ino, kind, name)
        }));
        Ok(entries)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

fn reply_errno(err: &VkernError) -> i32 {
    err.errno()
}

impl Filesystem for VkernFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.do_lookup(req.pid(), parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(err) => reply.error(reply_errno(&err)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, _ino: u64, _nlookup: u64) {}

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.do_getattr(req.pid(), ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(err) => reply.error(reply_errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.do_setattr(req.pid(), ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(err) => reply.error(reply_errno(&err)),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.do_open(req.pid(), ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(reply_errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.do_read(req.pid(), ino, fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(reply_errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.do_write(req.pid(), ino, fh, offset, data) {
            Ok(count) => reply.written(count as u32),
            Err(err) => reply.error(reply_errno(&err)),
        }
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.do_release(req.pid(), fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(reply_errno(&err)),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.do_readdir(req.pid(), ino) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(reply_errno(&err));
                return;
            }
        };
        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            let kind = match kind {
                FileKind::Dir => fuser::FileType::Directory,
                FileKind::Symlink => fuser::FileType::Symlink,
                _ => fuser::FileType::RegularFile,
            };
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        // Nothing under the emulated trees may be removed from inside the
        // container.
        reply.error(libc::EACCES);
    }
}
