//! Resource handler registry.
//!
//! Every emulated path maps to a handler implementing the small verb set the
//! FUSE layer and the syscall-trap front-end dispatch through. Lookup is
//! exact-match first, then longest prefix, with a host pass-through covering
//! everything else. Container-declared masked and read-only paths take
//! precedence over the table.

pub mod conntrack;
pub mod cpuinfo;
pub mod ipv6;
pub mod masked;
pub mod passthrough;
pub mod swaps;
pub mod uptime;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::fcntl::OFlag;

use crate::error::VkernError;
use crate::mount::classify::ProcPathSets;
use crate::mount::{policy, MountSnapshot};
use crate::nsenter::NsExec;
use crate::process::ProcessHandle;
use crate::state::Container;
use crate::sysio::{DirEntryInfo, FileKind, FsIo};
use crate::Result;

/// Capability bundle threaded into every handler call.
#[derive(Clone)]
pub struct HandlerContext {
    pub container: Arc<Container>,
    pub io: Arc<dyn FsIo>,
    pub nsexec: Arc<dyn NsExec>,
}

impl HandlerContext {
    pub fn new(container: Arc<Container>, io: Arc<dyn FsIo>, nsexec: Arc<dyn NsExec>) -> Self {
        HandlerContext {
            container,
            io,
            nsexec,
        }
    }
}

/// Attributes of an emulated resource, enough for the FUSE layer to build a
/// kernel stat reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceAttr {
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
}

impl ResourceAttr {
    pub fn file(size: u64, mode: u32) -> Self {
        ResourceAttr {
            kind: FileKind::File,
            size,
            mode,
        }
    }

    pub fn dir() -> Self {
        ResourceAttr {
            kind: FileKind::Dir,
            size: 0,
            mode: 0o555,
        }
    }
}

pub fn wants_write(flags: OFlag) -> bool {
    let acc = flags & OFlag::O_ACCMODE;
    acc == OFlag::O_WRONLY || acc == OFlag::O_RDWR
}

/// Offset slicing shared by handlers that render whole payloads.
pub fn slice_at(data: Vec<u8>, offset: u64) -> Vec<u8> {
    let start = (offset as usize).min(data.len());
    data[start..].to_vec()
}

/// Verb set of an emulated resource.
pub trait VirtualHandler: Send + Sync {
    /// Registered path or path prefix.
    fn name(&self) -> &'static str;

    fn lookup(&self, ctx: &HandlerContext, path: &Path) -> Result<ResourceAttr>;

    fn getattr(&self, ctx: &HandlerContext, path: &Path) -> Result<ResourceAttr> {
        self.lookup(ctx, path)
    }

    /// Policy gate; called before the kernel hands out a file handle.
    fn open(&self, _ctx: &HandlerContext, _path: &Path, _flags: OFlag) -> Result<()> {
        Ok(())
    }

    fn read(&self, ctx: &HandlerContext, path: &Path, offset: u64) -> Result<Vec<u8>>;

    fn write(&self, ctx: &HandlerContext, path: &Path, offset: u64, data: &[u8]) -> Result<usize>;

    fn readdir(&self, _ctx: &HandlerContext, path: &Path) -> Result<Vec<DirEntryInfo>> {
        Err(VkernError::Invalid(format!(
            "not a directory: {}",
            path.display()
        )))
    }

    /// Truncate-on-open and chmod arrive here. Harmless for emulated
    /// resources; write policy is enforced on the write path.
    fn setattr(&self, ctx: &HandlerContext, path: &Path) -> Result<ResourceAttr> {
        self.getattr(ctx, path)
    }

    fn release(&self, _ctx: &HandlerContext, _path: &Path) -> Result<()> {
        Ok(())
    }
}

pub struct HandlerRegistry {
    exact: HashMap<PathBuf, Arc<dyn VirtualHandler>>,
    /// Sorted by descending component count so the first prefix hit is the
    /// longest one.
    prefixes: Vec<(PathBuf, Arc<dyn VirtualHandler>)>,
    passthrough: Arc<dyn VirtualHandler>,
    masked: Arc<dyn VirtualHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            exact: HashMap::new(),
            prefixes: Vec::new(),
            passthrough: Arc::new(passthrough::HostPassthrough),
            masked: Arc::new(masked::MaskedHandler),
        }
    }

    /// Registry with the full emulated resource table.
    pub fn with_default_handlers() -> Self {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(uptime::UptimeHandler));
        registry.register(Arc::new(cpuinfo::CpuinfoHandler));
        registry.register(Arc::new(swaps::SwapsHandler));
        registry.register(Arc::new(conntrack::ClampedMaxHandler::nf_conntrack_max()));
        registry.register(Arc::new(
            conntrack::ClampedMaxHandler::nf_conntrack_hashsize(),
        ));
        registry.register(Arc::new(ipv6::DisableIpv6Handler));
        registry.register_prefix(Arc::new(passthrough::ProcSysPassthrough));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn VirtualHandler>) {
        self.exact.insert(PathBuf::from(handler.name()), handler);
    }

    pub fn register_prefix(&mut self, handler: Arc<dyn VirtualHandler>) {
        self.prefixes.push((PathBuf::from(handler.name()), handler));
        self.prefixes.sort_by_key(|(p, _)| {
            std::cmp::Reverse(p.components().count())
        });
    }

    /// Exact match, then longest prefix, then pass-through. Masked paths win
    /// over everything.
    pub fn handler_for(&self, container: &Container, path: &Path) -> Arc<dyn VirtualHandler> {
        if container.is_mask_path(path) {
            return Arc::clone(&self.masked);
        }
        if let Some(handler) = self.exact.get(path) {
            return Arc::clone(handler);
        }
        for (prefix, handler) in &self.prefixes {
            if path.starts_with(prefix) {
                return Arc::clone(handler);
            }
        }
        Arc::clone(&self.passthrough)
    }

    // Dispatch wrappers: container-declared read-only paths are enforced
    // here so individual handlers do not repeat the check.

    pub fn lookup(&self, ctx: &HandlerContext, path: &Path) -> Result<ResourceAttr> {
        self.handler_for(&ctx.container, path).lookup(ctx, path)
    }

    pub fn getattr(&self, ctx: &HandlerContext, path: &Path) -> Result<ResourceAttr> {
        self.handler_for(&ctx.container, path).getattr(ctx, path)
    }

    pub fn open(&self, ctx: &HandlerContext, path: &Path, flags: OFlag) -> Result<()> {
        if wants_write(flags) && ctx.container.is_ro_path(path) {
            return Err(VkernError::PermissionDenied(path.display().to_string()));
        }
        self.handler_for(&ctx.container, path).open(ctx, path, flags)
    }

    pub fn read(&self, ctx: &HandlerContext, path: &Path, offset: u64) -> Result<Vec<u8>> {
        self.handler_for(&ctx.container, path).read(ctx, path, offset)
    }

    pub fn write(
        &self,
        ctx: &HandlerContext,
        path: &Path,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if ctx.container.is_ro_path(path) {
            return Err(VkernError::PermissionDenied(path.display().to_string()));
        }
        self.handler_for(&ctx.container, path)
            .write(ctx, path, offset, data)
    }

    pub fn readdir(&self, ctx: &HandlerContext, path: &Path) -> Result<Vec<DirEntryInfo>> {
        self.handler_for(&ctx.container, path).readdir(ctx, path)
    }

    pub fn setattr(&self, ctx: &HandlerContext, path: &Path) -> Result<ResourceAttr> {
        self.handler_for(&ctx.container, path).setattr(ctx, path)
    }

    pub fn release(&self, ctx: &HandlerContext, path: &Path) -> Result<()> {
        self.handler_for(&ctx.container, path).release(ctx, path)
    }

    /// Paths the registry emulates for this container, i.e. the mountpoints
    /// whose inodes belong to the daemon rather than the kernel.
    pub fn managed_paths(&self, container: &Container) -> HashSet<PathBuf> {
        let mut paths: HashSet<PathBuf> = self.exact.keys().cloned().collect();
        paths.extend(self.prefixes.iter().map(|(p, _)| p.clone()));
        paths.extend(container.ro_paths());
        paths.extend(container.mask_paths());
        paths
    }

    // Trapped mount/umount syscall validation. A fresh snapshot of the
    // calling container's mount table is consulted per call; snapshots are
    // cheap and immutable, so concurrent validations do not interfere.

    pub fn validate_umount(&self, ctx: &HandlerContext, target: &Path) -> Result<()> {
        let (snapshot, ro, mask) = self.container_snapshot(ctx)?;
        policy::check_umount(&snapshot, ProcPathSets { ro: &ro, mask: &mask }, target)
    }

    pub fn validate_remount(
        &self,
        ctx: &HandlerContext,
        target: &Path,
        read_write: bool,
    ) -> Result<()> {
        let (snapshot, ro, mask) = self.container_snapshot(ctx)?;
        policy::check_remount(
            &snapshot,
            ProcPathSets { ro: &ro, mask: &mask },
            target,
            read_write,
        )
    }

    pub fn validate_new_mount(&self, ctx: &HandlerContext, target: &Path) -> Result<()> {
        let (snapshot, ro, mask) = self.container_snapshot(ctx)?;
        policy::check_new_mount(&snapshot, ProcPathSets { ro: &ro, mask: &mask }, target)
    }

    fn container_snapshot(
        &self,
        ctx: &HandlerContext,
    ) -> Result<(MountSnapshot, Vec<PathBuf>, Vec<PathBuf>)> {
        let init_pid = ctx
            .container
            .init_pid()
            .ok_or_else(|| VkernError::NotFound(format!("container {} has no init process", ctx.container.id())))?;
        let process = ProcessHandle::new(init_pid, Arc::clone(&ctx.io));
        let snapshot = MountSnapshot::for_process(&process, ctx.io.as_ref(), ctx.nsexec.as_ref())?;
        Ok((snapshot, ctx.container.ro_paths(), ctx.container.mask_paths()))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}
