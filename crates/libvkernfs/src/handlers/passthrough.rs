//! Pass-through handlers.
//!
//! `HostPassthrough` forwards to the same path on the host filesystem and
//! covers every resource without a dedicated handler. `ProcSysPassthrough`
//! covers the `/proc/sys` subtree, whose values are namespace-dependent and
//! must therefore be read and written from inside the container's
//! namespaces.

use std::path::Path;

use nix::fcntl::OFlag;

use crate::error::VkernError;
use crate::handlers::{slice_at, HandlerContext, ResourceAttr, VirtualHandler};
use crate::nsenter::{NamespaceSet, NsExec};
use crate::sysio::{DirEntryInfo, FileKind, FsIo, IoFile};
use crate::Result;

pub struct HostPassthrough;

impl VirtualHandler for HostPassthrough {
    fn name(&self) -> &'static str {
        "/"
    }

    fn lookup(&self, ctx: &HandlerContext, path: &Path) -> Result<ResourceAttr> {
        let status = ctx.io.stat(path)?;
        Ok(ResourceAttr {
            kind: status.kind,
            size: status.size,
            mode: status.mode & 0o777,
        })
    }

    fn open(&self, ctx: &HandlerContext, path: &Path, flags: OFlag) -> Result<()> {
        // Probe the host so flag violations surface at open time, the same
        // way they would without the emulation layer in between.
        ctx.io.open(path, flags, 0).map(|_| ())
    }

    fn read(&self, ctx: &HandlerContext, path: &Path, offset: u64) -> Result<Vec<u8>> {
        let mut file = ctx.io.open(path, OFlag::O_RDONLY, 0)?;
        let data = file.read_all()?;
        Ok(slice_at(data, offset))
    }

    fn write(&self, ctx: &HandlerContext, path: &Path, offset: u64, data: &[u8]) -> Result<usize> {
        let mut file = ctx.io.open(path, OFlag::O_WRONLY, 0)?;
        file.write_at(offset, data)
    }

    fn readdir(&self, ctx: &HandlerContext, path: &Path) -> Result<Vec<DirEntryInfo>> {
        ctx.io.read_dir(path)
    }
}

pub struct ProcSysPassthrough;

impl ProcSysPassthrough {
    fn init_pid(ctx: &HandlerContext) -> Result<nix::unistd::Pid> {
        ctx.container.init_pid().ok_or_else(|| {
            VkernError::NotFound(format!(
                "container {} has no init process",
                ctx.container.id()
            ))
        })
    }
}

impl VirtualHandler for ProcSysPassthrough {
    fn name(&self) -> &'static str {
        "/proc/sys"
    }

    fn lookup(&self, ctx: &HandlerContext, path: &Path) -> Result<ResourceAttr> {
        // Shape comes from the host tree; values come from the namespace.
        match ctx.io.stat(path) {
            Ok(status) if status.kind == FileKind::Dir => Ok(ResourceAttr::dir()),
            Ok(status) => Ok(ResourceAttr {
                kind: status.kind,
                size: status.size,
                mode: status.mode & 0o777,
            }),
            Err(err) => Err(err),
        }
    }

    fn read(&self, ctx: &HandlerContext, path: &Path, offset: u64) -> Result<Vec<u8>> {
        let pid = Self::init_pid(ctx)?;
        let data = ctx
            .nsexec
            .read_file(pid, NamespaceSet::all_but_user(), path)?;
        Ok(slice_at(data, offset))
    }

    fn write(&self, ctx: &HandlerContext, path: &Path, _offset: u64, data: &[u8]) -> Result<usize> {
        let pid = Self::init_pid(ctx)?;
        ctx.nsexec
            .write_file(pid, NamespaceSet::all_but_user(), path, data)?;
        Ok(data.len())
    }

    fn readdir(&self, ctx: &HandlerContext, path: &Path) -> Result<Vec<DirEntryInfo>> {
        ctx.io.read_dir(path)
    }
}
