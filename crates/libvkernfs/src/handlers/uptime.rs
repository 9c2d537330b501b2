//! `/proc/uptime`: pure emulation from the container's creation time.

use std::path::Path;

use chrono::Utc;
use nix::fcntl::OFlag;

use crate::error::VkernError;
use crate::handlers::{slice_at, wants_write, HandlerContext, ResourceAttr, VirtualHandler};
use crate::Result;

pub struct UptimeHandler;

impl UptimeHandler {
    fn render(&self, ctx: &HandlerContext) -> Result<Vec<u8>> {
        let secs = ctx
            .container
            .uptime_seconds(Utc::now())
            .ok_or_else(|| {
                VkernError::NotFound(format!(
                    "container {} not registered",
                    ctx.container.id()
                ))
            })?;
        // Both fields mirror the container lifetime: a virtual host has no
        // separate idle accounting.
        Ok(format!("{secs} {secs}").into_bytes())
    }
}

impl VirtualHandler for UptimeHandler {
    fn name(&self) -> &'static str {
        "/proc/uptime"
    }

    fn lookup(&self, ctx: &HandlerContext, _path: &Path) -> Result<ResourceAttr> {
        let rendered = self.render(ctx)?;
        Ok(ResourceAttr::file(rendered.len() as u64, 0o444))
    }

    fn open(&self, _ctx: &HandlerContext, path: &Path, flags: OFlag) -> Result<()> {
        if wants_write(flags) {
            return Err(VkernError::PermissionDenied(path.display().to_string()));
        }
        Ok(())
    }

    fn read(&self, ctx: &HandlerContext, _path: &Path, offset: u64) -> Result<Vec<u8>> {
        Ok(slice_at(self.render(ctx)?, offset))
    }

    fn write(&self, _ctx: &HandlerContext, path: &Path, _offset: u64, _data: &[u8]) -> Result<usize> {
        Err(VkernError::PermissionDenied(path.display().to_string()))
    }
}
