//! `/proc/sys/net/ipv6/conf/all/disable_ipv6`: namespace-local, mirrored
//! into the pod-shared data store.

use std::path::Path;

use crate::error::VkernError;
use crate::handlers::{slice_at, HandlerContext, ResourceAttr, VirtualHandler};
use crate::nsenter::{NamespaceSet, NsExec};
use crate::Result;

const RESOURCE: &str = "/proc/sys/net/ipv6/conf/all/disable_ipv6";

pub struct DisableIpv6Handler;

impl DisableIpv6Handler {
    fn current(&self, ctx: &HandlerContext) -> Result<Vec<u8>> {
        // The mirror makes the value visible to every container in the pod
        // even before its own first kernel read.
        if let Some(cached) = ctx.container.data_read(Path::new(RESOURCE)) {
            return Ok(cached);
        }
        let init_pid = ctx.container.init_pid().ok_or_else(|| {
            VkernError::NotFound(format!(
                "container {} has no init process",
                ctx.container.id()
            ))
        })?;
        ctx.nsexec
            .read_file(init_pid, NamespaceSet::net_only(), Path::new(RESOURCE))
    }
}

impl VirtualHandler for DisableIpv6Handler {
    fn name(&self) -> &'static str {
        RESOURCE
    }

    fn lookup(&self, ctx: &HandlerContext, _path: &Path) -> Result<ResourceAttr> {
        let value = self.current(ctx)?;
        Ok(ResourceAttr::file(value.len() as u64, 0o644))
    }

    fn read(&self, ctx: &HandlerContext, _path: &Path, offset: u64) -> Result<Vec<u8>> {
        Ok(slice_at(self.current(ctx)?, offset))
    }

    fn write(&self, ctx: &HandlerContext, path: &Path, _offset: u64, data: &[u8]) -> Result<usize> {
        let value = match String::from_utf8_lossy(data).trim() {
            "0" => "0",
            "1" => "1",
            other => {
                return Err(VkernError::Invalid(format!(
                    "disable_ipv6 accepts 0 or 1, got {other:?}"
                )))
            }
        };

        // Kernel first when the init process is known; pre-registered pod
        // members still agree on the mirrored value.
        if let Some(init_pid) = ctx.container.init_pid() {
            ctx.nsexec
                .write_file(init_pid, NamespaceSet::net_only(), path, value.as_bytes())?;
        }
        ctx.container.data_write(RESOURCE, value.as_bytes().to_vec());
        Ok(data.len())
    }
}
