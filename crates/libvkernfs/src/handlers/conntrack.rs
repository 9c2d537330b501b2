//! Clamped-writable conntrack resources:
//! `/proc/sys/net/netfilter/nf_conntrack_max` and
//! `/sys/module/nf_conntrack/parameters/hashsize`.
//!
//! Each container tracks its own target value; the shared host value is only
//! ever promoted, never regressed, no matter how container writes
//! interleave.

use std::path::Path;
use std::sync::Mutex;

use crate::error::VkernError;
use crate::handlers::{slice_at, HandlerContext, ResourceAttr, VirtualHandler};
use crate::nsenter::{NamespaceSet, NsExec};
use crate::sysio::FsIo;
use crate::Result;

pub const CONNTRACK_MAX: &str = "/proc/sys/net/netfilter/nf_conntrack_max";
pub const CONNTRACK_HASHSIZE: &str = "/sys/module/nf_conntrack/parameters/hashsize";

pub struct ClampedMaxHandler {
    resource: &'static str,
    /// High-water mark of the host value, folded together with fresh host
    /// reads. Doubles as the per-resource lock that serializes promoting
    /// writes across containers.
    host_mark: Mutex<Option<u64>>,
}

impl ClampedMaxHandler {
    pub fn nf_conntrack_max() -> Self {
        ClampedMaxHandler {
            resource: CONNTRACK_MAX,
            host_mark: Mutex::new(None),
        }
    }

    pub fn nf_conntrack_hashsize() -> Self {
        ClampedMaxHandler {
            resource: CONNTRACK_HASHSIZE,
            host_mark: Mutex::new(None),
        }
    }

    fn host_value(&self, ctx: &HandlerContext, mark: &mut Option<u64>) -> Result<u64> {
        let raw = ctx.io.read_to_vec(Path::new(self.resource))?;
        let read = parse_value(&raw)?;
        let value = mark.map_or(read, |m| m.max(read));
        *mark = Some(value);
        Ok(value)
    }

    fn target(&self, ctx: &HandlerContext) -> Result<u64> {
        if let Some(cached) = ctx.container.data_read(Path::new(self.resource)) {
            return parse_value(&cached);
        }
        let mut mark = self.host_mark.lock().unwrap();
        let host = self.host_value(ctx, &mut mark)?;
        ctx.container
            .data_write(self.resource, host.to_string().into_bytes());
        Ok(host)
    }
}

impl VirtualHandler for ClampedMaxHandler {
    fn name(&self) -> &'static str {
        self.resource
    }

    fn lookup(&self, ctx: &HandlerContext, _path: &Path) -> Result<ResourceAttr> {
        let rendered = self.target(ctx)?.to_string();
        Ok(ResourceAttr::file(rendered.len() as u64, 0o644))
    }

    fn read(&self, ctx: &HandlerContext, _path: &Path, offset: u64) -> Result<Vec<u8>> {
        let rendered = self.target(ctx)?.to_string().into_bytes();
        Ok(slice_at(rendered, offset))
    }

    fn write(&self, ctx: &HandlerContext, path: &Path, _offset: u64, data: &[u8]) -> Result<usize> {
        let value = parse_value(data)?;

        // The promote decision and the host write happen under one lock so
        // two containers can never interleave into a host regression.
        let mut mark = self.host_mark.lock().unwrap();
        let host = self.host_value(ctx, &mut mark)?;

        ctx.container
            .data_write(self.resource, value.to_string().into_bytes());

        if value > host {
            let init_pid = ctx.container.init_pid().ok_or_else(|| {
                VkernError::NotFound(format!(
                    "container {} has no init process",
                    ctx.container.id()
                ))
            })?;
            ctx.nsexec.write_file(
                init_pid,
                NamespaceSet::net_only(),
                path,
                value.to_string().as_bytes(),
            )?;
            *mark = Some(value);
            tracing::debug!(resource = self.resource, value, "promoted host value");
        }
        Ok(data.len())
    }
}

fn parse_value(data: &[u8]) -> Result<u64> {
    let text = String::from_utf8_lossy(data);
    text.trim()
        .parse::<u64>()
        .map_err(|_| VkernError::Invalid(format!("not a conntrack limit: {}", text.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::Rig;
    use crate::nsenter::NsExec;
    use nix::unistd::Pid;

    fn rig_with_host(value: &str) -> Rig {
        let rig = Rig::new();
        rig.io.insert(CONNTRACK_MAX, value);
        rig
    }

    fn ns_value(rig: &Rig, pid: i32, resource: &str) -> Option<Vec<u8>> {
        rig.nsexec
            .read_file(
                Pid::from_raw(pid),
                NamespaceSet::net_only(),
                Path::new(resource),
            )
            .ok()
    }

    #[test]
    fn test_first_read_establishes_target_from_host() -> anyhow::Result<()> {
        let rig = rig_with_host("100000");
        let cntr = rig.container("c1", 100, 7001);
        let ctx = rig.ctx(&cntr);
        assert_eq!(
            rig.registry.read(&ctx, Path::new(CONNTRACK_MAX), 0)?,
            b"100000"
        );
        Ok(())
    }

    // Clamp without host regression: a low write stays container-local, a
    // high write promotes the host.
    #[test]
    fn test_clamp_and_promote() -> anyhow::Result<()> {
        let rig = rig_with_host("100000");
        let cntr = rig.container("c1", 100, 7001);
        let ctx = rig.ctx(&cntr);
        let path = Path::new(CONNTRACK_MAX);

        rig.registry.write(&ctx, path, 0, b"65535")?;
        // Host untouched, container sees its own value.
        assert!(ns_value(&rig, 100, CONNTRACK_MAX).is_none());
        assert_eq!(rig.registry.read(&ctx, path, 0)?, b"65535");

        rig.registry.write(&ctx, path, 0, b"200000")?;
        assert_eq!(ns_value(&rig, 100, CONNTRACK_MAX).unwrap(), b"200000");
        assert_eq!(rig.registry.read(&ctx, path, 0)?, b"200000");
        Ok(())
    }

    // Host monotonicity across containers: once one container promoted to
    // 200000, a 150000 write from another container must not touch the host
    // even though 150000 exceeds the stale host file.
    #[test]
    fn test_no_host_regression_across_containers() -> anyhow::Result<()> {
        let rig = rig_with_host("100000");
        let c1 = rig.container("c1", 100, 7001);
        let c2 = rig.container("c2", 200, 7002);
        let path = Path::new(CONNTRACK_MAX);

        rig.registry.write(&rig.ctx(&c1), path, 0, b"200000")?;
        assert_eq!(ns_value(&rig, 100, CONNTRACK_MAX).unwrap(), b"200000");

        rig.registry.write(&rig.ctx(&c2), path, 0, b"150000")?;
        assert!(ns_value(&rig, 200, CONNTRACK_MAX).is_none());

        // Each container reads its own target.
        assert_eq!(rig.registry.read(&rig.ctx(&c1), path, 0)?, b"200000");
        assert_eq!(rig.registry.read(&rig.ctx(&c2), path, 0)?, b"150000");
        Ok(())
    }

    #[test]
    fn test_hashsize_clamps_independently() -> anyhow::Result<()> {
        let rig = rig_with_host("100000");
        rig.io.insert(CONNTRACK_HASHSIZE, "16384");
        let cntr = rig.container("c1", 100, 7001);
        let ctx = rig.ctx(&cntr);
        let path = Path::new(CONNTRACK_HASHSIZE);

        assert_eq!(rig.registry.read(&ctx, path, 0)?, b"16384");
        rig.registry.write(&ctx, path, 0, b"8192")?;
        assert!(ns_value(&rig, 100, CONNTRACK_HASHSIZE).is_none());
        assert_eq!(rig.registry.read(&ctx, path, 0)?, b"8192");

        rig.registry.write(&ctx, path, 0, b"65536")?;
        assert_eq!(ns_value(&rig, 100, CONNTRACK_HASHSIZE).unwrap(), b"65536");
        // The conntrack max target is untouched by hashsize writes.
        assert_eq!(
            rig.registry.read(&ctx, Path::new(CONNTRACK_MAX), 0)?,
            b"100000"
        );
        Ok(())
    }

    #[test]
    fn test_garbage_write_is_invalid() {
        let rig = rig_with_host("100000");
        let cntr = rig.container("c1", 100, 7001);
        let err = rig
            .registry
            .write(&rig.ctx(&cntr), Path::new(CONNTRACK_MAX), 0, b"lots")
            .err()
            .unwrap();
        assert!(matches!(err, VkernError::Invalid(_)));
    }

    #[test]
    fn test_trailing_newline_accepted() -> anyhow::Result<()> {
        let rig = rig_with_host("100000");
        let cntr = rig.container("c1", 100, 7001);
        let ctx = rig.ctx(&cntr);
        rig.registry
            .write(&ctx, Path::new(CONNTRACK_MAX), 0, b"120000\n")?;
        assert_eq!(
            rig.registry.read(&ctx, Path::new(CONNTRACK_MAX), 0)?,
            b"120000"
        );
        Ok(())
    }
}
