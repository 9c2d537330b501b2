//! `/proc/swaps`: a virtual host reports no swap devices, only the header.

use std::path::Path;

use nix::fcntl::OFlag;

use crate::error::VkernError;
use crate::handlers::{slice_at, wants_write, HandlerContext, ResourceAttr, VirtualHandler};
use crate::Result;

const HEADER: &str = "Filename\t\t\t\tType\t\tSize\tUsed\tPriority\n";

pub struct SwapsHandler;

impl VirtualHandler for SwapsHandler {
    fn name(&self) -> &'static str {
        "/proc/swaps"
    }

    fn lookup(&self, _ctx: &HandlerContext, _path: &Path) -> Result<ResourceAttr> {
        Ok(ResourceAttr::file(HEADER.len() as u64, 0o444))
    }

    fn open(&self, _ctx: &HandlerContext, path: &Path, flags: OFlag) -> Result<()> {
        if wants_write(flags) {
            return Err(VkernError::PermissionDenied(path.display().to_string()));
        }
        Ok(())
    }

    fn read(&self, _ctx: &HandlerContext, _path: &Path, offset: u64) -> Result<Vec<u8>> {
        Ok(slice_at(HEADER.as_bytes().to_vec(), offset))
    }

    fn write(&self, _ctx: &HandlerContext, path: &Path, _offset: u64, _data: &[u8]) -> Result<usize> {
        Err(VkernError::PermissionDenied(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::Rig;

    #[test]
    fn test_swaps_shows_empty_table() -> anyhow::Result<()> {
        let rig = Rig::new();
        rig.io.insert("/proc/swaps", "host swap entries here");
        let cntr = rig.container("c1", 100, 7001);
        let ctx = rig.ctx(&cntr);

        let data = rig.registry.read(&ctx, Path::new("/proc/swaps"), 0)?;
        assert_eq!(data, HEADER.as_bytes());
        Ok(())
    }

    #[test]
    fn test_swaps_rejects_writes() {
        let rig = Rig::new();
        let cntr = rig.container("c1", 100, 7001);
        let err = rig
            .registry
            .write(&rig.ctx(&cntr), Path::new("/proc/swaps"), 0, b"x")
            .err()
            .unwrap();
        assert!(matches!(err, VkernError::PermissionDenied(_)));
    }
}
