//! Masked paths behave like `/dev/null`: empty reads, rejected writes.

use std::path::Path;

use nix::fcntl::OFlag;

use crate::error::VkernError;
use crate::handlers::{wants_write, HandlerContext, ResourceAttr, VirtualHandler};
use crate::Result;

pub struct MaskedHandler;

impl VirtualHandler for MaskedHandler {
    fn name(&self) -> &'static str {
        "masked"
    }

    fn lookup(&self, _ctx: &HandlerContext, _path: &Path) -> Result<ResourceAttr> {
        Ok(ResourceAttr::file(0, 0o444))
    }

    fn open(&self, _ctx: &HandlerContext, path: &Path, flags: OFlag) -> Result<()> {
        if wants_write(flags) {
            return Err(VkernError::PermissionDenied(path.display().to_string()));
        }
        Ok(())
    }

    fn read(&self, _ctx: &HandlerContext, _path: &Path, _offset: u64) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn write(&self, _ctx: &HandlerContext, path: &Path, _offset: u64, _data: &[u8]) -> Result<usize> {
        Err(VkernError::PermissionDenied(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::Rig;
    use std::path::PathBuf;

    // Masked path: open read-only succeeds, reads hit EOF regardless of the
    // host contents, writes are denied.
    #[test]
    fn test_masked_path_reads_empty_writes_denied() -> anyhow::Result<()> {
        let rig = Rig::new();
        rig.io.insert("/proc/keys", "very secret host keyring");
        let cntr = rig.container("c1", 100, 7001);
        cntr.lock_fields().mask_paths = vec![PathBuf::from("/proc/keys")];
        let ctx = rig.ctx(&cntr);
        let path = Path::new("/proc/keys");

        rig.registry.open(&ctx, path, OFlag::O_RDONLY)?;
        assert_eq!(rig.registry.read(&ctx, path, 0)?, b"");
        assert_eq!(rig.registry.getattr(&ctx, path)?.size, 0);

        let err = rig.registry.write(&ctx, path, 0, b"x").err().unwrap();
        assert!(matches!(err, VkernError::PermissionDenied(_)));
        Ok(())
    }
}
