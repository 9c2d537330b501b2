//! `/proc/cpuinfo`: host value parsed once, re-rendered through a stable
//! template and cached in the per-container data store.

use std::path::Path;

use nix::fcntl::OFlag;

use crate::error::VkernError;
use crate::handlers::{slice_at, wants_write, HandlerContext, ResourceAttr, VirtualHandler};
use crate::sysio::FsIo;
use crate::Result;

const HOST_PATH: &str = "/proc/cpuinfo";

pub struct CpuinfoHandler;

impl CpuinfoHandler {
    fn rendered(&self, ctx: &HandlerContext) -> Result<Vec<u8>> {
        let cache_key = Path::new(HOST_PATH);
        if let Some(cached) = ctx.container.data_read(cache_key) {
            return Ok(cached);
        }
        let host = ctx.io.read_to_vec(Path::new(HOST_PATH))?;
        let rendered = render(&parse(&host));
        ctx.container.data_write(cache_key, rendered.clone());
        Ok(rendered)
    }
}

impl VirtualHandler for CpuinfoHandler {
    fn name(&self) -> &'static str {
        "/proc/cpuinfo"
    }

    fn lookup(&self, ctx: &HandlerContext, _path: &Path) -> Result<ResourceAttr> {
        let rendered = self.rendered(ctx)?;
        Ok(ResourceAttr::file(rendered.len() as u64, 0o444))
    }

    fn open(&self, _ctx: &HandlerContext, path: &Path, flags: OFlag) -> Result<()> {
        if wants_write(flags) {
            return Err(VkernError::PermissionDenied(path.display().to_string()));
        }
        Ok(())
    }

    fn read(&self, ctx: &HandlerContext, _path: &Path, offset: u64) -> Result<Vec<u8>> {
        Ok(slice_at(self.rendered(ctx)?, offset))
    }

    fn write(&self, _ctx: &HandlerContext, path: &Path, _offset: u64, _data: &[u8]) -> Result<usize> {
        Err(VkernError::PermissionDenied(path.display().to_string()))
    }
}

/// One processor block: `key : value` pairs in first-seen order.
fn parse(raw: &[u8]) -> Vec<Vec<(String, String)>> {
    let text = String::from_utf8_lossy(raw);
    let mut blocks = Vec::new();
    let mut current: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        match line.split_once(':') {
            Some((key, value)) => {
                current.push((key.trim().to_string(), value.trim().to_string()))
            }
            None => current.push((line.trim().to_string(), String::new())),
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Fixed rendering: keys padded to a tab stop, blank line between blocks.
/// The key order of the first parse is the template; repeated reads are
/// byte-identical because they come from the cache.
fn render(blocks: &[Vec<(String, String)>]) -> Vec<u8> {
    let mut out = String::new();
    for (i, block) in blocks.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for (key, value) in block {
            out.push_str(&format!("{key}\t: {value}\n"));
        }
    }
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::Rig;

    const HOST_CPUINFO: &str = "\
processor : 0
model name : Imaginary CPU @ 3.50GHz
flags : fpu vme

processor : 1
model name : Imaginary CPU @ 3.50GHz
flags : fpu vme
";

    #[test]
    fn test_first_read_renders_and_caches() -> anyhow::Result<()> {
        let rig = Rig::new();
        rig.io.insert("/proc/cpuinfo", HOST_CPUINFO);
        let cntr = rig.container("c1", 100, 7001);
        let ctx = rig.ctx(&cntr);

        let first = rig.registry.read(&ctx, Path::new("/proc/cpuinfo"), 0)?;
        let text = String::from_utf8(first.clone())?;
        assert!(text.starts_with("processor\t: 0\n"));
        assert!(text.contains("\nprocessor\t: 1\n"));
        assert!(cntr.data_read(Path::new("/proc/cpuinfo")).is_some());

        // Host changes after the first read do not leak into the container.
        rig.io.insert("/proc/cpuinfo", "processor : 9\n");
        let second = rig.registry.read(&ctx, Path::new("/proc/cpuinfo"), 0)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_parse_splits_blocks_and_trims() {
        let blocks = parse(HOST_CPUINFO.as_bytes());
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0][0], ("processor".to_string(), "0".to_string()));
        assert_eq!(
            blocks[1][1],
            (
                "model name".to_string(),
                "Imaginary CPU @ 3.50GHz".to_string()
            )
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let blocks = parse(HOST_CPUINFO.as_bytes());
        assert_eq!(render(&blocks), render(&blocks));
    }

    #[test]
    fn test_write_rejected() {
        let rig = Rig::new();
        let cntr = rig.container("c1", 100, 7001);
        let ctx = rig.ctx(&cntr);
        let err = rig
            .registry
            .write(&ctx, Path::new("/proc/cpuinfo"), 0, b"x")
            .err()
            .unwrap();
        assert!(matches!(err, VkernError::PermissionDenied(_)));
    }

    #[test]
    fn test_missing_host_file_propagates_not_found() {
        let rig = Rig::new();
        let cntr = rig.container("c1", 100, 7001);
        let ctx = rig.ctx(&cntr);
        let err = rig
            .registry
            .read(&ctx, Path::new("/proc/cpuinfo"), 0)
            .err()
            .unwrap();
        assert!(matches!(err, VkernError::NotFound(_)));
    }
}
