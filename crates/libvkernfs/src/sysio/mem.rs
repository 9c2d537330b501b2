//! In-memory IO backing for unit tests.
//!
//! Simulates a POSIX-ish tree: directories spring into existence as needed,
//! files carry a byte blob and a mode. Namespace inodes are fulfilled by
//! parsing the file contents as a decimal integer, which lets tests pin
//! deterministic inode numbers by seeding e.g. `/proc/100/ns/net` = `"7001"`.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::fcntl::OFlag;

use crate::error::VkernError;
use crate::sysio::{DirEntryInfo, FileKind, FileStatus, FsIo, IoFile};
use crate::Result;

#[derive(Clone, Debug)]
struct MemFile {
    data: Vec<u8>,
    mode: u32,
}

#[derive(Default, Debug)]
struct MemTree {
    files: HashMap<PathBuf, MemFile>,
    dirs: Vec<PathBuf>,
    // Paths written through this backing, for test assertions.
    write_log: Vec<PathBuf>,
}

impl MemTree {
    fn ensure_parents(&mut self, path: &Path) {
        let mut cur = PathBuf::new();
        for comp in path.components() {
            cur.push(comp);
            if cur != path && !self.dirs.contains(&cur) {
                self.dirs.push(cur.clone());
            }
        }
    }

    fn contains_dir(&self, path: &Path) -> bool {
        path == Path::new("/") || self.dirs.iter().any(|d| d == path)
    }
}

#[derive(Default)]
pub struct MemIo {
    tree: Arc<Mutex<MemTree>>,
}

impl MemIo {
    /// Seeds the tree with `(path, contents)` pairs.
    pub fn seeded<I, P, B>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, B)>,
        P: Into<PathBuf>,
        B: Into<Vec<u8>>,
    {
        let io = MemIo::default();
        {
            let mut tree = io.tree.lock().unwrap();
            for (path, data) in entries {
                let path = path.into();
                tree.ensure_parents(&path);
                tree.files.insert(
                    path,
                    MemFile {
                        data: data.into(),
                        mode: 0o644,
                    },
                );
            }
        }
        io
    }

    pub fn insert(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        let path = path.into();
        let mut tree = self.tree.lock().unwrap();
        tree.ensure_parents(&path);
        tree.files.insert(
            path,
            MemFile {
                data: data.into(),
                mode: 0o644,
            },
        );
    }

    pub fn set_mode(&self, path: impl Into<PathBuf>, mode: u32) {
        let path = path.into();
        let mut tree = self.tree.lock().unwrap();
        if let Some(f) = tree.files.get_mut(&path) {
            f.mode = mode;
        }
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.tree.lock().unwrap().files.get(path).map(|f| f.data.clone())
    }

    pub fn written_paths(&self) -> Vec<PathBuf> {
        self.tree.lock().unwrap().write_log.clone()
    }
}

struct MemFileHandle {
    tree: Arc<Mutex<MemTree>>,
    path: PathBuf,
    writable: bool,
}

impl IoFile for MemFileHandle {
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let tree = self.tree.lock().unwrap();
        tree.files
            .get(&self.path)
            .map(|f| f.data.clone())
            .ok_or_else(|| VkernError::not_found_path(&self.path))
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.read_all()?;
        let start = (offset as usize).min(data.len());
        let end = (start + len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.write_at(0, data).map(|_| ())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(VkernError::PermissionDenied(self.path.display().to_string()));
        }
        let mut tree = self.tree.lock().unwrap();
        let file = tree
            .files
            .get_mut(&self.path)
            .ok_or_else(|| VkernError::not_found_path(&self.path))?;
        let offset = offset as usize;
        if file.data.len() < offset + data.len() {
            file.data.resize(offset + data.len(), 0);
        }
        file.data[offset..offset + data.len()].copy_from_slice(data);
        file.data.truncate(offset + data.len());
        let path = self.path.clone();
        tree.write_log.push(path);
        Ok(data.len())
    }

    fn seek_start(&mut self) -> Result<()> {
        Ok(())
    }
}

impl FsIo for MemIo {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn open(&self, path: &Path, flags: OFlag, mode: u32) -> Result<Box<dyn IoFile>> {
        let acc = flags & OFlag::O_ACCMODE;
        let writable = acc == OFlag::O_WRONLY || acc == OFlag::O_RDWR;
        let mut tree = self.tree.lock().unwrap();
        let exists = tree.files.contains_key(path);
        if !exists {
            if !flags.contains(OFlag::O_CREAT) {
                return Err(VkernError::not_found_path(path));
            }
            let path_buf = path.to_path_buf();
            tree.ensure_parents(&path_buf);
            tree.files.insert(
                path_buf,
                MemFile {
                    data: Vec::new(),
                    mode,
                },
            );
        } else if writable {
            if let Some(file) = tree.files.get_mut(path) {
                if file.mode & 0o222 == 0 {
                    return Err(VkernError::PermissionDenied(path.display().to_string()));
                }
                if flags.contains(OFlag::O_TRUNC) {
                    file.data.clear();
                }
            }
        }
        Ok(Box::new(MemFileHandle {
            tree: Arc::clone(&self.tree),
            path: path.to_path_buf(),
            writable,
        }))
    }

    fn read_to_vec(&self, path: &Path) -> Result<Vec<u8>> {
        let tree = self.tree.lock().unwrap();
        tree.files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| VkernError::not_found_path(path))
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        let path_buf = path.to_path_buf();
        tree.ensure_parents(&path_buf);
        let entry = tree.files.entry(path_buf.clone()).or_insert(MemFile {
            data: Vec::new(),
            mode: 0o644,
        });
        entry.data = data.to_vec();
        tree.write_log.push(path_buf);
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        let tree = self.tree.lock().unwrap();
        if !tree.contains_dir(path) {
            return Err(VkernError::not_found_path(path));
        }
        let mut entries: Vec<DirEntryInfo> = Vec::new();
        for (p, _) in tree.files.iter() {
            if p.parent() == Some(path) {
                entries.push(DirEntryInfo {
                    name: p.file_name().unwrap_or_default().to_os_string(),
                    kind: FileKind::File,
                });
            }
        }
        for d in tree.dirs.iter() {
            if d.parent() == Some(path) {
                entries.push(DirEntryInfo {
                    name: d.file_name().unwrap_or_default().to_os_string(),
                    kind: FileKind::Dir,
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> Result<FileStatus> {
        let tree = self.tree.lock().unwrap();
        if let Some(f) = tree.files.get(path) {
            return Ok(FileStatus {
                kind: FileKind::File,
                size: f.data.len() as u64,
                mode: f.mode,
                ino: 0,
            });
        }
        if tree.contains_dir(path) {
            return Ok(FileStatus {
                kind: FileKind::Dir,
                size: 0,
                mode: 0o755,
                ino: 0,
            });
        }
        Err(VkernError::not_found_path(path))
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        let path_buf = path.to_path_buf();
        tree.ensure_parents(&path_buf);
        if !tree.dirs.contains(&path_buf) {
            tree.dirs.push(path_buf);
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        if tree.files.remove(path).is_some() {
            return Ok(());
        }
        if let Some(pos) = tree.dirs.iter().position(|d| d == path) {
            tree.dirs.remove(pos);
            return Ok(());
        }
        Err(VkernError::not_found_path(path))
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        tree.files.retain(|p, _| !p.starts_with(path));
        tree.dirs.retain(|d| !d.starts_with(path));
        Ok(())
    }

    fn read_link(&self, path: &Path) -> Result<PathBuf> {
        let data = self.read_to_vec(path)?;
        Ok(PathBuf::from(String::from_utf8_lossy(&data).trim()))
    }

    fn ns_inode(&self, path: &Path) -> Result<u64> {
        let data = self.read_to_vec(path)?;
        let text = String::from_utf8_lossy(&data);
        text.trim()
            .parse::<u64>()
            .map_err(|_| VkernError::Invalid(format!("not a namespace inode: {}", text.trim())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_and_read() -> anyhow::Result<()> {
        let io = MemIo::seeded([("/proc/uptime", "100.00 100.00")]);
        assert_eq!(io.read_to_vec(Path::new("/proc/uptime"))?, b"100.00 100.00");
        Ok(())
    }

    #[test]
    fn test_ns_inode_decimal_convention() -> anyhow::Result<()> {
        let io = MemIo::seeded([("/proc/100/ns/net", "7001")]);
        assert_eq!(io.ns_inode(Path::new("/proc/100/ns/net"))?, 7001);
        assert!(matches!(
            io.ns_inode(Path::new("/proc/101/ns/net")),
            Err(VkernError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_open_missing_without_create() {
        let io = MemIo::default();
        let err = io
            .open(Path::new("/nope"), OFlag::O_RDONLY, 0)
            .err()
            .unwrap();
        assert!(matches!(err, VkernError::NotFound(_)));
    }

    #[test]
    fn test_write_at_extends_and_truncates() -> anyhow::Result<()> {
        let io = MemIo::seeded([("/f", "hello world")]);
        let mut fh = io.open(Path::new("/f"), OFlag::O_RDWR, 0)?;
        fh.write_at(0, b"bye")?;
        assert_eq!(io.contents(Path::new("/f")).unwrap(), b"bye");
        Ok(())
    }

    #[test]
    fn test_readonly_mode_rejects_write_open() {
        let io = MemIo::seeded([("/ro", "x")]);
        io.set_mode("/ro", 0o444);
        let err = io.open(Path::new("/ro"), OFlag::O_WRONLY, 0).err().unwrap();
        assert!(matches!(err, VkernError::PermissionDenied(_)));
    }

    #[test]
    fn test_read_dir_lists_children() -> anyhow::Result<()> {
        let io = MemIo::seeded([("/proc/sys/net/a", "1"), ("/proc/sys/net/b", "2")]);
        let names: Vec<_> = io
            .read_dir(Path::new("/proc/sys/net"))?
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn test_write_log_records_paths() -> anyhow::Result<()> {
        let io = MemIo::default();
        io.write_all(Path::new("/proc/sys/x"), b"1")?;
        assert_eq!(io.written_paths(), vec![PathBuf::from("/proc/sys/x")]);
        Ok(())
    }
}
