//! Host-backed IO: thin delegation to the operating system.

use std::any::Any;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::fcntl::OFlag;

use crate::error::{from_io, VkernError};
use crate::sysio::{DirEntryInfo, FileKind, FileStatus, FsIo, IoFile};
use crate::Result;

pub struct HostIo;

struct HostFile {
    file: File,
}

impl IoFile for HostFile {
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(data.len())
    }

    fn seek_start(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

fn kind_of(ft: std::fs::FileType) -> FileKind {
    if ft.is_dir() {
        FileKind::Dir
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_file() || ft.is_char_device() || ft.is_block_device() {
        // Pseudo-files under /proc stat as regular or character devices
        // depending on the kernel; both read like files here.
        FileKind::File
    } else {
        FileKind::Other
    }
}

impl FsIo for HostIo {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn open(&self, path: &Path, flags: OFlag, mode: u32) -> Result<Box<dyn IoFile>> {
        let mut opts = OpenOptions::new();
        let acc = flags & OFlag::O_ACCMODE;
        opts.read(acc == OFlag::O_RDONLY || acc == OFlag::O_RDWR)
            .write(acc == OFlag::O_WRONLY || acc == OFlag::O_RDWR)
            .append(flags.contains(OFlag::O_APPEND))
            .create(flags.contains(OFlag::O_CREAT))
            .truncate(flags.contains(OFlag::O_TRUNC))
            .mode(mode);
        let file = opts
            .open(path)
            .map_err(|e| from_io(e, &path.to_path_buf()))?;
        Ok(Box::new(HostFile { file }))
    }

    fn read_to_vec(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| from_io(e, &path.to_path_buf()))
    }

    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        fs::write(path, data).map_err(|e| from_io(e, &path.to_path_buf()))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| from_io(e, &path.to_path_buf()))? {
            let entry = entry?;
            let kind = entry.file_type().map(kind_of).unwrap_or(FileKind::Other);
            entries.push(DirEntryInfo {
                name: entry.file_name(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> Result<FileStatus> {
        let meta = fs::metadata(path).map_err(|e| from_io(e, &path.to_path_buf()))?;
        Ok(FileStatus {
            kind: kind_of(meta.file_type()),
            size: meta.len(),
            mode: meta.permissions().mode(),
            ino: meta.ino(),
        })
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| from_io(e, &path.to_path_buf()))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(path).map_err(|e| from_io(e, &path.to_path_buf()))?;
        if meta.is_dir() {
            fs::remove_dir(path).map_err(|e| from_io(e, &path.to_path_buf()))
        } else {
            fs::remove_file(path).map_err(|e| from_io(e, &path.to_path_buf()))
        }
    }

    fn remove_all(&self, path: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(path).map_err(|e| from_io(e, &path.to_path_buf()))?;
        if meta.is_dir() {
            fs::remove_dir_all(path).map_err(|e| from_io(e, &path.to_path_buf()))
        } else {
            fs::remove_file(path).map_err(|e| from_io(e, &path.to_path_buf()))
        }
    }

    fn read_link(&self, path: &Path) -> Result<std::path::PathBuf> {
        fs::read_link(path).map_err(|e| from_io(e, &path.to_path_buf()))
    }

    fn ns_inode(&self, path: &Path) -> Result<u64> {
        let st = nix::sys::stat::stat(path).map_err(VkernError::from)?;
        Ok(st.st_ino)
    }
}
