//! Validation rules for trapped `mount`/`umount` syscalls.
//!
//! The seccomp front-end decodes the syscall and asks these functions
//! whether the operation may proceed. All rules are derived from the
//! classifier predicates over a fresh snapshot of the caller's mount table.

use std::path::Path;

use crate::error::VkernError;
use crate::mount::classify::{self, ProcPathSets};
use crate::mount::parser::MountSnapshot;
use crate::Result;

/// Unmounting a managed base mount would expose the host's kernel view of
/// proc or sysfs; a stacked identical mount keeps the view covered, so
/// removing the top of such a stack is harmless.
pub fn check_umount(snap: &MountSnapshot, paths: ProcPathSets<'_>, target: &Path) -> Result<()> {
    let entry = snap
        .lookup_by_mountpoint(target)
        .ok_or_else(|| VkernError::not_found_path(target))?;

    if classify::is_base_mount(entry) {
        if classify::is_self_mount(snap, entry) {
            return Ok(());
        }
        return Err(VkernError::PermissionDenied(format!(
            "unmount of {} would expose the host view",
            target.display()
        )));
    }

    if classify::is_submount(snap, entry, paths) {
        return Err(VkernError::PermissionDenied(format!(
            "unmount of managed submount {}",
            target.display()
        )));
    }

    Ok(())
}

/// Remounting a managed read-only submount read-write is denied; everything
/// else passes.
pub fn check_remount(
    snap: &MountSnapshot,
    paths: ProcPathSets<'_>,
    target: &Path,
    read_write: bool,
) -> Result<()> {
    let entry = snap
        .lookup_by_mountpoint(target)
        .ok_or_else(|| VkernError::not_found_path(target))?;

    if read_write
        && classify::is_submount(snap, entry, paths)
        && paths.ro.iter().any(|p| p == target)
    {
        return Err(VkernError::PermissionDenied(format!(
            "read-write remount of read-only path {}",
            target.display()
        )));
    }

    Ok(())
}

/// A new mount must not shadow a managed submount: mounting at or above one
/// hides the emulated view beneath it.
pub fn check_new_mount(snap: &MountSnapshot, paths: ProcPathSets<'_>, target: &Path) -> Result<()> {
    for entry in snap.entries() {
        if classify::is_submount(snap, entry, paths) && entry.mountpoint.starts_with(target) {
            return Err(VkernError::PermissionDenied(format!(
                "mount at {} would shadow managed submount {}",
                target.display(),
                entry.mountpoint.display()
            )));
        }
    }
    Ok(())
}
