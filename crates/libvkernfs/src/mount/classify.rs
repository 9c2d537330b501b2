//! Pure predicates over parsed mount tables.
//!
//! Everything here is a function of the indexed snapshot data plus the
//! container's declared proc path lists; no I/O.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::mount::entry::MountEntry;
use crate::mount::parser::MountSnapshot;

/// Submount locations the daemon itself manages under a proc base mount.
/// Matches the emulated resources plus the paths container runtimes
/// conventionally bind read-only or mask.
pub static PROC_SUBMOUNT_PREFIXES: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    [
        "/proc/acpi",
        "/proc/bus",
        "/proc/cpuinfo",
        "/proc/devices",
        "/proc/fs",
        "/proc/irq",
        "/proc/kcore",
        "/proc/keys",
        "/proc/loadavg",
        "/proc/meminfo",
        "/proc/scsi",
        "/proc/stat",
        "/proc/swaps",
        "/proc/sys",
        "/proc/sysrq-trigger",
        "/proc/timer_list",
        "/proc/uptime",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
});

/// Same for sysfs base mounts.
pub static SYS_SUBMOUNT_PREFIXES: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    [
        "/sys/devices/virtual",
        "/sys/firmware",
        "/sys/fs/cgroup",
        "/sys/kernel",
        "/sys/module/nf_conntrack/parameters",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
});

/// The container's declared read-only and masked proc paths, threaded into
/// the predicates so they stay pure.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcPathSets<'a> {
    pub ro: &'a [PathBuf],
    pub mask: &'a [PathBuf],
}

/// A base mount is a proc or sysfs mount of the filesystem root, as set up
/// by the runtime at container start.
pub fn is_base_mount(entry: &MountEntry) -> bool {
    (entry.fs_type == "proc" || entry.fs_type == "sysfs") && entry.root == "/"
}

/// True when `child` hangs directly off `base` at a location the daemon
/// recognizes: the built-in prefix lists, plus (for proc) the container's
/// read-only and masked paths. Matching is by mountpoint path suffix.
pub fn is_submount_of(
    child: &MountEntry,
    base: &MountEntry,
    paths: ProcPathSets<'_>,
) -> bool {
    if child.parent_id != base.mount_id {
        return false;
    }
    let rel = match child.mountpoint.strip_prefix(&base.mountpoint) {
        Ok(rel) => rel,
        Err(_) => return false,
    };
    match base.fs_type.as_str() {
        "proc" => {
            let candidate = Path::new("/proc").join(rel);
            in_prefix_set(&candidate, &PROC_SUBMOUNT_PREFIXES)
                || in_prefix_set(&candidate, paths.ro)
                || in_prefix_set(&candidate, paths.mask)
        }
        "sysfs" => {
            let candidate = Path::new("/sys").join(rel);
            in_prefix_set(&candidate, &SYS_SUBMOUNT_PREFIXES)
        }
        _ => false,
    }
}

/// True when the entry's parent exists, is a base mount, and the entry is a
/// recognized submount of it.
pub fn is_submount(snap: &MountSnapshot, entry: &MountEntry, paths: ProcPathSets<'_>) -> bool {
    match snap.parent_of(entry) {
        Some(parent) => is_base_mount(parent) && is_submount_of(entry, parent, paths),
        None => false,
    }
}

pub fn is_ro_mount(entry: &MountEntry) -> bool {
    entry.is_read_only()
}

/// A recursive bind carries a copy of itself mounted on top: same device,
/// same root and source, parented on this entry.
pub fn is_recursive_bind_mount(snap: &MountSnapshot, entry: &MountEntry) -> bool {
    snap.entries_by_dev(&entry.dev).iter().any(|other| {
        other.parent_id == entry.mount_id
            && other.root == entry.root
            && other.source == entry.source
    })
}

pub fn is_bind_mount(snap: &MountSnapshot, entry: &MountEntry) -> bool {
    bind_peer(snap, entry, false)
}

pub fn is_ro_bind_mount(snap: &MountSnapshot, entry: &MountEntry) -> bool {
    bind_peer(snap, entry, true)
}

fn bind_peer(snap: &MountSnapshot, entry: &MountEntry, want_ro: bool) -> bool {
    snap.entries_by_dev(&entry.dev).iter().any(|other| {
        other.mount_id != entry.mount_id
            && other.root == entry.root
            && other.source == entry.source
            && (!want_ro || other.is_read_only())
    })
}

/// A mount stacked on its parent with identical root, mountpoint and source.
pub fn is_self_mount(snap: &MountSnapshot, entry: &MountEntry) -> bool {
    match snap.parent_of(entry) {
        Some(parent) => {
            parent.root == entry.root
                && parent.mountpoint == entry.mountpoint
                && parent.source == entry.source
        }
        None => false,
    }
}

/// A mount sharing only its mountpoint with its parent.
pub fn is_overlap_mount(snap: &MountSnapshot, entry: &MountEntry) -> bool {
    match snap.parent_of(entry) {
        Some(parent) => parent.mountpoint == entry.mountpoint,
        None => false,
    }
}

/// Structural equality with an entry in a *different* mount namespace: same
/// device, root, source, flags (`ro` ignored when `ignore_ro`), same
/// mountpoint inode, and matching ancestry up to a base mount.
pub fn is_clone_mount(
    snap: &MountSnapshot,
    entry: &MountEntry,
    other_snap: &MountSnapshot,
    other: &MountEntry,
    ignore_ro: bool,
) -> bool {
    if entry.dev != other.dev || entry.root != other.root || entry.source != other.source {
        return false;
    }
    if !flags_match(entry, other, ignore_ro) {
        return false;
    }
    if entry.mountpoint_ino.is_none() || entry.mountpoint_ino != other.mountpoint_ino {
        return false;
    }
    ancestry_line_match(
        snap,
        snap.parent_of(entry),
        other_snap,
        other_snap.parent_of(other),
    )
}

fn flags_match(a: &MountEntry, b: &MountEntry, ignore_ro: bool) -> bool {
    if ignore_ro {
        a.options_minus_rw() == b.options_minus_rw()
    } else {
        a.options == b.options
    }
}

/// Walks both parent chains in parallel. Base mounts are stepped past on
/// either side; at every remaining step mountpoint inode, root, source and
/// flags-minus-ro must agree. Running out of ancestors on either side is a
/// match.
pub fn ancestry_line_match<'a>(
    snap_a: &'a MountSnapshot,
    mut a: Option<&'a MountEntry>,
    snap_b: &'a MountSnapshot,
    mut b: Option<&'a MountEntry>,
) -> bool {
    loop {
        while let Some(entry) = a {
            if is_base_mount(entry) {
                a = snap_a.parent_of(entry);
            } else {
                break;
            }
        }
        while let Some(entry) = b {
            if is_base_mount(entry) {
                b = snap_b.parent_of(entry);
            } else {
                break;
            }
        }
        let (ea, eb) = match (a, b) {
            (None, _) | (_, None) => return true,
            (Some(ea), Some(eb)) => (ea, eb),
        };
        if ea.mountpoint_ino != eb.mountpoint_ino
            || ea.root != eb.root
            || ea.source != eb.source
            || ea.options_minus_rw() != eb.options_minus_rw()
        {
            return false;
        }
        a = snap_a.parent_of(ea);
        b = snap_b.parent_of(eb);
    }
}

fn in_prefix_set(path: &Path, prefixes: &[PathBuf]) -> bool {
    prefixes.iter().any(|p| path.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
41 40 0:21 / / rw - ext4 /dev/sda1 rw
42 41 0:22 / /proc rw - proc proc rw
43 42 0:22 /bus /proc/bus ro - proc proc ro
44 41 0:23 / /sys rw - sysfs sysfs rw
45 44 0:23 /firmware /sys/firmware ro - sysfs sysfs ro
46 41 0:30 / /data rw - tmpfs tmpfs rw
47 41 0:30 / /data2 rw - tmpfs tmpfs rw
";

    fn snap() -> MountSnapshot {
        MountSnapshot::parse(TABLE.as_bytes()).unwrap()
    }

    fn entry(snap: &MountSnapshot, id: u32) -> &MountEntry {
        snap.lookup_by_id(id).unwrap()
    }

    // Scenario from the daemon's validation suite: a proc base mount with a
    // read-only /proc/bus submount.
    #[test]
    fn test_base_and_submount_classification() {
        let snap = snap();
        let paths = ProcPathSets::default();

        assert!(is_base_mount(entry(&snap, 42)));
        assert!(!is_base_mount(entry(&snap, 43)));
        assert!(is_submount_of(entry(&snap, 43), entry(&snap, 42), paths));
        assert!(is_ro_mount(entry(&snap, 43)));
        assert!(!is_bind_mount(&snap, entry(&snap, 43)));
        assert!(is_submount(&snap, entry(&snap, 43), paths));
    }

    #[test]
    fn test_submount_of_respects_container_paths() {
        let table = "\
42 41 0:22 / /proc rw - proc proc rw
48 42 0:22 /custom /proc/custom ro - proc proc ro
";
        let snap = MountSnapshot::parse(table.as_bytes()).unwrap();
        let base = snap.lookup_by_id(42).unwrap();
        let custom = snap.lookup_by_id(48).unwrap();

        assert!(!is_submount_of(custom, base, ProcPathSets::default()));

        let ro = vec![PathBuf::from("/proc/custom")];
        let paths = ProcPathSets { ro: &ro, mask: &[] };
        assert!(is_submount_of(custom, base, paths));
    }

    #[test]
    fn test_sysfs_submount_uses_sys_prefixes() {
        let snap = snap();
        assert!(is_submount_of(
            entry(&snap, 45),
            entry(&snap, 44),
            ProcPathSets::default()
        ));
    }

    #[test]
    fn test_bind_mount_needs_same_root_and_source() {
        let snap = snap();
        // 46 and 47 share dev, root and source.
        assert!(is_bind_mount(&snap, entry(&snap, 46)));
        assert!(!is_ro_bind_mount(&snap, entry(&snap, 46)));
        // /proc/bus shares the device with /proc but not the root.
        assert!(!is_bind_mount(&snap, entry(&snap, 43)));
    }

    #[test]
    fn test_recursive_bind_mount() {
        let table = "\
41 40 0:21 / / rw - ext4 /dev/sda1 rw
50 41 0:30 / /mnt rw - tmpfs tmpfs rw
51 50 0:30 / /mnt rw - tmpfs tmpfs rw
";
        let snap = MountSnapshot::parse(table.as_bytes()).unwrap();
        let lower = snap.lookup_by_id(50).unwrap();
        let upper = snap.lookup_by_id(51).unwrap();
        assert!(is_recursive_bind_mount(&snap, lower));
        assert!(!is_recursive_bind_mount(&snap, upper));
        assert!(is_self_mount(&snap, upper));
        assert!(is_overlap_mount(&snap, upper));
    }

    #[test]
    fn test_clone_mount_across_namespaces() {
        let table_ns1 = "\
41 40 0:21 / / rw - ext4 /dev/sda1 rw
60 41 0:40 / /work rw - tmpfs tmpfs rw
";
        let table_ns2 = "\
81 80 0:21 / / rw - ext4 /dev/sda1 rw
90 81 0:40 / /work rw - tmpfs tmpfs rw
";
        let mut ns1 = MountSnapshot::parse(table_ns1.as_bytes()).unwrap();
        let mut ns2 = MountSnapshot::parse(table_ns2.as_bytes()).unwrap();
        set_ino(&mut ns1, 41, 2);
        set_ino(&mut ns1, 60, 77);
        set_ino(&mut ns2, 81, 2);
        set_ino(&mut ns2, 90, 77);

        let a = ns1.lookup_by_id(60).unwrap();
        let b = ns2.lookup_by_id(90).unwrap();
        assert!(is_clone_mount(&ns1, a, &ns2, b, false));
    }

    #[test]
    fn test_clone_mount_ro_modulo() {
        let table_ns1 = "60 41 0:40 / /work rw - tmpfs tmpfs rw\n";
        let table_ns2 = "90 81 0:40 / /work ro - tmpfs tmpfs rw\n";
        let mut ns1 = MountSnapshot::parse(table_ns1.as_bytes()).unwrap();
        let mut ns2 = MountSnapshot::parse(table_ns2.as_bytes()).unwrap();
        set_ino(&mut ns1, 60, 77);
        set_ino(&mut ns2, 90, 77);

        let a = ns1.lookup_by_id(60).unwrap();
        let b = ns2.lookup_by_id(90).unwrap();
        assert!(!is_clone_mount(&ns1, a, &ns2, b, false));
        assert!(is_clone_mount(&ns1, a, &ns2, b, true));
    }

    #[test]
    fn test_clone_mount_requires_matching_inode() {
        let table = "60 41 0:40 / /work rw - tmpfs tmpfs rw\n";
        let mut ns1 = MountSnapshot::parse(table.as_bytes()).unwrap();
        let mut ns2 = MountSnapshot::parse(table.as_bytes()).unwrap();
        set_ino(&mut ns1, 60, 77);
        set_ino(&mut ns2, 60, 78);
        let a = ns1.lookup_by_id(60).unwrap();
        let b = ns2.lookup_by_id(60).unwrap();
        assert!(!is_clone_mount(&ns1, a, &ns2, b, false));
    }

    #[test]
    fn test_ancestry_skips_base_mounts() {
        // ns1 parent chain: work -> /proc (base) -> /
        // ns2 parent chain: work -> /
        let table_ns1 = "\
41 40 0:21 / / rw - ext4 /dev/sda1 rw
42 41 0:22 / /proc rw - proc proc rw
60 42 0:40 / /proc/work rw - tmpfs tmpfs rw
";
        let table_ns2 = "\
81 80 0:21 / / rw - ext4 /dev/sda1 rw
90 81 0:40 / /work rw - tmpfs tmpfs rw
";
        let mut ns1 = MountSnapshot::parse(table_ns1.as_bytes()).unwrap();
        let mut ns2 = MountSnapshot::parse(table_ns2.as_bytes()).unwrap();
        set_ino(&mut ns1, 41, 2);
        set_ino(&mut ns1, 60, 77);
        set_ino(&mut ns2, 81, 2);
        set_ino(&mut ns2, 90, 77);

        let a = ns1.lookup_by_id(60).unwrap();
        let b = ns2.lookup_by_id(90).unwrap();
        assert!(is_clone_mount(&ns1, a, &ns2, b, false));
    }

    fn set_ino(snap: &mut MountSnapshot, id: u32, ino: u64) {
        let idx = snap
            .entries()
            .iter()
            .position(|e| e.mount_id == id)
            .unwrap();
        snap.set_mountpoint_ino(idx, ino);
    }
}
