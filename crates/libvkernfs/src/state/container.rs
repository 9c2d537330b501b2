//! Container record and its per-container emulated state.

use std::collections::HashMap;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// Registration payload delivered by the runtime over the control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub init_pid: i32,
    pub ctime: DateTime<Utc>,
    pub uid_first: u32,
    pub uid_size: u32,
    pub gid_first: u32,
    pub gid_size: u32,
    #[serde(default)]
    pub proc_ro_paths: Vec<PathBuf>,
    #[serde(default)]
    pub proc_mask_paths: Vec<PathBuf>,
    #[serde(default)]
    pub netns_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub(crate) struct ContainerFields {
    pub init_pid: Option<Pid>,
    pub pid_fd: Option<OwnedFd>,
    pub ctime: Option<DateTime<Utc>>,
    pub uid_first: u32,
    pub uid_size: u32,
    pub gid_first: u32,
    pub gid_size: u32,
    pub ro_paths: Vec<PathBuf>,
    pub mask_paths: Vec<PathBuf>,
    pub user_ns_inode: u64,
    pub net_ns_inode: u64,
    pub root_ino: u64,
    pub reg_completed: bool,
}

/// One live container. Field access goes through the internal lock; the
/// separate API lock serializes multi-step lifecycle transitions so partial
/// registrations are never observable.
pub struct Container {
    id: String,
    fields: Mutex<ContainerFields>,
    /// Emulated resource values, keyed by resource path. Shared between all
    /// containers of a pod (same net namespace), so it sits behind its own
    /// Arc and can be re-pointed at pre-register time.
    data: Mutex<Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>>,
    api_lock: Mutex<()>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").field("id", &self.id).finish()
    }
}

impl Container {
    pub fn new(id: impl Into<String>) -> Arc<Container> {
        Arc::new(Container {
            id: id.into(),
            fields: Mutex::new(ContainerFields::default()),
            data: Mutex::new(Arc::new(Mutex::new(HashMap::new()))),
            api_lock: Mutex::new(()),
        })
    }

    /// Factory with the registration fields already merged. No store side
    /// effects; the caller registers the result explicitly.
    pub fn create(id: impl Into<String>, record: &RegistrationRecord) -> Arc<Container> {
        let cntr = Container::new(id);
        cntr.merge_record(record);
        cntr
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn lock_fields(&self) -> MutexGuard<'_, ContainerFields> {
        self.fields.lock().unwrap()
    }

    pub(crate) fn lock_api(&self) -> MutexGuard<'_, ()> {
        self.api_lock.lock().unwrap()
    }

    pub(crate) fn merge_record(&self, record: &RegistrationRecord) {
        let mut fields = self.lock_fields();
        fields.init_pid = Some(Pid::from_raw(record.init_pid));
        fields.ctime = Some(record.ctime);
        fields.uid_first = record.uid_first;
        fields.uid_size = record.uid_size;
        fields.gid_first = record.gid_first;
        fields.gid_size = record.gid_size;
        fields.ro_paths = record.proc_ro_paths.clone();
        fields.mask_paths = record.proc_mask_paths.clone();
    }

    pub fn init_pid(&self) -> Option<Pid> {
        self.lock_fields().init_pid
    }

    pub fn ctime(&self) -> Option<DateTime<Utc>> {
        self.lock_fields().ctime
    }

    pub fn uid_range(&self) -> (u32, u32) {
        let fields = self.lock_fields();
        (fields.uid_first, fields.uid_size)
    }

    pub fn gid_range(&self) -> (u32, u32) {
        let fields = self.lock_fields();
        (fields.gid_first, fields.gid_size)
    }

    pub fn ro_paths(&self) -> Vec<PathBuf> {
        self.lock_fields().ro_paths.clone()
    }

    pub fn mask_paths(&self) -> Vec<PathBuf> {
        self.lock_fields().mask_paths.clone()
    }

    pub fn is_ro_path(&self, path: &Path) -> bool {
        self.lock_fields().ro_paths.iter().any(|p| p == path)
    }

    pub fn is_mask_path(&self, path: &Path) -> bool {
        self.lock_fields().mask_paths.iter().any(|p| p == path)
    }

    pub fn net_ns_inode(&self) -> u64 {
        self.lock_fields().net_ns_inode
    }

    pub(crate) fn set_net_ns_inode(&self, inode: u64) {
        self.lock_fields().net_ns_inode = inode;
    }

    pub fn user_ns_inode(&self) -> u64 {
        self.lock_fields().user_ns_inode
    }

    pub(crate) fn set_user_ns_inode(&self, inode: u64) {
        self.lock_fields().user_ns_inode = inode;
    }

    /// Inode of the init process's root directory, captured at registration.
    pub fn root_ino(&self) -> u64 {
        self.lock_fields().root_ino
    }

    pub(crate) fn set_root_ino(&self, ino: u64) {
        self.lock_fields().root_ino = ino;
    }

    pub fn reg_completed(&self) -> bool {
        self.lock_fields().reg_completed
    }

    pub(crate) fn set_reg_completed(&self) {
        self.lock_fields().reg_completed = true;
    }

    /// Seconds since container creation, for uptime-style resources.
    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        let ctime = self.ctime()?;
        let delta = now.signed_duration_since(ctime).num_seconds();
        Some(delta.max(0) as u64)
    }

    // Data store access. Values are opaque blobs owned by the handlers.

    pub fn data_read(&self, path: &Path) -> Option<Vec<u8>> {
        let data = self.data.lock().unwrap();
        let store = data.lock().unwrap();
        store.get(path).cloned()
    }

    pub fn data_write(&self, path: impl Into<PathBuf>, value: impl Into<Vec<u8>>) {
        let data = self.data.lock().unwrap();
        let mut store = data.lock().unwrap();
        store.insert(path.into(), value.into());
    }

    pub fn data_remove(&self, path: &Path) {
        let data = self.data.lock().unwrap();
        let mut store = data.lock().unwrap();
        store.remove(path);
    }

    /// Re-points this container's data store at `other`'s, making the two
    /// containers (and any later joiners) observe the same emulated values.
    pub(crate) fn share_data_with(&self, other: &Container) {
        let shared = other.data.lock().unwrap().clone();
        *self.data.lock().unwrap() = shared;
    }

    pub fn shares_data_with(&self, other: &Container) -> bool {
        Arc::ptr_eq(&self.data.lock().unwrap(), &other.data.lock().unwrap())
    }

    /// Opens a pidfd on the init process so a recycled pid can never be
    /// mistaken for the container. Returns false when the kernel lacks
    /// pidfd_open or the process is already gone; the store keeps working
    /// without the guard.
    pub(crate) fn acquire_pid_fd(&self) -> bool {
        let mut fields = self.lock_fields();
        let Some(pid) = fields.init_pid else {
            return false;
        };
        // Replacing an old fd on re-registration drops it here.
        fields.pid_fd = None;
        match pidfd_open(pid) {
            Ok(fd) => {
                fields.pid_fd = Some(fd);
                true
            }
            Err(err) => {
                tracing::debug!(pid = pid.as_raw(), "pidfd_open unavailable: {err}");
                false
            }
        }
    }

    pub(crate) fn release_pid_fd(&self) {
        self.lock_fields().pid_fd = None;
    }

    pub fn has_pid_fd(&self) -> bool {
        self.lock_fields().pid_fd.is_some()
    }
}

fn pidfd_open(pid: Pid) -> std::io::Result<OwnedFd> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(init_pid: i32) -> RegistrationRecord {
        RegistrationRecord {
            init_pid,
            ctime: Utc::now(),
            uid_first: 165536,
            uid_size: 65536,
            gid_first: 165536,
            gid_size: 65536,
            proc_ro_paths: vec![PathBuf::from("/proc/bus")],
            proc_mask_paths: vec![PathBuf::from("/proc/keys")],
            netns_path: None,
        }
    }

    #[test]
    fn test_create_merges_record() {
        let cntr = Container::create("c1", &record(1000));
        assert_eq!(cntr.init_pid(), Some(Pid::from_raw(1000)));
        assert_eq!(cntr.uid_range(), (165536, 65536));
        assert!(cntr.is_ro_path(Path::new("/proc/bus")));
        assert!(cntr.is_mask_path(Path::new("/proc/keys")));
        assert!(!cntr.is_mask_path(Path::new("/proc/kcore")));
        assert!(!cntr.reg_completed());
    }

    #[test]
    fn test_data_store_roundtrip() {
        let cntr = Container::new("c1");
        let path = Path::new("/proc/cpuinfo");
        assert!(cntr.data_read(path).is_none());
        cntr.data_write(path, b"rendered".to_vec());
        assert_eq!(cntr.data_read(path).unwrap(), b"rendered");
        cntr.data_remove(path);
        assert!(cntr.data_read(path).is_none());
    }

    #[test]
    fn test_shared_data_is_visible_across_containers() {
        let c1 = Container::new("c1");
        let c2 = Container::new("c2");
        assert!(!c2.shares_data_with(&c1));

        c2.share_data_with(&c1);
        assert!(c2.shares_data_with(&c1));

        c1.data_write("/proc/sys/net/ipv6/conf/all/disable_ipv6", b"1".to_vec());
        assert_eq!(
            c2.data_read(Path::new("/proc/sys/net/ipv6/conf/all/disable_ipv6"))
                .unwrap(),
            b"1"
        );
    }

    #[test]
    fn test_uptime_seconds_from_ctime() {
        let cntr = Container::new("c1");
        let t0 = Utc::now();
        cntr.merge_record(&RegistrationRecord {
            ctime: t0,
            ..record(1)
        });
        let now = t0 + chrono::Duration::seconds(5);
        assert_eq!(cntr.uptime_seconds(now), Some(5));
        // A clock that moved backwards clamps to zero.
        assert_eq!(cntr.uptime_seconds(t0 - chrono::Duration::seconds(3)), Some(0));
    }

    #[test]
    fn test_acquire_pid_fd_on_missing_process() {
        let cntr = Container::create("c1", &record(i32::MAX - 1));
        // The pid does not exist, so the guard cannot be taken; the
        // container stays usable.
        assert!(!cntr.acquire_pid_fd());
        assert!(!cntr.has_pid_fd());
    }

    #[test]
    fn test_acquire_pid_fd_on_live_process() {
        let cntr = Container::create("self", &record(std::process::id() as i32));
        if cntr.acquire_pid_fd() {
            assert!(cntr.has_pid_fd());
            cntr.release_pid_fd();
            assert!(!cntr.has_pid_fd());
        }
    }
}
