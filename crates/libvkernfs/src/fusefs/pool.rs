//! FUSE server pool: one mounted session per container.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use fuser::MountOption;

use crate::error::VkernError;
use crate::fusefs::server::VkernFs;
use crate::handlers::HandlerRegistry;
use crate::nsenter::NsExec;
use crate::state::{Container, ContainerStore, ServerPool};
use crate::sysio::FsIo;
use crate::Result;

pub const DEFAULT_MOUNTPOINT_ROOT: &str = "/var/lib/vkernfs";

struct ServerHandle {
    session: fuser::BackgroundSession,
    ready: Arc<AtomicBool>,
    mountpoint: PathBuf,
}

pub struct FusePool {
    registry: Arc<HandlerRegistry>,
    io: Arc<dyn FsIo>,
    nsexec: Arc<dyn NsExec>,
    mountpoint_root: PathBuf,
    ttl: Duration,
    /// Bound after construction; the store owns the pool, so the pool only
    /// keeps a weak back-reference (arena-and-index, no cycle).
    store: RwLock<Weak<ContainerStore>>,
    servers: Mutex<HashMap<String, ServerHandle>>,
}

impl FusePool {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        io: Arc<dyn FsIo>,
        nsexec: Arc<dyn NsExec>,
        mountpoint_root: impl Into<PathBuf>,
        ttl: Duration,
    ) -> Self {
        FusePool {
            registry,
            io,
            nsexec,
            mountpoint_root: mountpoint_root.into(),
            ttl,
            store: RwLock::new(Weak::new()),
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Wires the pool to the store that owns it. Must run before the first
    /// pre-register.
    pub fn bind_store(&self, store: &Arc<ContainerStore>) {
        *self.store.write().unwrap() = Arc::downgrade(store);
    }

    pub fn mountpoint_for(&self, id: &str) -> PathBuf {
        self.mountpoint_root.join(id)
    }

    pub fn server_count(&self) -> usize {
        self.servers.lock().unwrap().len()
    }
}

impl ServerPool for FusePool {
    fn create_server(&self, cntr: &Arc<Container>, state_of: &Arc<Container>) -> Result<()> {
        let mountpoint = self.mountpoint_for(cntr.id());
        self.io.mkdir_all(&mountpoint)?;

        // Pod members share their data store already (the store re-pointed
        // it at pre-register); nothing server-side depends on which member
        // the request resolves to.
        if !Arc::ptr_eq(cntr, state_of) {
            tracing::debug!(
                id = cntr.id(),
                state_of = state_of.id(),
                "fuse server shares pod state"
            );
        }

        let ready = Arc::new(AtomicBool::new(false));
        let fs = VkernFs::new(
            self.store.read().unwrap().clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.io),
            Arc::clone(&self.nsexec),
            self.ttl,
            Arc::clone(&ready),
        );
        let options = [
            MountOption::FSName("vkernfs".to_string()),
            MountOption::AllowOther,
            MountOption::DefaultPermissions,
        ];
        let session = fuser::spawn_mount2(fs, &mountpoint, &options).map_err(|err| {
            VkernError::Internal(format!(
                "fuse mount at {} failed: {err}",
                mountpoint.display()
            ))
        })?;

        self.servers.lock().unwrap().insert(
            cntr.id().to_string(),
            ServerHandle {
                session,
                ready,
                mountpoint,
            },
        );
        tracing::info!(id = cntr.id(), "fuse server mounted");
        Ok(())
    }

    fn registration_complete(&self, id: &str) -> Result<()> {
        let servers = self.servers.lock().unwrap();
        let handle = servers
            .get(id)
            .ok_or_else(|| VkernError::NotFound(format!("fuse server for {id}")))?;
        handle.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Dropping the background session unmounts the kernel FUSE mount;
    /// outstanding requests fail with EIO, which is exactly what unregister
    /// needs to avoid blocking on in-flight operations.
    fn destroy_server(&self, id: &str) -> Result<()> {
        let handle = self
            .servers
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| VkernError::NotFound(format!("fuse server for {id}")))?;
        drop(handle.session);
        if let Err(err) = self.io.remove(&handle.mountpoint) {
            tracing::debug!(id, "mountpoint cleanup failed: {err}");
        }
        tracing::info!(id, "fuse server destroyed");
        Ok(())
    }
}

/// The daemon cannot run without kernel FUSE (the mount itself and the
/// invalidation support both come from it). Called once at startup; failure
/// is fatal.
pub fn ensure_fuse_support(io: &dyn FsIo) -> Result<()> {
    let filesystems = io.read_to_vec(Path::new("/proc/filesystems"))?;
    let text = String::from_utf8_lossy(&filesystems);
    if text.lines().any(|l| l.trim().ends_with("fuse")) {
        return Ok(());
    }
    Err(VkernError::Internal(
        "kernel lacks FUSE support (no fuse entry in /proc/filesystems)".into(),
    ))
}
