//! Daemon wiring: build the capability bundle once, hand it to the store
//! and the pool, then serve the control plane until told to stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use libvkernfs::fusefs::{ensure_fuse_support, FusePool};
use libvkernfs::handlers::HandlerRegistry;
use libvkernfs::ipc::ControlServer;
use libvkernfs::nsenter::Executor;
use libvkernfs::state::{ContainerStore, ServerPool};
use libvkernfs::sysio::{FsIo, HostIo};

use crate::Opts;

pub fn run(opts: &Opts) -> Result<()> {
    let io: Arc<dyn FsIo> = Arc::new(HostIo);

    // Cannot serve anything without kernel FUSE; bail before touching state.
    ensure_fuse_support(io.as_ref()).context("fuse support check failed")?;
    io.mkdir_all(&opts.mountpoint)
        .with_context(|| format!("cannot create mountpoint root {}", opts.mountpoint.display()))?;

    let registry = Arc::new(HandlerRegistry::with_default_handlers());
    let nsexec = Arc::new(Executor::default());
    let pool = Arc::new(FusePool::new(
        Arc::clone(&registry),
        Arc::clone(&io),
        nsexec,
        opts.mountpoint.clone(),
        Duration::from_secs(opts.dentry_cache_timeout * 60),
    ));
    let store = Arc::new(ContainerStore::new(
        Arc::clone(&io),
        Arc::clone(&pool) as Arc<dyn ServerPool>,
    ));
    pool.bind_store(&store);

    let control = ControlServer::bind(&opts.listen)
        .with_context(|| format!("cannot bind control socket {}", opts.listen.display()))?;

    // Blocks for the life of the daemon; FUSE sessions run on their own
    // threads inside the pool.
    control.run(store).context("control plane failed")?;
    Ok(())
}
