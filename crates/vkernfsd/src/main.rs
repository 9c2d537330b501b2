//! # vkernfsd
//! FUSE daemon that virtualizes portions of `/proc` and `/sys` for system
//! containers. A container runtime drives it over the control socket; the
//! same binary re-executes itself as the namespace-enter helper.
mod daemon;
mod observability;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use libvkernfs::fusefs::pool::DEFAULT_MOUNTPOINT_ROOT;
use libvkernfs::ipc::DEFAULT_SOCKET_PATH;
use libvkernfs::nsenter::helper;

#[derive(Parser, Debug)]
#[clap(version, about, author)]
pub struct Opts {
    /// Directory under which per-container FUSE mounts are created.
    #[clap(long, default_value = DEFAULT_MOUNTPOINT_ROOT)]
    mountpoint: PathBuf,

    /// Log file; stderr when omitted.
    #[clap(long)]
    log: Option<PathBuf>,

    /// debug | info | warning | error | fatal
    #[clap(long, default_value = "info")]
    log_level: String,

    /// text | json
    #[clap(long, default_value = "text")]
    log_format: String,

    /// Kernel dentry/attr cache timeout for served entries, in minutes.
    #[clap(long, default_value_t = 5)]
    dentry_cache_timeout: u64,

    /// Control-plane socket the runtime connects to.
    #[clap(long, default_value = DEFAULT_SOCKET_PATH)]
    listen: PathBuf,

    #[clap(subcommand)]
    subcmd: Option<SubCommand>,
}

#[derive(Parser, Debug)]
enum SubCommand {
    /// Internal: namespace-enter helper entry point. Expects the event
    /// channel on an inherited fd; never invoked by hand.
    #[clap(hide = true)]
    Nsenter,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Some(SubCommand::Nsenter) = opts.subcmd {
        // The helper runs with stdio detached; its only output is the
        // response record on the inherited channel.
        std::process::exit(helper::run(helper::HELPER_FD));
    }

    observability::init(&opts).context("failed to initialize logging")?;
    tracing::info!(
        mountpoint = %opts.mountpoint.display(),
        listen = %opts.listen.display(),
        "starting vkernfsd"
    );

    daemon::run(&opts)
}
