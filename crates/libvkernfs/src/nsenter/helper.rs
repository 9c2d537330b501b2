//! Helper-process side of the executor.
//!
//! Runs inside the re-exec'd `vkernfsd nsenter` child with the event channel
//! inherited on [`HELPER_FD`]. Attaches to the requested namespaces of the
//! target pid, performs the request, writes the response and exits. Errors
//! after the channel is up are reported as response records; the parent is
//! never left to infer them from an exit code.

use std::fs::File;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use nix::sched::setns;
use nix::unistd::Pid;

use crate::nsenter::channel::EventChannel;
use crate::nsenter::message::{HelperRequest, NsRequest, NsResponse, RemoteError};

/// Fd the daemon places the event channel on before exec.
pub const HELPER_FD: RawFd = 3;

/// Entry point for the `nsenter` subcommand. Returns the process exit code.
pub fn run(fd: RawFd) -> i32 {
    let channel = unsafe { EventChannel::from_raw(fd) };
    let request: HelperRequest = match channel.recv() {
        Ok(req) => req,
        Err(err) => {
            tracing::warn!("nsenter helper got no request: {err}");
            return 1;
        }
    };

    let response = match enter_namespaces(&request) {
        Ok(()) => perform(&request.request),
        Err(err) => NsResponse::Error(err),
    };

    if let Err(err) = channel.send(&response) {
        tracing::warn!("nsenter helper failed to respond: {err}");
        return 1;
    }

    // Sleep events ack first, then hold the process so the caller can pivot
    // further events onto this pid's namespaces.
    if let (NsRequest::Sleep { seconds }, NsResponse::Ack) = (&request.request, &response) {
        std::thread::sleep(std::time::Duration::from_secs(*seconds));
    }
    0
}

fn enter_namespaces(request: &HelperRequest) -> Result<(), RemoteError> {
    let pid = Pid::from_raw(request.target_pid);
    for kind in request.namespaces.ordered() {
        let path = crate::process::ns_path(pid, kind.proc_name());
        let ns_file = File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => RemoteError::TargetGone(request.target_pid),
            std::io::ErrorKind::PermissionDenied => RemoteError::Permission(request.target_pid),
            _ => RemoteError::Io(format!("open {}: {err}", path.display())),
        })?;
        setns(&ns_file, kind.clone_flag()).map_err(|errno| match errno {
            nix::Error::ESRCH | nix::Error::ENOENT => RemoteError::TargetGone(request.target_pid),
            nix::Error::EPERM | nix::Error::EACCES => RemoteError::Permission(request.target_pid),
            other => RemoteError::Io(format!("setns {}: {other}", path.display())),
        })?;
    }
    Ok(())
}

fn perform(request: &NsRequest) -> NsResponse {
    match request {
        NsRequest::MountInfo => read_file(Path::new("/proc/self/mountinfo")),
        NsRequest::MountInodes { paths } => NsResponse::Inodes(stat_inodes(paths)),
        NsRequest::ReadFile { path } => read_file(path),
        NsRequest::WriteFile { path, data } => match std::fs::write(path, data) {
            Ok(()) => NsResponse::Ack,
            Err(err) => NsResponse::Error(io_error(path, err)),
        },
        NsRequest::Sleep { .. } => NsResponse::Ack,
    }
}

fn read_file(path: &Path) -> NsResponse {
    match std::fs::read(path) {
        Ok(data) => NsResponse::FileData(data),
        Err(err) => NsResponse::Error(io_error(path, err)),
    }
}

fn stat_inodes(paths: &[PathBuf]) -> Vec<Option<u64>> {
    paths
        .iter()
        .map(|p| nix::sys::stat::stat(p.as_path()).ok().map(|st| st.st_ino))
        .collect()
}

fn io_error(path: &Path, err: std::io::Error) -> RemoteError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => RemoteError::Permission(0),
        _ => RemoteError::Io(format!("{}: {err}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_inodes_marks_missing_paths() {
        let inodes = stat_inodes(&[PathBuf::from("/"), PathBuf::from("/definitely/not/here")]);
        assert_eq!(inodes.len(), 2);
        assert!(inodes[0].is_some());
        assert!(inodes[1].is_none());
    }

    #[test]
    fn test_perform_read_of_missing_file_reports_error() {
        let resp = perform(&NsRequest::ReadFile {
            path: PathBuf::from("/definitely/not/here"),
        });
        assert!(matches!(resp, NsResponse::Error(RemoteError::Io(_))));
    }
}
