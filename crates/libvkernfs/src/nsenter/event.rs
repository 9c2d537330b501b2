//! Event lifecycle: launch a helper, exchange one request/response pair,
//! reap the helper.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use nix::unistd::Pid;

use crate::nsenter::channel::{ChannelError, EventChannel};
use crate::nsenter::helper::HELPER_FD;
use crate::nsenter::message::{HelperRequest, NamespaceSet, NsRequest, NsResponse};
use crate::nsenter::NsenterError;

const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// One namespace-enter operation. Synchronous events are reaped inside
/// `receive_response`; asynchronous ones (`Sleep`) keep their helper running
/// until [`Executor::terminate`] or drop.
pub struct NsenterEvent {
    target: Pid,
    namespaces: NamespaceSet,
    request: NsRequest,
    is_async: bool,
    state: Mutex<EventState>,
}

#[derive(Default)]
struct EventState {
    child: Option<Child>,
    channel: Option<EventChannel>,
}

impl NsenterEvent {
    pub fn new(target: Pid, namespaces: NamespaceSet, request: NsRequest, is_async: bool) -> Self {
        NsenterEvent {
            target,
            namespaces,
            request,
            is_async,
            state: Mutex::new(EventState::default()),
        }
    }

    pub fn target(&self) -> Pid {
        self.target
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }
}

impl Drop for NsenterEvent {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        if let Some(child) = state.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

pub struct Executor {
    helper_exe: PathBuf,
    timeout: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Executor {
            helper_exe: PathBuf::from("/proc/self/exe"),
            timeout: DEFAULT_EVENT_TIMEOUT,
        }
    }
}

impl Executor {
    pub fn new(timeout: Duration) -> Self {
        Executor {
            timeout,
            ..Default::default()
        }
    }

    /// Points the executor at a different helper binary. Used by tests that
    /// substitute a stub helper.
    pub fn with_helper_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.helper_exe = exe.into();
        self
    }

    /// Launches the helper for `event` and writes the request record.
    pub fn send_request(&self, event: &NsenterEvent) -> Result<(), NsenterError> {
        let mut state = event.state.lock().unwrap();
        if state.child.is_some() {
            return Err(NsenterError::BadRequest("event already sent".into()));
        }

        let (local, remote) = EventChannel::pair().map_err(channel_launch_err)?;
        let remote_fd = remote.raw_fd();
        let mut cmd = Command::new(&self.helper_exe);
        cmd.arg("nsenter")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // The helper finds its channel on a fixed fd. dup2 clears O_CLOEXEC;
        // when the socket already landed on the target fd only the flag needs
        // clearing.
        unsafe {
            cmd.pre_exec(move || {
                if remote_fd == HELPER_FD {
                    let flags = libc::fcntl(HELPER_FD, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(HELPER_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(remote_fd, HELPER_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .map_err(|e| NsenterError::Launch(e.to_string()))?;
        drop(remote);

        let request = HelperRequest {
            target_pid: event.target.as_raw(),
            namespaces: event.namespaces,
            request: event.request.clone(),
        };
        tracing::debug!(target_pid = event.target.as_raw(), request = %event.request, "dispatching nsenter helper");
        let sent = local.send(&request);
        state.child = Some(child);
        state.channel = Some(local);
        if let Err(err) = sent {
            reap(&mut state);
            return Err(match err {
                ChannelError::Closed => NsenterError::Launch("helper exited before request".into()),
                other => NsenterError::Io(other.to_string()),
            });
        }
        Ok(())
    }

    /// Reads the helper's response, bounded by the event timeout. On expiry
    /// the helper is killed and `Timeout` returned.
    pub fn receive_response(&self, event: &NsenterEvent) -> Result<NsResponse, NsenterError> {
        let mut state = event.state.lock().unwrap();
        let channel = state
            .channel
            .as_ref()
            .ok_or_else(|| NsenterError::BadRequest("response without request".into()))?;
        channel
            .set_recv_timeout(self.timeout)
            .map_err(|e| NsenterError::Io(e.to_string()))?;

        let response = match channel.recv::<NsResponse>() {
            Ok(resp) => Ok(resp),
            Err(ChannelError::TimedOut) => {
                reap(&mut state);
                return Err(NsenterError::Timeout);
            }
            Err(ChannelError::Closed) => {
                reap(&mut state);
                Err(NsenterError::Io("helper closed the channel".into()))
            }
            Err(other) => {
                reap(&mut state);
                Err(NsenterError::Io(other.to_string()))
            }
        };

        if !event.is_async {
            reap(&mut state);
        }
        response
    }

    /// Pid of the running helper, for callers that pivot further events onto
    /// its namespaces.
    pub fn event_pid(&self, event: &NsenterEvent) -> Result<Pid, NsenterError> {
        let state = event.state.lock().unwrap();
        state
            .child
            .as_ref()
            .map(|c| Pid::from_raw(c.id() as i32))
            .ok_or_else(|| NsenterError::BadRequest("event not launched".into()))
    }

    /// Tears down an async helper.
    pub fn terminate(&self, event: &NsenterEvent) {
        let mut state = event.state.lock().unwrap();
        reap(&mut state);
    }
}

fn reap(state: &mut EventState) {
    if let Some(mut child) = state.child.take() {
        let _ = child.kill();
        let _ = child.wait();
    }
    state.channel = None;
}

fn channel_launch_err(err: ChannelError) -> NsenterError {
    NsenterError::Launch(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_receive_before_send_is_rejected() {
        let executor = Executor::default();
        let event = NsenterEvent::new(
            Pid::from_raw(1),
            NamespaceSet::net_only(),
            NsRequest::MountInfo,
            false,
        );
        let err = executor.receive_response(&event).err().unwrap();
        assert!(matches!(err, NsenterError::BadRequest(_)));
    }

    #[test]
    #[serial]
    fn test_launch_failure_with_missing_helper() {
        let executor = Executor::default().with_helper_exe("/nonexistent/helper");
        let event = NsenterEvent::new(
            Pid::from_raw(1),
            NamespaceSet::net_only(),
            NsRequest::MountInfo,
            false,
        );
        let err = executor.send_request(&event).err().unwrap();
        assert!(matches!(err, NsenterError::Launch(_)));
    }

    // /bin/cat exits without ever writing a response record; the receive
    // path must reap it and surface an error rather than hang. The timeout
    // arm proper is covered by the channel tests.
    #[test]
    #[serial]
    fn test_helper_early_exit_is_reaped() {
        let executor = Executor::new(Duration::from_millis(500)).with_helper_exe("/bin/cat");
        let event = NsenterEvent::new(
            Pid::from_raw(1),
            NamespaceSet::net_only(),
            NsRequest::MountInfo,
            false,
        );
        if executor.send_request(&event).is_err() {
            // cat may exit before the request record is written; either way
            // the event must not be left holding a live child.
            assert!(executor.event_pid(&event).is_err());
            return;
        }
        let err = executor.receive_response(&event).err().unwrap();
        assert!(matches!(err, NsenterError::Io(_) | NsenterError::Timeout));
        assert!(executor.event_pid(&event).is_err());
    }
}
