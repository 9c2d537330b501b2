//! Length-prefixed serde channel over a Unix socketpair.
//!
//! One channel per nsenter event: the daemon keeps one end, the helper
//! inherits the other on a fixed fd. Records are serialized with serde_json
//! and framed with a u64 length prefix so arbitrarily large payloads
//! (mountinfo snapshots) survive the stream socket.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::sys::socket::{self, sockopt};
use nix::sys::time::TimeVal;
use nix::unistd;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("socket syscall failed: {0}")]
    Nix(#[from] nix::Error),
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("channel closed by peer")]
    Closed,
    #[error("read timed out")]
    TimedOut,
}

pub struct EventChannel {
    fd: OwnedFd,
}

impl EventChannel {
    /// Returns the daemon end and the helper end.
    pub fn pair() -> Result<(EventChannel, EventChannel), ChannelError> {
        let (local, remote) = socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            None,
            socket::SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((EventChannel { fd: local }, EventChannel { fd: remote }))
    }

    /// Wraps an inherited fd (helper side).
    ///
    /// # Safety
    /// `fd` must be an open socket owned by the caller.
    pub unsafe fn from_raw(fd: RawFd) -> EventChannel {
        EventChannel {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Bounds subsequent `recv` calls. Zero disables the timeout.
    pub fn set_recv_timeout(&self, timeout: Duration) -> Result<(), ChannelError> {
        let tv = TimeVal::new(
            timeout.as_secs() as libc::time_t,
            timeout.subsec_micros() as libc::suseconds_t,
        );
        socket::setsockopt(&self.fd, sockopt::ReceiveTimeout, &tv)?;
        Ok(())
    }

    pub fn send<T: Serialize>(&self, msg: &T) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(msg)?;
        let len = (payload.len() as u64).to_le_bytes();
        self.write_all(&len)?;
        self.write_all(&payload)
    }

    pub fn recv<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        let mut len_buf = [0u8; 8];
        self.read_exact(&mut len_buf)?;
        let len = u64::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload)?;
        Ok(serde_json::from_slice(&payload)?)
    }

    fn write_all(&self, mut buf: &[u8]) -> Result<(), ChannelError> {
        while !buf.is_empty() {
            match unistd::write(&self.fd, buf) {
                Ok(0) => return Err(ChannelError::Closed),
                Ok(n) => buf = &buf[n..],
                Err(nix::Error::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn read_exact(&self, buf: &mut [u8]) -> Result<(), ChannelError> {
        let mut filled = 0;
        while filled < buf.len() {
            match unistd::read(self.fd.as_raw_fd(), &mut buf[filled..]) {
                Ok(0) => return Err(ChannelError::Closed),
                Ok(n) => filled += n,
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::EAGAIN) => return Err(ChannelError::TimedOut),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
