//! Exclusively owned control socket
//!
//! Each end of a ProcessForker socket pair is owned by exactly one object for
//! its whole life. Closing it can fail; that failure is logged rather than
//! raised because closing happens on drop.

use crate::daemon::frame::{read_frame, write_frame, write_payload, ProcessForkerFrame};
use crate::daemon::protocol::Payload;
use crate::error::FrameError;
use log::{error, info};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

#[derive(Debug)]
pub struct ControlSocket {
    /// Name used in log messages, e.g. "cmdSocket"
    name: &'static str,
    stream: Option<UnixStream>,
}

impl ControlSocket {
    pub fn new(name: &'static str, stream: UnixStream) -> Self {
        Self {
            name,
            stream: Some(stream),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Raw descriptor, or -1 once closed
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_ref().map_or(-1, |s| s.as_raw_fd())
    }

    pub fn write_frame(&self, frame: &ProcessForkerFrame) -> Result<(), FrameError> {
        write_frame(self.fd()?, frame)
    }

    pub fn write_payload<P: Payload>(&self, msg: &P) -> Result<(), FrameError> {
        write_payload(self.fd()?, msg)
    }

    pub fn read_frame(&self, timeout: Duration) -> Result<ProcessForkerFrame, FrameError> {
        read_frame(self.fd()?, timeout)
    }

    /// Close the socket now. Later calls are no-ops.
    pub fn close(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        let fd = stream.into_raw_fd();
        // SAFETY: `fd` was just released by the UnixStream that owned it and
        // nothing else refers to it.
        if unsafe { libc::close(fd) } == -1 {
            let err = std::io::Error::last_os_error();
            error!("Failed to close {}: fd={}: {}", self.name, fd, err);
        } else {
            info!("Closed {}: fd={}", self.name, fd);
        }
    }

    fn fd(&self) -> Result<BorrowedFd<'_>, FrameError> {
        self.stream.as_ref().map(|s| s.as_fd()).ok_or_else(|| FrameError::Io {
            op: "use",
            what: self.name,
            source: std::io::Error::from_raw_os_error(libc::EBADF),
        })
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::ReturnValue;

    #[test]
    fn test_close_is_idempotent() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut socket = ControlSocket::new("cmdSocket", a);
        assert!(socket.is_open());
        assert!(socket.raw_fd() >= 0);

        socket.close();
        assert!(!socket.is_open());
        assert_eq!(socket.raw_fd(), -1);
        socket.close();
    }

    #[test]
    fn test_closed_socket_refuses_io() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut socket = ControlSocket::new("cmdSocket", a);
        socket.close();

        let err = socket.write_payload(&ReturnValue { value: 0 }).unwrap_err();
        assert!(matches!(err, FrameError::Io { op: "use", .. }));
    }

    #[test]
    fn test_drop_closes_peer_connection() {
        let (a, b) = UnixStream::pair().unwrap();
        let socket = ControlSocket::new("reaperSocket", a);
        let peer = ControlSocket::new("peer", b);
        drop(socket);

        let err = peer.read_frame(Duration::from_secs(1)).unwrap_err();
        assert!(err.is_connection_closed());
    }
}
