//! Frame codec for the ProcessForker protocol
//!
//! A frame is `[type: u32][payload length: u32][payload]`, see
//! [`crate::daemon::protocol`]. Writes are single `write()` calls per field and
//! an incomplete write is an error of its own. Reads wait for readability with
//! `poll()` so that every field is bounded by the caller's timeout.

use crate::daemon::protocol::{msg_type_to_string, MsgType, Payload};
use crate::error::FrameError;
use log::debug;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

/// Largest payload a peer may announce. Checked before any buffer is allocated.
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// One wire unit: a raw message-type tag and its serialized payload
///
/// The tag is kept as a raw `u32` so that frames from a peer speaking a
/// different version of the catalogue can still be read and reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessForkerFrame {
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

impl ProcessForkerFrame {
    pub fn new(msg_type: MsgType, payload: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type.as_u32(),
            payload,
        }
    }

    /// Serialize a typed payload into a frame tagged with its message type
    pub fn from_payload<P: Payload>(msg: &P) -> Result<Self, FrameError> {
        let payload = bincode::serialize(msg).map_err(|source| FrameError::Encode {
            msg_type: P::MSG_TYPE,
            source,
        })?;
        Ok(Self::new(P::MSG_TYPE, payload))
    }

    /// Parse the payload as `P`, failing if the frame carries another message type
    pub fn parse<P: Payload>(&self) -> Result<P, FrameError> {
        if self.msg_type != P::MSG_TYPE.as_u32() {
            return Err(FrameError::UnexpectedType {
                expected: P::MSG_TYPE,
                actual: self.type_name(),
            });
        }
        bincode::deserialize(&self.payload).map_err(|source| FrameError::Decode {
            msg_type: P::MSG_TYPE,
            len: self.payload.len(),
            source,
        })
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_u32(self.msg_type)
    }

    pub fn type_name(&self) -> &'static str {
        msg_type_to_string(self.msg_type)
    }

    pub fn is(&self, msg_type: MsgType) -> bool {
        self.msg_type == msg_type.as_u32()
    }
}

/// Write one frame. Nothing is written if the payload is empty or too large.
pub fn write_frame(fd: BorrowedFd<'_>, frame: &ProcessForkerFrame) -> Result<(), FrameError> {
    let payload_len = frame.payload.len();
    if payload_len == 0 {
        return Err(FrameError::EmptyPayload);
    }
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            max: MAX_PAYLOAD_LEN,
            actual: payload_len,
        });
    }

    write_bytes(fd, &frame.msg_type.to_ne_bytes(), "payload type")?;
    write_bytes(fd, &(payload_len as u32).to_ne_bytes(), "payload length")?;
    write_bytes(fd, &frame.payload, "payload")?;

    debug!(
        "Wrote ProcessForker frame: fd={} type={} payloadLen={}",
        fd.as_raw_fd(),
        frame.type_name(),
        payload_len
    );
    Ok(())
}

/// Serialize `msg` and write it as one frame
pub fn write_payload<P: Payload>(fd: BorrowedFd<'_>, msg: &P) -> Result<(), FrameError> {
    write_frame(fd, &ProcessForkerFrame::from_payload(msg)?)
}

/// Read one frame. Each of the three fields must arrive within `timeout`.
pub fn read_frame(fd: BorrowedFd<'_>, timeout: Duration) -> Result<ProcessForkerFrame, FrameError> {
    let msg_type = read_uint32(fd, timeout, "payload type")?;
    let payload_len = read_uint32(fd, timeout, "payload length")? as usize;

    if payload_len == 0 {
        return Err(FrameError::EmptyPayload);
    }
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            max: MAX_PAYLOAD_LEN,
            actual: payload_len,
        });
    }

    let mut payload = vec![0u8; payload_len];
    read_bytes(fd, timeout, &mut payload, "payload")?;

    debug!(
        "Read ProcessForker frame: fd={} type={} payloadLen={}",
        fd.as_raw_fd(),
        msg_type_to_string(msg_type),
        payload_len
    );
    Ok(ProcessForkerFrame { msg_type, payload })
}

fn read_uint32(fd: BorrowedFd<'_>, timeout: Duration, what: &'static str) -> Result<u32, FrameError> {
    let mut buf = [0u8; 4];
    read_bytes(fd, timeout, &mut buf, what)?;
    Ok(u32::from_ne_bytes(buf))
}

fn write_bytes(fd: BorrowedFd<'_>, buf: &[u8], what: &'static str) -> Result<(), FrameError> {
    loop {
        // SAFETY: `buf` is a valid slice for the duration of the call and `fd`
        // is a live descriptor borrowed from its owner.
        let rc = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(FrameError::Io {
                op: "write",
                what,
                source: err,
            });
        }

        let written = rc as usize;
        if written != buf.len() {
            return Err(FrameError::ShortWrite {
                what,
                expected: buf.len(),
                actual: written,
            });
        }
        return Ok(());
    }
}

fn read_bytes(
    fd: BorrowedFd<'_>,
    timeout: Duration,
    buf: &mut [u8],
    what: &'static str,
) -> Result<(), FrameError> {
    let deadline = Instant::now() + timeout;
    let mut offset = 0;

    while offset < buf.len() {
        wait_readable(fd, deadline, timeout, what)?;

        let remaining = &mut buf[offset..];
        // SAFETY: `remaining` is a valid, exclusively borrowed buffer of the
        // given length and `fd` is a live descriptor.
        let rc = unsafe { libc::read(fd.as_raw_fd(), remaining.as_mut_ptr().cast(), remaining.len()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(FrameError::Io {
                op: "read",
                what,
                source: err,
            });
        }
        if rc == 0 {
            return Err(FrameError::ShortRead {
                what,
                expected: buf.len(),
                actual: offset,
            });
        }
        offset += rc as usize;
    }

    Ok(())
}

/// Block until `fd` is readable (or hung up) or `deadline` passes
fn wait_readable(
    fd: BorrowedFd<'_>,
    deadline: Instant,
    timeout: Duration,
    what: &'static str,
) -> Result<(), FrameError> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(FrameError::Timeout { what, timeout });
        }

        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, poll_timeout_ms(deadline - now)) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(FrameError::Io {
                op: "poll",
                what,
                source: err,
            });
        }
        if rc > 0 {
            // POLLHUP and POLLERR are left for read() to report
            return Ok(());
        }
    }
}

/// Milliseconds to hand to poll(), rounded up so a sub-millisecond remainder
/// does not turn into a busy loop
pub(crate) fn poll_timeout_ms(remaining: Duration) -> libc::c_int {
    let ms = remaining.as_micros().div_ceil(1000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}
