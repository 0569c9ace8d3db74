//! Reactor handler for the reaper channel
//!
//! The ProcessForker reports every terminated session process on a dedicated
//! socket. [`ReaperHandler`] owns the daemon end of that socket inside the
//! [`PollReactor`](crate::reactor::PollReactor) and hands each report to a
//! callback. When the forker closes the socket the handler asks the reactor
//! to drop it.

use crate::daemon::frame::ProcessForkerFrame;
use crate::daemon::protocol::{MsgType, ProcessCrashed, ProcessExited};
use crate::daemon::socket::ControlSocket;
use crate::error::ForkerError;
use crate::reactor::handler::{fill_read_request, is_broken, is_readable};
use crate::reactor::{PollEventHandler, PollRequest};
use anyhow::Context;
use log::{info, warn};
use nix::unistd::Pid;
use std::fmt;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Termination of a session process, as reported by the ProcessForker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Exited { pid: Pid, exit_code: i32 },
    Crashed { pid: Pid, signal: i32 },
}

impl ProcessEvent {
    pub fn pid(&self) -> Pid {
        match self {
            ProcessEvent::Exited { pid, .. } | ProcessEvent::Crashed { pid, .. } => *pid,
        }
    }

    pub fn from_frame(frame: &ProcessForkerFrame) -> Result<Self, ForkerError> {
        match frame.msg_type() {
            Some(MsgType::ProcessExited) => {
                let msg: ProcessExited = frame
                    .parse()
                    .map_err(ForkerError::frame("handle ProcessExited message"))?;
                Ok(ProcessEvent::Exited {
                    pid: Pid::from_raw(msg.pid),
                    exit_code: msg.exit_code,
                })
            }
            Some(MsgType::ProcessCrashed) => {
                let msg: ProcessCrashed = frame
                    .parse()
                    .map_err(ForkerError::frame("handle ProcessCrashed message"))?;
                Ok(ProcessEvent::Crashed {
                    pid: Pid::from_raw(msg.pid),
                    signal: msg.signal,
                })
            }
            _ => Err(ForkerError::ProtocolViolation {
                expected: MsgType::ProcessExited,
                actual: frame.type_name(),
            }),
        }
    }
}

impl fmt::Display for ProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessEvent::Exited { pid, exit_code } => write!(f, "exited: pid={} exitCode={}", pid, exit_code),
            ProcessEvent::Crashed { pid, signal } => write!(f, "crashed: pid={} signal={}", pid, signal),
        }
    }
}

pub type ProcessEventCallback = Box<dyn FnMut(ProcessEvent)>;

pub struct ReaperHandler {
    socket: ControlSocket,
    read_timeout: Duration,
    on_event: ProcessEventCallback,
}

impl ReaperHandler {
    pub fn new(stream: UnixStream, read_timeout: Duration, on_event: ProcessEventCallback) -> Self {
        Self {
            socket: ControlSocket::new("reaperSocket", stream),
            read_timeout,
            on_event,
        }
    }

    fn peer_closed(&self) -> anyhow::Result<bool> {
        info!("ProcessForker closed the reaper socket: fd={}", self.socket.raw_fd());
        Ok(true)
    }
}

impl PollEventHandler for ReaperHandler {
    fn fd(&self) -> RawFd {
        self.socket.raw_fd()
    }

    fn fill_poll_request(&self, request: &mut PollRequest) {
        fill_read_request(self.socket.raw_fd(), request);
    }

    fn handle_event(&mut self, request: &PollRequest) -> anyhow::Result<bool> {
        if !is_readable(request) {
            if is_broken(request) {
                return self.peer_closed();
            }
            warn!(
                "Unexpected events on reaper socket: fd={} revents={:#x}",
                request.fd, request.revents
            );
            return Ok(false);
        }

        let frame = match self.socket.read_frame(self.read_timeout) {
            Ok(frame) => frame,
            Err(e) if e.is_connection_closed() => return self.peer_closed(),
            Err(e) => return Err(e).context("Failed to handle reaper message"),
        };

        let event = ProcessEvent::from_frame(&frame).context("Failed to handle reaper message")?;
        info!("Session process {}", event);
        (self.on_event)(event);
        Ok(false)
    }
}
