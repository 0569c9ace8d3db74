//! Daemon side of the ProcessForker command channel
//!
//! Presents each forker operation as a blocking call: write one request frame,
//! read one reply frame. Requests are never pipelined.

use crate::daemon::protocol::{
    DriveConfig, Exception, ForkCleaner, ForkDataTransfer, ForkLabel, ForkSucceeded, LabelJob,
    MsgType, Payload, ReturnValue, StopProcessForker,
};
use crate::daemon::socket::ControlSocket;
use crate::error::ForkerError;
use log::info;
use nix::unistd::Pid;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// How long the proxy waits for each field of a reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Operations the daemon can ask of its ProcessForker
pub trait ProcessForkerProxy {
    /// Ask the forker to leave its main loop
    fn stop_process_forker(&mut self, reason: &str) -> Result<(), ForkerError>;

    fn fork_data_transfer(&mut self, drive: &DriveConfig) -> Result<Pid, ForkerError>;

    fn fork_label(&mut self, drive: &DriveConfig, job: &LabelJob) -> Result<Pid, ForkerError>;

    fn fork_cleaner(
        &mut self,
        drive: &DriveConfig,
        vid: &str,
        wait_media_in_drive: bool,
        wait_media_in_drive_timeout: u32,
    ) -> Result<Pid, ForkerError>;
}

/// [`ProcessForkerProxy`] speaking the framed protocol over a Unix socket
#[derive(Debug)]
pub struct ProcessForkerProxySocket {
    socket: ControlSocket,
    reply_timeout: Duration,
}

impl ProcessForkerProxySocket {
    pub fn new(stream: UnixStream) -> Self {
        Self::with_reply_timeout(stream, DEFAULT_REPLY_TIMEOUT)
    }

    pub fn with_reply_timeout(stream: UnixStream, reply_timeout: Duration) -> Self {
        Self {
            socket: ControlSocket::new("processForkerCmdSocket", stream),
            reply_timeout,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.raw_fd()
    }

    fn send_request<P: Payload>(&self, rqst: &P) -> Result<(), ForkerError> {
        self.socket
            .write_payload(rqst)
            .map_err(ForkerError::frame("send request"))
    }

    /// Read one reply, turning an Exception reply into [`ForkerError::Remote`]
    ///
    /// Any other type than `R` or Exception is a protocol violation.
    pub fn read_reply_or_ex<R: Payload>(&self) -> Result<R, ForkerError> {
        let frame = self
            .socket
            .read_frame(self.reply_timeout)
            .map_err(ForkerError::frame("read reply"))?;

        if frame.is(MsgType::Exception) {
            let ex: Exception = frame
                .parse()
                .map_err(ForkerError::frame("parse Exception reply"))?;
            return Err(ForkerError::Remote {
                code: ex.code,
                message: ex.message,
            });
        }

        if !frame.is(R::MSG_TYPE) {
            return Err(ForkerError::ProtocolViolation {
                expected: R::MSG_TYPE,
                actual: frame.type_name(),
            });
        }

        frame.parse().map_err(ForkerError::frame("parse reply"))
    }

    fn read_fork_succeeded(&self) -> Result<Pid, ForkerError> {
        let reply: ForkSucceeded = self.read_reply_or_ex()?;
        Ok(Pid::from_raw(reply.pid))
    }
}

impl ProcessForkerProxy for ProcessForkerProxySocket {
    fn stop_process_forker(&mut self, reason: &str) -> Result<(), ForkerError> {
        self.send_request(&StopProcessForker {
            reason: reason.to_string(),
        })?;

        let reply: ReturnValue = self.read_reply_or_ex()?;
        if reply.value != 0 {
            return Err(ForkerError::UnexpectedReturnValue { value: reply.value });
        }

        info!("Told ProcessForker to stop: reason={}", reason);
        Ok(())
    }

    fn fork_data_transfer(&mut self, drive: &DriveConfig) -> Result<Pid, ForkerError> {
        self.send_request(&ForkDataTransfer {
            drive: drive.clone(),
        })?;
        let pid = self.read_fork_succeeded()?;

        info!(
            "ProcessForker forked data-transfer session: unitName={} pid={}",
            drive.unit_name, pid
        );
        Ok(pid)
    }

    fn fork_label(&mut self, drive: &DriveConfig, job: &LabelJob) -> Result<Pid, ForkerError> {
        self.send_request(&ForkLabel {
            drive: drive.clone(),
            job: job.clone(),
        })?;
        let pid = self.read_fork_succeeded()?;

        info!(
            "ProcessForker forked label session: unitName={} TPVID={} pid={}",
            drive.unit_name, job.vid, pid
        );
        Ok(pid)
    }

    fn fork_cleaner(
        &mut self,
        drive: &DriveConfig,
        vid: &str,
        wait_media_in_drive: bool,
        wait_media_in_drive_timeout: u32,
    ) -> Result<Pid, ForkerError> {
        self.send_request(&ForkCleaner {
            drive: drive.clone(),
            vid: vid.to_string(),
            wait_media_in_drive,
            wait_media_in_drive_timeout,
        })?;
        let pid = self.read_fork_succeeded()?;

        info!(
            "ProcessForker forked cleaner session: unitName={} TPVID={} pid={}",
            drive.unit_name, vid, pid
        );
        Ok(pid)
    }
}
