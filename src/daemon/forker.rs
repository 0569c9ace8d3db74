//! ProcessForker service
//!
//! The ProcessForker is a small process forked by the daemon at start-up,
//! before the daemon grows threads or big allocations. Its only job is to fork
//! tape-session processes on request and tell the daemon when they terminate.
//!
//! ## Main loop
//! Each iteration of [`ProcessForker::execute`]:
//! 1. polls the command socket for a pending request (bounded by `poll_interval`)
//! 2. reads and handles at most one request, replying on the same socket
//! 3. reaps the session processes it forked, reporting each termination on
//!    the reaper socket as `ProcessExited` or `ProcessCrashed`
//!
//! A request whose handler fails is answered with an `Exception` and the loop
//! carries on. A failure to read a request, or to notify the daemon of a
//! terminated session, ends the loop.

use crate::daemon::frame::{poll_timeout_ms, ProcessForkerFrame, MAX_PAYLOAD_LEN};
use crate::daemon::protocol::{
    Exception, ForkCleaner, ForkDataTransfer, ForkLabel, ForkSucceeded, MsgType, Payload,
    ProcessCrashed, ProcessExited, ReturnValue, StopProcessForker,
};
use crate::daemon::session::{SessionRequest, SessionRunner};
use crate::daemon::socket::ControlSocket;
use crate::error::ForkerError;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::io;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

/// Bound on reading one request once the command socket is readable
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How long each iteration waits for a pending request
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exception messages are cut to this many bytes so the reply always fits a frame
const MAX_EXCEPTION_MESSAGE_LEN: usize = MAX_PAYLOAD_LEN - 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkerConfig {
    pub read_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ForkerConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// How the main loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkerOutcome {
    /// The daemon sent StopProcessForker
    Stopped,
    /// An unrecoverable error ended the loop
    Faulted,
}

impl ForkerOutcome {
    /// Exit code of the ProcessForker process
    pub fn exit_code(self) -> i32 {
        match self {
            ForkerOutcome::Stopped => 0,
            ForkerOutcome::Faulted => 1,
        }
    }
}

/// Reply to send back plus whether the main loop should go on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHandlerResult {
    pub reply: ProcessForkerFrame,
    pub continue_main_event_loop: bool,
}

impl MsgHandlerResult {
    fn new<P: Payload>(reply: &P, continue_main_event_loop: bool) -> Result<Self, ForkerError> {
        let reply = ProcessForkerFrame::from_payload(reply).map_err(ForkerError::frame("create reply"))?;
        Ok(Self {
            reply,
            continue_main_event_loop,
        })
    }

    fn exception(err: &ForkerError) -> Result<Self, ForkerError> {
        Self::new(&exception_for(err), true)
    }
}

pub struct ProcessForker {
    cmd_socket: ControlSocket,
    reaper_socket: ControlSocket,
    runner: Box<dyn SessionRunner>,
    config: ForkerConfig,
    /// Session processes forked and not yet reaped
    children: Vec<Pid>,
}

impl ProcessForker {
    pub fn new(
        cmd_socket: UnixStream,
        reaper_socket: UnixStream,
        runner: Box<dyn SessionRunner>,
        config: ForkerConfig,
    ) -> Self {
        Self {
            cmd_socket: ControlSocket::new("cmdSocket", cmd_socket),
            reaper_socket: ControlSocket::new("reaperSocket", reaper_socket),
            runner,
            config,
            children: Vec::new(),
        }
    }

    /// Session processes that have been forked but not reaped yet
    pub fn children(&self) -> &[Pid] {
        &self.children
    }

    /// Run the main loop until stopped or faulted
    pub fn execute(&mut self) -> ForkerOutcome {
        info!(
            "ProcessForker entering main loop: readTimeout={:?} pollInterval={:?}",
            self.config.read_timeout, self.config.poll_interval
        );
        loop {
            match self.handle_events() {
                Ok(true) => continue,
                Ok(false) => {
                    info!("ProcessForker stopped");
                    return ForkerOutcome::Stopped;
                }
                Err(e) => {
                    error!("ProcessForker failed to handle events: {}", e);
                    error!("ProcessForker is gracefully shutting down");
                    return ForkerOutcome::Faulted;
                }
            }
        }
    }

    /// One iteration of the main loop. Returns `Ok(false)` once asked to stop.
    pub fn handle_events(&mut self) -> Result<bool, ForkerError> {
        if self.has_pending_msg() && !self.handle_msg()? {
            return Ok(false);
        }
        self.reap_zombies()?;
        Ok(true)
    }

    fn has_pending_msg(&self) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.cmd_socket.raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, poll_timeout_ms(self.config.poll_interval)) };
        match rc {
            0 => false,
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    error!(
                        "Error detected when checking for a pending ProcessForker message: {}",
                        err
                    );
                }
                false
            }
            // A hung-up peer counts as pending so that the read reports it
            _ => pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
        }
    }

    /// Read one request from the command socket, handle it and reply
    ///
    /// Returns `Ok(false)` when the main loop should stop. A read failure is
    /// returned as an error, after an Exception has been sent back if the peer
    /// is still there to receive it.
    pub fn handle_msg(&mut self) -> Result<bool, ForkerError> {
        let frame = match self.cmd_socket.read_frame(self.config.read_timeout) {
            Ok(frame) => frame,
            Err(source) => {
                let err = ForkerError::Frame {
                    context: "handle message",
                    source,
                };
                self.report_read_failure(&err);
                return Err(err);
            }
        };

        info!(
            "ProcessForker handling a ProcessForker message: type={} len={}",
            frame.type_name(),
            frame.payload.len()
        );

        let result = match self.dispatch_msg_handler(&frame) {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "ProcessForker message handler failed: type={} message={}",
                    frame.type_name(),
                    e
                );
                MsgHandlerResult::exception(&e)?
            }
        };

        self.cmd_socket
            .write_frame(&result.reply)
            .map_err(ForkerError::frame("write reply"))?;
        debug!(
            "ProcessForker wrote reply: payloadType={} payloadLen={}",
            result.reply.type_name(),
            result.reply.payload.len()
        );
        Ok(result.continue_main_event_loop)
    }

    fn report_read_failure(&self, err: &ForkerError) {
        if let ForkerError::Frame { source, .. } = err {
            if source.is_connection_closed() {
                return;
            }
        }
        if let Err(e) = self.cmd_socket.write_payload(&exception_for(err)) {
            warn!("ProcessForker failed to report read failure: {}", e);
        }
    }

    fn dispatch_msg_handler(&mut self, frame: &ProcessForkerFrame) -> Result<MsgHandlerResult, ForkerError> {
        match frame.msg_type() {
            Some(MsgType::ForkCleaner) => self.handle_fork_cleaner_msg(frame),
            Some(MsgType::ForkDataTransfer) => self.handle_fork_data_transfer_msg(frame),
            Some(MsgType::ForkLabel) => self.handle_fork_label_msg(frame),
            Some(MsgType::StopProcessForker) => self.handle_stop_process_forker_msg(frame),
            _ => Err(ForkerError::UnknownMessageType {
                msg_type: frame.msg_type,
            }),
        }
    }

    fn handle_fork_cleaner_msg(&mut self, frame: &ProcessForkerFrame) -> Result<MsgHandlerResult, ForkerError> {
        let rqst: ForkCleaner = frame
            .parse()
            .map_err(ForkerError::frame("handle ForkCleaner message"))?;
        info!(
            "ProcessForker handling ForkCleaner message: unitName={} TPVID={} waitMediaInDrive={} waitMediaInDriveTimeout={}",
            rqst.drive.unit_name, rqst.vid, rqst.wait_media_in_drive, rqst.wait_media_in_drive_timeout
        );
        self.fork_session(rqst.into())
    }

    fn handle_fork_data_transfer_msg(&mut self, frame: &ProcessForkerFrame) -> Result<MsgHandlerResult, ForkerError> {
        let rqst: ForkDataTransfer = frame
            .parse()
            .map_err(ForkerError::frame("handle ForkDataTransfer message"))?;
        info!(
            "ProcessForker handling ForkDataTransfer message: unitName={} devFilename={}",
            rqst.drive.unit_name, rqst.drive.dev_filename
        );
        self.fork_session(rqst.into())
    }

    fn handle_fork_label_msg(&mut self, frame: &ProcessForkerFrame) -> Result<MsgHandlerResult, ForkerError> {
        let rqst: ForkLabel = frame
            .parse()
            .map_err(ForkerError::frame("handle ForkLabel message"))?;
        info!(
            "ProcessForker handling ForkLabel message: unitName={} TPVID={} force={} lbp={} uid={} gid={}",
            rqst.drive.unit_name, rqst.job.vid, rqst.job.force, rqst.job.lbp, rqst.job.uid, rqst.job.gid
        );
        self.fork_session(rqst.into())
    }

    fn handle_stop_process_forker_msg(&mut self, frame: &ProcessForkerFrame) -> Result<MsgHandlerResult, ForkerError> {
        let rqst: StopProcessForker = frame
            .parse()
            .map_err(ForkerError::frame("handle StopProcessForker message"))?;
        info!("Gracefully stopping ProcessForker: reason={}", rqst.reason);
        MsgHandlerResult::new(&ReturnValue { value: 0 }, false)
    }

    fn fork_session(&mut self, request: SessionRequest) -> Result<MsgHandlerResult, ForkerError> {
        // SAFETY: the child only closes its sockets, runs the session and
        // leaves through _exit without returning into the main loop.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                info!("ProcessForker forked {} session: pid={}", request.kind(), child);
                self.children.push(child);
                MsgHandlerResult::new(&ForkSucceeded { pid: child.as_raw() }, true)
            }
            Ok(ForkResult::Child) => self.run_session_process(&request),
            Err(source) => {
                let err = ForkerError::ForkSession {
                    kind: request.kind(),
                    source,
                };
                error!("{}: unitName={}", err, request.drive().unit_name);
                MsgHandlerResult::exception(&err)
            }
        }
    }

    /// Body of a session process. Never returns.
    fn run_session_process(&mut self, request: &SessionRequest) -> ! {
        self.cmd_socket.close();
        self.reaper_socket.close();

        let runner = &mut self.runner;
        let result = panic::catch_unwind(AssertUnwindSafe(|| runner.run_session(request)));
        let action = match result {
            Ok(Ok(action)) => action,
            Ok(Err(e)) => {
                error!("{} session failed: {:#}", request.kind(), e);
                request.on_error_action()
            }
            Err(_) => {
                error!("{} session failed: Session panicked", request.kind());
                request.on_error_action()
            }
        };

        info!(
            "{} session process exiting: unitName={} action={}",
            request.kind(),
            request.drive().unit_name,
            action
        );
        // SAFETY: _exit skips the atexit handlers and stdio buffers
        // inherited from the parent, which must only run there.
        unsafe { libc::_exit(action.exit_code()) }
    }

    /// Reap every terminated session process and notify the daemon
    fn reap_zombies(&mut self) -> Result<(), ForkerError> {
        let mut i = 0;
        while i < self.children.len() {
            let pid = self.children[i];
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    self.children.swap_remove(i);
                    self.handle_reaped_zombie(status)?;
                }
                Ok(_) => i += 1,
                Err(Errno::ECHILD) => {
                    warn!("ProcessForker lost track of child process: pid={}", pid);
                    self.children.swap_remove(i);
                }
                Err(Errno::EINTR) => {}
                Err(source) => {
                    return Err(ForkerError::Wait {
                        pid: pid.as_raw(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    fn handle_reaped_zombie(&self, status: WaitStatus) -> Result<(), ForkerError> {
        match status {
            WaitStatus::Exited(pid, exit_code) => {
                info!(
                    "ProcessForker child process terminated: terminatedPid={} WEXITSTATUS={}",
                    pid, exit_code
                );
                info!(
                    "ProcessForker notifying TapeDaemon of process exit: pid={} exitCode={}",
                    pid, exit_code
                );
                self.reaper_socket
                    .write_payload(&ProcessExited {
                        pid: pid.as_raw(),
                        exit_code,
                    })
                    .map_err(ForkerError::frame("notify TapeDaemon of process exit"))
            }
            WaitStatus::Signaled(pid, signal, core_dumped) => {
                info!(
                    "ProcessForker child process terminated: terminatedPid={} WTERMSIG={} WCOREDUMP={}",
                    pid, signal as i32, core_dumped
                );
                warn!(
                    "ProcessForker notifying TapeDaemon of process crash: pid={} signal={}",
                    pid, signal
                );
                self.reaper_socket
                    .write_payload(&ProcessCrashed {
                        pid: pid.as_raw(),
                        signal: signal as i32,
                    })
                    .map_err(ForkerError::frame("notify TapeDaemon of process crash"))
            }
            other => {
                warn!("ProcessForker ignoring wait status: {:?}", other);
                Ok(())
            }
        }
    }
}

/// Exception reply describing `err`
fn exception_for(err: &ForkerError) -> Exception {
    let mut message = err.to_string();
    if message.len() > MAX_EXCEPTION_MESSAGE_LEN {
        let mut end = MAX_EXCEPTION_MESSAGE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    Exception {
        code: err.code(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::frame::{read_frame, write_frame, write_payload};
    use crate::daemon::protocol::{DriveConfig, LabelJob};
    use crate::daemon::session::EndOfSessionAction;
    use crate::error::GENERIC_ERROR_CODE;
    use anyhow::Result;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        forker: ProcessForker,
        daemon_cmd: UnixStream,
        daemon_reaper: UnixStream,
    }

    fn fixture(runner: Box<dyn SessionRunner>) -> Fixture {
        let (daemon_cmd, forker_cmd) = UnixStream::pair().unwrap();
        let (daemon_reaper, forker_reaper) = UnixStream::pair().unwrap();
        let config = ForkerConfig {
            read_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
        };
        Fixture {
            forker: ProcessForker::new(forker_cmd, forker_reaper, runner, config),
            daemon_cmd,
            daemon_reaper,
        }
    }

    fn idle_runner() -> Box<dyn SessionRunner> {
        Box::new(|_: &SessionRequest| -> Result<EndOfSessionAction> { Ok(EndOfSessionAction::MarkDriveAsUp) })
    }

    fn drive() -> DriveConfig {
        DriveConfig {
            unit_name: "T10D6116".to_string(),
            logical_library: "lib1".to_string(),
            dev_filename: "/dev/nst0".to_string(),
            library_slot: "smc5".to_string(),
        }
    }

    fn read_reply(stream: &UnixStream) -> ProcessForkerFrame {
        read_frame(stream.as_fd(), TIMEOUT).unwrap()
    }

    /// Reap until every forked session has been accounted for
    fn reap_all(forker: &mut ProcessForker) {
        for _ in 0..500 {
            forker.reap_zombies().unwrap();
            if forker.children().is_empty() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("session processes were never reaped: {:?}", forker.children());
    }

    #[test]
    fn test_stop_replies_zero_and_stops_loop() {
        let mut fx = fixture(idle_runner());
        write_payload(
            fx.daemon_cmd.as_fd(),
            &StopProcessForker {
                reason: "test".to_string(),
            },
        )
        .unwrap();

        assert!(!fx.forker.handle_msg().unwrap());
        let reply: ReturnValue = read_reply(&fx.daemon_cmd).parse().unwrap();
        assert_eq!(reply.value, 0);
    }

    #[test]
    fn test_unknown_type_is_answered_with_exception() {
        let mut fx = fixture(idle_runner());
        let frame = ProcessForkerFrame {
            msg_type: 4242,
            payload: vec![1, 2, 3],
        };
        write_frame(fx.daemon_cmd.as_fd(), &frame).unwrap();

        assert!(fx.forker.handle_msg().unwrap());
        let ex: Exception = read_reply(&fx.daemon_cmd).parse().unwrap();
        assert_eq!(ex.code, GENERIC_ERROR_CODE);
        assert!(ex.message.contains("Unknown message type: type=4242"));
    }

    #[test]
    fn test_reply_type_sent_as_request_is_rejected() {
        let mut fx = fixture(idle_runner());
        write_payload(fx.daemon_cmd.as_fd(), &ReturnValue { value: 0 }).unwrap();

        assert!(fx.forker.handle_msg().unwrap());
        let reply = read_reply(&fx.daemon_cmd);
        assert!(reply.is(MsgType::Exception));
    }

    #[test]
    fn test_undecodable_request_is_answered_with_exception() {
        let mut fx = fixture(idle_runner());
        let frame = ProcessForkerFrame::new(MsgType::ForkLabel, vec![0xff]);
        write_frame(fx.daemon_cmd.as_fd(), &frame).unwrap();

        assert!(fx.forker.handle_msg().unwrap());
        let ex: Exception = read_reply(&fx.daemon_cmd).parse().unwrap();
        assert!(ex.message.starts_with("Failed to handle ForkLabel message"));
        assert!(fx.forker.children().is_empty());
    }

    #[test]
    fn test_malformed_frame_is_reported_then_fails() {
        let mut fx = fixture(idle_runner());
        fx.daemon_cmd
            .write_all(&MsgType::ForkLabel.as_u32().to_ne_bytes())
            .unwrap();
        fx.daemon_cmd.write_all(&0u32.to_ne_bytes()).unwrap();

        let err = fx.forker.handle_msg().unwrap_err();
        assert!(err.to_string().starts_with("Failed to handle message"));
        let ex: Exception = read_reply(&fx.daemon_cmd).parse().unwrap();
        assert!(ex.message.contains("Payload length must be greater than 0"));
    }

    #[test]
    fn test_execute_stops_on_request() {
        let mut fx = fixture(idle_runner());
        write_payload(
            fx.daemon_cmd.as_fd(),
            &StopProcessForker {
                reason: "shutdown".to_string(),
            },
        )
        .unwrap();

        assert_eq!(fx.forker.execute(), ForkerOutcome::Stopped);
        assert_eq!(ForkerOutcome::Stopped.exit_code(), 0);
    }

    #[test]
    fn test_execute_faults_when_daemon_goes_away() {
        let Fixture {
            mut forker,
            daemon_cmd,
            daemon_reaper: _daemon_reaper,
        } = fixture(idle_runner());
        drop(daemon_cmd);

        assert_eq!(forker.execute(), ForkerOutcome::Faulted);
        assert_eq!(ForkerOutcome::Faulted.exit_code(), 1);
    }

    #[test]
    fn test_forked_session_exit_is_reported() {
        let runner = |request: &SessionRequest| -> Result<EndOfSessionAction> {
            match request {
                SessionRequest::Label { job, .. } if job.force => Ok(EndOfSessionAction::MarkDriveAsUp),
                _ => Ok(EndOfSessionAction::MarkDriveAsDown),
            }
        };
        let mut fx = fixture(Box::new(runner));
        let rqst = ForkLabel {
            drive: drive(),
            job: LabelJob {
                vid: "L00001".to_string(),
                force: true,
                ..Default::default()
            },
        };
        write_payload(fx.daemon_cmd.as_fd(), &rqst).unwrap();

        assert!(fx.forker.handle_msg().unwrap());
        let forked: ForkSucceeded = read_reply(&fx.daemon_cmd).parse().unwrap();
        assert_eq!(fx.forker.children(), &[Pid::from_raw(forked.pid)]);

        reap_all(&mut fx.forker);
        let exited: ProcessExited = read_reply(&fx.daemon_reaper).parse().unwrap();
        assert_eq!(exited.pid, forked.pid);
        assert_eq!(exited.exit_code, EndOfSessionAction::MarkDriveAsUp.exit_code());
    }

    #[test]
    fn test_failed_cleaner_marks_drive_down() {
        let runner = |_: &SessionRequest| -> Result<EndOfSessionAction> { anyhow::bail!("no media") };
        let mut fx = fixture(Box::new(runner));
        let rqst = ForkCleaner {
            drive: drive(),
            vid: String::new(),
            wait_media_in_drive: false,
            wait_media_in_drive_timeout: 0,
        };
        write_payload(fx.daemon_cmd.as_fd(), &rqst).unwrap();

        assert!(fx.forker.handle_msg().unwrap());
        let forked: ForkSucceeded = read_reply(&fx.daemon_cmd).parse().unwrap();

        reap_all(&mut fx.forker);
        let exited: ProcessExited = read_reply(&fx.daemon_reaper).parse().unwrap();
        assert_eq!(exited.pid, forked.pid);
        assert_eq!(exited.exit_code, EndOfSessionAction::MarkDriveAsDown.exit_code());
    }

    #[test]
    fn test_crashed_session_is_reported() {
        let runner = |_: &SessionRequest| -> Result<EndOfSessionAction> { std::process::abort() };
        let mut fx = fixture(Box::new(runner));
        write_payload(fx.daemon_cmd.as_fd(), &ForkDataTransfer { drive: drive() }).unwrap();

        assert!(fx.forker.handle_msg().unwrap());
        let forked: ForkSucceeded = read_reply(&fx.daemon_cmd).parse().unwrap();

        reap_all(&mut fx.forker);
        let crashed: ProcessCrashed = read_reply(&fx.daemon_reaper).parse().unwrap();
        assert_eq!(crashed.pid, forked.pid);
        assert_eq!(crashed.signal, libc::SIGABRT);
    }

    #[test]
    fn test_exception_message_fits_a_frame() {
        let err = ForkerError::Remote {
            code: 7,
            message: "é".repeat(MAX_PAYLOAD_LEN),
        };
        let ex = exception_for(&err);
        assert!(ex.message.len() <= MAX_EXCEPTION_MESSAGE_LEN);
        assert_eq!(ex.code, 7);
        assert!(ProcessForkerFrame::from_payload(&ex).unwrap().payload.len() <= MAX_PAYLOAD_LEN);
    }
}
