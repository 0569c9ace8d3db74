//! Tape sessions run by the children of the ProcessForker
//!
//! What a session actually does to the drive is up to the [`SessionRunner`].
//! The forker only needs to know how to start one and what the exit code of
//! the session process means to the daemon.

use crate::daemon::protocol::{DriveConfig, ForkCleaner, ForkDataTransfer, ForkLabel, LabelJob};
use anyhow::{anyhow, bail, Context, Result};
use log::info;
use std::fmt;
use std::process::Command;

/// What the daemon should do with the drive once a session process exits.
/// Carried as the exit code of the session process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EndOfSessionAction {
    MarkDriveAsUp = 0,
    MarkDriveAsDown = 1,
    CleanDrive = 2,
}

impl EndOfSessionAction {
    pub fn exit_code(self) -> i32 {
        self as i32
    }

    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(EndOfSessionAction::MarkDriveAsUp),
            1 => Some(EndOfSessionAction::MarkDriveAsDown),
            2 => Some(EndOfSessionAction::CleanDrive),
            _ => None,
        }
    }
}

impl fmt::Display for EndOfSessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndOfSessionAction::MarkDriveAsUp => "MARK_DRIVE_AS_UP",
            EndOfSessionAction::MarkDriveAsDown => "MARK_DRIVE_AS_DOWN",
            EndOfSessionAction::CleanDrive => "CLEAN_DRIVE",
        };
        f.write_str(name)
    }
}

/// A session the daemon asked the forker to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    DataTransfer {
        drive: DriveConfig,
    },
    Label {
        drive: DriveConfig,
        job: LabelJob,
    },
    Cleaner {
        drive: DriveConfig,
        vid: String,
        wait_media_in_drive: bool,
        wait_media_in_drive_timeout: u32,
    },
}

impl SessionRequest {
    /// Short name of the session kind, also used as the process role in logs
    pub fn kind(&self) -> &'static str {
        match self {
            SessionRequest::DataTransfer { .. } => "transfer",
            SessionRequest::Label { .. } => "label",
            SessionRequest::Cleaner { .. } => "cleaner",
        }
    }

    pub fn drive(&self) -> &DriveConfig {
        match self {
            SessionRequest::DataTransfer { drive }
            | SessionRequest::Label { drive, .. }
            | SessionRequest::Cleaner { drive, .. } => drive,
        }
    }

    /// Volume the session works on; empty when not known in advance
    pub fn vid(&self) -> &str {
        match self {
            SessionRequest::DataTransfer { .. } => "",
            SessionRequest::Label { job, .. } => &job.vid,
            SessionRequest::Cleaner { vid, .. } => vid,
        }
    }

    /// Exit code of a session process whose runner failed
    ///
    /// A failed cleaner leaves the drive in an unknown state so it is taken
    /// down. Any other failed session asks for a cleaning.
    pub fn on_error_action(&self) -> EndOfSessionAction {
        match self {
            SessionRequest::Cleaner { .. } => EndOfSessionAction::MarkDriveAsDown,
            _ => EndOfSessionAction::CleanDrive,
        }
    }
}

impl From<ForkDataTransfer> for SessionRequest {
    fn from(msg: ForkDataTransfer) -> Self {
        SessionRequest::DataTransfer { drive: msg.drive }
    }
}

impl From<ForkLabel> for SessionRequest {
    fn from(msg: ForkLabel) -> Self {
        SessionRequest::Label {
            drive: msg.drive,
            job: msg.job,
        }
    }
}

impl From<ForkCleaner> for SessionRequest {
    fn from(msg: ForkCleaner) -> Self {
        SessionRequest::Cleaner {
            drive: msg.drive,
            vid: msg.vid,
            wait_media_in_drive: msg.wait_media_in_drive,
            wait_media_in_drive_timeout: msg.wait_media_in_drive_timeout,
        }
    }
}

/// Runs a session inside a freshly forked session process
pub trait SessionRunner {
    fn run_session(&mut self, request: &SessionRequest) -> Result<EndOfSessionAction>;
}

impl<F> SessionRunner for F
where
    F: FnMut(&SessionRequest) -> Result<EndOfSessionAction>,
{
    fn run_session(&mut self, request: &SessionRequest) -> Result<EndOfSessionAction> {
        self(request)
    }
}

/// Runs an external program for every session
///
/// The program is invoked as `<command> <kind> <unit-name> <dev-filename> [vid]`
/// and its exit code is read back as an [`EndOfSessionAction`].
#[derive(Debug, Clone, Default)]
pub struct CommandSessionRunner {
    command: Option<String>,
}

impl CommandSessionRunner {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    fn build_command(&self, request: &SessionRequest) -> Result<Command> {
        let program = self
            .command
            .as_deref()
            .ok_or_else(|| anyhow!("No session command configured"))?;

        let drive = request.drive();
        let mut cmd = Command::new(program);
        cmd.arg(request.kind())
            .arg(&drive.unit_name)
            .arg(&drive.dev_filename);
        if !request.vid().is_empty() {
            cmd.arg(request.vid());
        }
        Ok(cmd)
    }
}

impl SessionRunner for CommandSessionRunner {
    fn run_session(&mut self, request: &SessionRequest) -> Result<EndOfSessionAction> {
        let mut cmd = self.build_command(request)?;
        info!(
            "Starting {} session: unitName={} TPVID={}",
            request.kind(),
            request.drive().unit_name,
            request.vid()
        );

        let status = cmd
            .status()
            .with_context(|| format!("Failed to run {} session command", request.kind()))?;

        let Some(code) = status.code() else {
            bail!("{} session command was killed: {}", request.kind(), status);
        };
        EndOfSessionAction::from_exit_code(code).ok_or_else(|| {
            anyhow!(
                "{} session command returned an unknown end-of-session action: exitCode={}",
                request.kind(),
                code
            )
        })
    }
}
