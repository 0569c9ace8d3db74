//! ProcessForker message catalogue
//!
//! Every frame exchanged between the tape-server daemon and its ProcessForker
//! carries a numeric message-type tag followed by a bincode payload:
//!
//! ```text
//! ┌──────────────┬────────────────┬──────────────────────────┐
//! │ Message type │ Payload length │  Payload (bincode)       │
//! │  (4 bytes)   │   (4 bytes)    │  (1..=MAX_PAYLOAD_LEN)   │
//! └──────────────┴────────────────┴──────────────────────────┘
//! ```
//!
//! Both header fields are unsigned 32-bit integers in host byte order. The
//! protocol only ever runs over a Unix socket pair between a process and its
//! own fork, so the byte order is never normalized.
//!
//! Message flows:
//! - Command channel, daemon → forker: [`StopProcessForker`], [`ForkDataTransfer`],
//!   [`ForkLabel`], [`ForkCleaner`]
//! - Command channel, forker → daemon: [`ReturnValue`], [`ForkSucceeded`], [`Exception`]
//! - Reaper channel, forker → daemon: [`ProcessExited`], [`ProcessCrashed`]

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name reported for tags outside the catalogue
pub const UNKNOWN_MSG_TYPE: &str = "UNKNOWN";

/// Message-type tags carried in the first word of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    Exception = 1,
    ForkCleaner = 2,
    ForkDataTransfer = 3,
    ForkLabel = 4,
    ForkSucceeded = 5,
    ProcessCrashed = 6,
    ProcessExited = 7,
    ReturnValue = 8,
    StopProcessForker = 9,
    Status = 10,
}

impl MsgType {
    pub const ALL: [MsgType; 10] = [
        MsgType::Exception,
        MsgType::ForkCleaner,
        MsgType::ForkDataTransfer,
        MsgType::ForkLabel,
        MsgType::ForkSucceeded,
        MsgType::ProcessCrashed,
        MsgType::ProcessExited,
        MsgType::ReturnValue,
        MsgType::StopProcessForker,
        MsgType::Status,
    ];

    /// Map a wire tag back onto the catalogue
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_u32() == value)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Human-readable name used in log messages
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Exception => "Exception",
            MsgType::ForkCleaner => "ForkCleaner",
            MsgType::ForkDataTransfer => "ForkDataTransfer",
            MsgType::ForkLabel => "ForkLabel",
            MsgType::ForkSucceeded => "ForkSucceeded",
            MsgType::ProcessCrashed => "ProcessCrashed",
            MsgType::ProcessExited => "ProcessExited",
            MsgType::ReturnValue => "ReturnValue",
            MsgType::StopProcessForker => "StopProcessForker",
            MsgType::Status => "Status",
        }
    }

    /// Reverse of [`MsgType::as_str`]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of a raw wire tag. Never fails: tags from a newer or older peer map to
/// [`UNKNOWN_MSG_TYPE`].
pub fn msg_type_to_string(value: u32) -> &'static str {
    MsgType::from_u32(value)
        .map(MsgType::as_str)
        .unwrap_or(UNKNOWN_MSG_TYPE)
}

/// A typed payload schema bound to exactly one message-type tag
pub trait Payload: Serialize + DeserializeOwned {
    const MSG_TYPE: MsgType;
}

macro_rules! payload {
    ($ty:ident) => {
        impl Payload for $ty {
            const MSG_TYPE: MsgType = MsgType::$ty;
        }
    };
}

/// Tape-drive configuration shipped with every fork request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unit name of the drive, e.g. "T10D6116"
    pub unit_name: String,
    pub logical_library: String,
    /// Path of the tape device, e.g. "/dev/nst0"
    pub dev_filename: String,
    /// Location of the drive inside its library, e.g. "smc5"
    pub library_slot: String,
}

/// Parameters of a tape labelling job
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelJob {
    pub vid: String,
    /// Overwrite an already labelled tape
    pub force: bool,
    /// Logical block protection
    pub lbp: bool,
    pub uid: u32,
    pub gid: u32,
}

/// Ask the ProcessForker to leave its main loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopProcessForker {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkDataTransfer {
    pub drive: DriveConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkLabel {
    pub drive: DriveConfig,
    pub job: LabelJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkCleaner {
    pub drive: DriveConfig,
    /// Volume believed to be in the drive; empty when unknown
    pub vid: String,
    pub wait_media_in_drive: bool,
    /// Seconds to wait for media when `wait_media_in_drive` is set
    pub wait_media_in_drive_timeout: u32,
}

/// Reply to a fork request carrying the pid of the new session process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkSucceeded {
    pub pid: i32,
}

/// Reaper notification: a session process exited normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExited {
    pub pid: i32,
    pub exit_code: i32,
}

/// Reaper notification: a session process was killed by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCrashed {
    pub pid: i32,
    pub signal: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnValue {
    pub value: u32,
}

/// Generic failure reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    pub code: u32,
    pub message: String,
}

payload!(StopProcessForker);
payload!(ForkDataTransfer);
payload!(ForkLabel);
payload!(ForkCleaner);
payload!(ForkSucceeded);
payload!(ProcessExited);
payload!(ProcessCrashed);
payload!(ReturnValue);
payload!(Exception);
