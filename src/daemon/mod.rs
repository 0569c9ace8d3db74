//! Tape-server daemon plumbing around the ProcessForker
//!
//! - `protocol`: message catalogue and payload schemas
//! - `frame`: framed codec (type + length + bincode payload) with read timeouts
//! - `socket`: exclusively owned control socket
//! - `forker`: the ProcessForker service loop
//! - `session`: sessions run by the forker's children
//! - `proxy`: daemon side of the command channel
//! - `reaper`: reactor handler for the reaper channel
//! - `spawn`: forking the ProcessForker out of the daemon
//! - `config`: tapeserverd.conf parsing

pub mod config;
pub mod forker;
pub mod frame;
pub mod protocol;
pub mod proxy;
pub mod reaper;
pub mod session;
pub mod socket;
pub mod spawn;

pub use config::DaemonConfig;
pub use forker::{ForkerConfig, ForkerOutcome, ProcessForker};
pub use frame::{read_frame, write_frame, write_payload, ProcessForkerFrame, MAX_PAYLOAD_LEN};
pub use protocol::{msg_type_to_string, DriveConfig, LabelJob, MsgType, Payload};
pub use proxy::{ProcessForkerProxy, ProcessForkerProxySocket};
pub use reaper::{ProcessEvent, ReaperHandler};
pub use session::{CommandSessionRunner, EndOfSessionAction, SessionRequest, SessionRunner};
pub use socket::ControlSocket;
pub use spawn::{spawn_process_forker, wait_for_forker, ForkerHandle};
