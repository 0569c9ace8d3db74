//! Forking the ProcessForker out of the daemon

use crate::daemon::forker::{ForkerConfig, ProcessForker};
use crate::daemon::proxy::ProcessForkerProxySocket;
use crate::daemon::session::SessionRunner;
use crate::error::ForkerError;
use log::{info, warn};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Daemon side of a running ProcessForker
#[derive(Debug)]
pub struct ForkerHandle {
    pub pid: Pid,
    /// Command channel
    pub proxy: ProcessForkerProxySocket,
    /// Daemon end of the reaper channel, usually handed to a `ReaperHandler`
    pub reaper_socket: UnixStream,
}

/// Create the command and reaper socket pairs and fork the ProcessForker
///
/// The child runs the forker main loop and exits with
/// [`ForkerOutcome::exit_code`](crate::daemon::forker::ForkerOutcome::exit_code).
pub fn spawn_process_forker(
    runner: Box<dyn SessionRunner>,
    config: ForkerConfig,
    reply_timeout: Duration,
) -> Result<ForkerHandle, ForkerError> {
    let (daemon_cmd, forker_cmd) = UnixStream::pair().map_err(|source| ForkerError::SocketPair {
        what: "command",
        source,
    })?;
    let (daemon_reaper, forker_reaper) =
        UnixStream::pair().map_err(|source| ForkerError::SocketPair {
            what: "reaper",
            source,
        })?;

    // SAFETY: the child only runs the forker loop on its own sockets and
    // leaves through _exit.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(forker_cmd);
            drop(forker_reaper);
            info!("Forked ProcessForker: pid={}", child);
            Ok(ForkerHandle {
                pid: child,
                proxy: ProcessForkerProxySocket::with_reply_timeout(daemon_cmd, reply_timeout),
                reaper_socket: daemon_reaper,
            })
        }
        Ok(ForkResult::Child) => {
            drop(daemon_cmd);
            drop(daemon_reaper);
            ignore_terminal_signals();
            let outcome = {
                let mut forker = ProcessForker::new(forker_cmd, forker_reaper, runner, config);
                forker.execute()
            };
            // SAFETY: _exit skips the atexit handlers and stdio buffers
            // inherited from the daemon, which must only run there.
            unsafe { libc::_exit(outcome.exit_code()) }
        }
        Err(source) => Err(ForkerError::Fork {
            what: "ProcessForker",
            source,
        }),
    }
}

/// The daemon decides when the forker stops, not a Ctrl-C on the terminal
fn ignore_terminal_signals() {
    for sig in [Signal::SIGINT, Signal::SIGHUP] {
        // SAFETY: SIG_IGN installs no handler code.
        if let Err(e) = unsafe { signal(sig, SigHandler::SigIgn) } {
            warn!("ProcessForker failed to ignore {}: {}", sig, e);
        }
    }
}

/// Block until the ProcessForker has exited
pub fn wait_for_forker(pid: Pid) -> Result<WaitStatus, ForkerError> {
    let status = waitpid(pid, None).map_err(|source| ForkerError::Wait {
        pid: pid.as_raw(),
        source,
    })?;
    info!("ProcessForker terminated: pid={} status={:?}", pid, status);
    Ok(status)
}
