//! Tape-server daemon binary
//!
//! Forks the ProcessForker, then waits on the reaper channel until asked to
//! shut down or until the forker goes away.

use anyhow::{anyhow, bail, Context, Result};
use log::{error, info, warn};
use std::env;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::process;
use tapeserver::daemon::{
    spawn_process_forker, wait_for_forker, CommandSessionRunner, DaemonConfig,
    EndOfSessionAction, ForkerHandle, ProcessEvent, ProcessForkerProxy, ReaperHandler,
};
use tapeserver::logging;
use tapeserver::reactor::PollReactor;
use tapeserver::signal::ShutdownSignals;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    if let Err(e) = run() {
        eprintln!("tapeserverd: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        print_usage();
        bail!("Too many arguments");
    }
    if matches!(args.get(1).map(String::as_str), Some("-h" | "--help")) {
        print_usage();
        return Ok(());
    }

    logging::init();

    let config = match args.get(1) {
        Some(path) => DaemonConfig::from_file(Path::new(path))
            .ok_or_else(|| anyhow!("Failed to read configuration file {}", path))?,
        None => DaemonConfig::load(),
    };
    info!(
        "Starting tapeserverd: nbDrives={} forkerReplyTimeout={:?} reactorTimeoutMs={}",
        config.drives.len(),
        config.forker_reply_timeout,
        config.reactor_timeout_ms
    );
    for drive in &config.drives {
        info!(
            "Configured drive: unitName={} logicalLibrary={} devFilename={} librarySlot={}",
            drive.unit_name, drive.logical_library, drive.dev_filename, drive.library_slot
        );
    }

    // Fork before any thread exists
    let runner = CommandSessionRunner::new(config.session_command.clone());
    let ForkerHandle {
        pid: forker_pid,
        mut proxy,
        reaper_socket,
    } = spawn_process_forker(
        Box::new(runner),
        config.forker_config(),
        config.forker_reply_timeout,
    )
    .context("Failed to start ProcessForker")?;

    let signals = ShutdownSignals::new();
    signals.setup()?;

    let mut reactor = PollReactor::new();
    let reaper_fd = reaper_socket.as_raw_fd();
    let reaper = ReaperHandler::new(
        reaper_socket,
        config.forker_reply_timeout,
        Box::new(log_process_event),
    );
    reactor
        .register_handler(Box::new(reaper))
        .map_err(|rejected| rejected.error)?;

    while !signals.should_shutdown() {
        reactor.handle_events(config.reactor_timeout_ms)?;

        if !reactor.is_registered(reaper_fd) {
            error!("ProcessForker closed its reaper socket: pid={}", forker_pid);
            wait_for_forker(forker_pid)?;
            bail!("ProcessForker terminated unexpectedly: pid={}", forker_pid);
        }
    }

    info!(
        "Shutting down tapeserverd: signal={}",
        signals.signal_number()
    );
    if let Err(e) = proxy.stop_process_forker("tapeserverd is shutting down") {
        warn!("Failed to stop ProcessForker gracefully: {}", e);
    }
    wait_for_forker(forker_pid)?;
    reactor.clear();

    info!("tapeserverd stopped");
    Ok(())
}

fn log_process_event(event: ProcessEvent) {
    match event {
        ProcessEvent::Exited { pid, exit_code } => match EndOfSessionAction::from_exit_code(exit_code) {
            Some(action) => info!("Session process finished: pid={} action={}", pid, action),
            None => warn!(
                "Session process exited with an unknown code: pid={} exitCode={}",
                pid, exit_code
            ),
        },
        ProcessEvent::Crashed { pid, signal } => {
            error!("Session process crashed: pid={} signal={}", pid, signal)
        }
    }
}

fn print_usage() {
    println!("Usage: tapeserverd [CONFIG]");
    println!();
    println!("Runs the tape-server daemon and its ProcessForker.");
    println!();
    println!("CONFIG defaults to $TAPESERVERD_CONFIG, then /etc/tapeserverd.conf,");
    println!("then tapeserverd.conf in the user configuration directory.");
    println!("Set TAPESERVERD_LOG to change the log filter (default: info).");
}
