//! Shutdown signals for the daemon main loop
//!
//! SIGINT, SIGTERM and SIGHUP are collected by a signal-hook thread that sets
//! a flag; the main loop checks it between `handle_events` calls.

use anyhow::{Context, Result};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

pub const SHUTDOWN_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGHUP];

/// Signal state shared between the main thread and the signal thread
#[derive(Clone, Default)]
pub struct ShutdownSignals {
    shutdown_flag: Arc<AtomicBool>,
    signal_number: Arc<AtomicI32>,
}

impl ShutdownSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening for the shutdown signals
    ///
    /// Must be called after the ProcessForker has been forked so that the
    /// forker does not inherit the handlers.
    pub fn setup(&self) -> Result<()> {
        let mut signals =
            Signals::new(SHUTDOWN_SIGNALS).context("Failed to install shutdown signal handlers")?;
        let shutdown_flag = Arc::clone(&self.shutdown_flag);
        let signal_number = Arc::clone(&self.signal_number);

        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                for sig in signals.forever() {
                    signal_number.store(sig, Ordering::SeqCst);
                    shutdown_flag.store(true, Ordering::SeqCst);
                }
            })
            .context("Failed to spawn signal thread")?;

        Ok(())
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// The last shutdown signal received, 0 if none
    pub fn signal_number(&self) -> i32 {
        self.signal_number.load(Ordering::SeqCst)
    }

    /// Get the exit code for the received signal
    pub fn exit_code(&self) -> i32 {
        match self.signal_number() {
            0 => 0,
            sig => 128 + sig,
        }
    }
}
