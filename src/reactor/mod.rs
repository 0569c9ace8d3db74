//! Single-threaded `poll()` reactor
//!
//! The reactor owns a set of [`PollEventHandler`]s keyed by file descriptor.
//! Each call to [`PollReactor::handle_events`] builds a poll set from the
//! registered handlers, waits once, and dispatches every descriptor that
//! reported activity to its handler. The caller drives the loop; the reactor
//! never loops on its own.
//!
//! Not thread-safe: confine every call to one thread.

pub mod handler;

pub use handler::{PollEventHandler, PollRequest};

use crate::error::ReactorError;
use log::{debug, log, Level};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;

/// A handler the reactor refused to take ownership of, handed back to the caller
pub struct Rejected {
    pub error: ReactorError,
    handler: Box<dyn PollEventHandler>,
}

impl Rejected {
    pub fn into_handler(self) -> Box<dyn PollEventHandler> {
        self.handler
    }
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .field("handler", &self.handler)
            .finish()
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for Rejected {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Registry of event handlers multiplexed over one `poll()` call
#[derive(Default)]
pub struct PollReactor {
    handlers: BTreeMap<RawFd, Box<dyn PollEventHandler>>,
}

impl PollReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `handler`
    ///
    /// Fails if a handler is already registered for the same descriptor, in
    /// which case the registry is untouched and the handler is returned inside
    /// the error.
    pub fn register_handler(&mut self, handler: Box<dyn PollEventHandler>) -> Result<(), Rejected> {
        let fd = handler.fd();
        match self.handlers.entry(fd) {
            Entry::Occupied(_) => Err(Rejected {
                error: ReactorError::AlreadyRegistered { fd },
                handler,
            }),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                debug!("Registered event handler: fd={}", fd);
                Ok(())
            }
        }
    }

    /// Remove the handler registered for `fd` and give it back to the caller
    ///
    /// Only a registry operation: whether the handler is then dropped is up to
    /// the caller.
    pub fn remove_handler(&mut self, fd: RawFd) -> Result<Box<dyn PollEventHandler>, ReactorError> {
        let handler = self
            .handlers
            .remove(&fd)
            .ok_or(ReactorError::NotRegistered { fd })?;
        debug!("Removed event handler: fd={}", fd);
        Ok(handler)
    }

    /// Wait at most `timeout_ms` for activity and dispatch it
    ///
    /// A negative timeout blocks until some descriptor is ready, zero returns
    /// immediately. A failing `poll()` is logged and the cycle skipped.
    pub fn handle_events(&mut self, timeout_ms: i32) -> Result<(), ReactorError> {
        let mut fds = self.build_poll_fds()?;

        // SAFETY: `fds` holds `fds.len()` initialised pollfd entries and stays
        // alive and unaliased for the duration of the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        match rc {
            0 => Ok(()),
            -1 => {
                let err = io::Error::last_os_error();
                log!(
                    poll_failure_level(&err),
                    "Failed to poll event handlers: errno={} message={}",
                    err.raw_os_error().unwrap_or(0),
                    err
                );
                Ok(())
            }
            _ => self.dispatch_event_handlers(&fds),
        }
    }

    /// Drop every registered handler. Idempotent.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.handlers.contains_key(&fd)
    }

    /// Registered descriptors in dispatch order
    pub fn registered_fds(&self) -> Vec<RawFd> {
        self.handlers.keys().copied().collect()
    }

    fn build_poll_fds(&self) -> Result<Vec<PollRequest>, ReactorError> {
        let nb_handlers = self.handlers.len();
        let mut fds = Vec::new();
        fds.try_reserve_exact(nb_handlers)
            .map_err(|_| ReactorError::OutOfMemory { nb_handlers })?;

        for handler in self.handlers.values() {
            let mut request = PollRequest {
                fd: -1,
                events: 0,
                revents: 0,
            };
            handler.fill_poll_request(&mut request);
            fds.push(request);
        }
        Ok(fds)
    }

    fn dispatch_event_handlers(&mut self, fds: &[PollRequest]) -> Result<(), ReactorError> {
        for request in fds.iter().filter(|r| r.revents != 0) {
            let fd = request.fd;
            let handler = self
                .handlers
                .get_mut(&fd)
                .ok_or(ReactorError::HandlerMissing { fd })?;

            let remove = handler
                .handle_event(request)
                .map_err(|source| ReactorError::HandlerFailed { fd, source })?;

            if remove {
                // Out of the registry before its Drop runs
                if let Some(handler) = self.handlers.remove(&fd) {
                    debug!("Removing event handler at its own request: fd={}", fd);
                    drop(handler);
                }
            }
        }
        Ok(())
    }
}

/// A signal interrupting poll() is routine in a daemon, anything else is not
fn poll_failure_level(err: &io::Error) -> Level {
    if err.kind() == io::ErrorKind::Interrupted {
        Level::Debug
    } else {
        Level::Error
    }
}

impl fmt::Debug for PollReactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollReactor")
            .field("fds", &self.registered_fds())
            .finish()
    }
}
