//! Capability implemented by everything the reactor can wait on

use std::fmt;
use std::os::fd::RawFd;

/// One entry of the array handed to `poll()`
pub type PollRequest = libc::pollfd;

/// A pollable entity owning exactly one file descriptor
///
/// Once registered with a [`PollReactor`](super::PollReactor) the handler is
/// owned by the reactor, which drops it on `clear()`, on its own drop, or right
/// after `handle_event` returns `Ok(true)`.
pub trait PollEventHandler {
    /// Descriptor this handler is registered under
    fn fd(&self) -> RawFd;

    /// Fill in `fd` and `events` for the next `poll()` call
    fn fill_poll_request(&self, request: &mut PollRequest);

    /// Handle the events reported in `request.revents`
    ///
    /// Returns `Ok(true)` when the reactor should remove and drop this handler.
    fn handle_event(&mut self, request: &PollRequest) -> anyhow::Result<bool>;
}

impl fmt::Debug for dyn PollEventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollEventHandler").field("fd", &self.fd()).finish()
    }
}

/// Request for input readiness on `fd`
pub fn fill_read_request(fd: RawFd, request: &mut PollRequest) {
    request.fd = fd;
    request.events = libc::POLLIN;
    request.revents = 0;
}

pub fn is_readable(request: &PollRequest) -> bool {
    request.revents & libc::POLLIN != 0
}

/// Peer hung up, the descriptor errored or it is not open at all
pub fn is_broken(request: &PollRequest) -> bool {
    request.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
}
