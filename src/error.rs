//! Error kinds the runtime can hand back to a caller.
//!
//! Only recoverable conditions surface here: syscall failures during setup
//! or event (de)registration, and caller misuse that can be refused without
//! touching any state. Context-switch failures are not represented; they
//! are fatal and assert in place.

use std::io;
use std::os::unix::io::RawFd;

use crate::reactor::Event;

/// Represents all error cases this crate may return.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The (fd, event) pair already has a waiter armed. The registration is
    /// refused and the existing waiter is untouched.
    #[error("event {event:?} is already registered for fd {fd}")]
    EventRegistered { fd: RawFd, event: Event },

    #[error("failed to spawn thread {name}: {inner}")]
    ThreadSpawn { name: String, inner: io::Error },
}

/// A specialized [`Result`] type for this crate.
///
/// [`Result`]: std::result::Result
pub type Result<T> = std::result::Result<T, Error>;
