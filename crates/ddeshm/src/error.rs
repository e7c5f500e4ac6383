//! Error types for the DDE subsystem.
//!
//! Failures here degrade one operation, never the process: a failed send,
//! atom insertion or lock acquisition is reported to the caller and the
//! context stays usable.

use ddeshm_mem::MemError;
use std::fmt;

/// Errors that can occur in the DDE subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A fixed-capacity table or arena chain has no room left.
    ResourceExhausted {
        /// What ran out ("process slots", "windows", "handles", ...).
        what: &'static str,
    },

    /// The target process no longer exists.
    PeerUnavailable {
        /// Pid of the vanished process.
        pid: i32,
    },

    /// No acknowledgment arrived before the deadline.
    Timeout {
        /// How long the sender waited.
        waited_ms: u64,
    },

    /// A semaphore operation failed for a reason other than interruption.
    LockDegraded {
        /// Which lock operation failed.
        op: &'static str,
        /// The `errno` reported by `semop`.
        errno: i32,
    },

    /// An IPC system call failed.
    Os {
        /// The failing call.
        call: &'static str,
        /// The reported `errno`.
        errno: i32,
    },

    /// A DDE handle is not allocated.
    InvalidHandle {
        /// The rejected handle value.
        handle: u32,
    },

    /// A window handle is not registered.
    InvalidWindow {
        /// The rejected window handle.
        hwnd: u32,
    },

    /// The shared segment under the well-known key is not ours.
    BadMainBlock {
        /// Why attaching was refused.
        reason: &'static str,
    },

    /// Too many inbound messages serviced while waiting for an ACK.
    NestingTooDeep {
        /// Nesting depth reached.
        depth: u32,
    },

    /// Invalid configuration.
    Config(String),

    /// Error from the memory primitives.
    Mem(MemError),
}

impl Error {
    /// Builds an [`Error::Os`] from the current `errno`.
    pub(crate) fn last_os(call: &'static str) -> Self {
        Error::Os {
            call,
            errno: errno(),
        }
    }
}

/// The calling thread's current `errno`.
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted { what } => write!(f, "Resource exhausted: no free {what}"),
            Error::PeerUnavailable { pid } => {
                write!(f, "Peer process {pid} is not running")
            }
            Error::Timeout { waited_ms } => {
                write!(f, "No acknowledgment within {waited_ms} ms")
            }
            Error::LockDegraded { op, errno } => {
                write!(
                    f,
                    "Lock operation {op} failed: {}",
                    std::io::Error::from_raw_os_error(*errno)
                )
            }
            Error::Os { call, errno } => {
                write!(f, "{call} failed: {}", std::io::Error::from_raw_os_error(*errno))
            }
            Error::InvalidHandle { handle } => write!(f, "Invalid DDE handle {handle:#x}"),
            Error::InvalidWindow { hwnd } => write!(f, "Invalid window handle {hwnd:#x}"),
            Error::BadMainBlock { reason } => write!(f, "Refusing main block: {reason}"),
            Error::NestingTooDeep { depth } => {
                write!(f, "Message nesting too deep ({depth} levels)")
            }
            Error::Config(msg) => write!(f, "Invalid configuration: {msg}"),
            Error::Mem(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Mem(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MemError> for Error {
    fn from(err: MemError) -> Self {
        match err {
            MemError::TableFull => Error::ResourceExhausted { what: "table slots" },
            other => Error::Mem(other),
        }
    }
}

/// Result type for DDE operations.
pub type Result<T> = std::result::Result<T, Error>;
