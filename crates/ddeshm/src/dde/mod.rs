//! Cross-process DDE over SysV shared memory.
//!
//! One [`DdeContext`] per process attaches the shared main block, which
//! holds the process registry, the window remap table, the atom table and
//! the handle table. Messages travel on per-process queues; a signal only
//! wakes the receiver.
//!
//! ```no_run
//! use ddeshm::{DdeConfig, DdeContext, Message};
//!
//! let mut ctx = DdeContext::attach(DdeConfig::default())?;
//! let remote = ctx.register_window(0x1001)?;
//! ctx.set_handler(|_ctx, msg| i64::from(msg.message));
//!
//! let result = ctx.send(remote, &Message::new(0x3E0).wparam(1))?;
//! assert_eq!(result, 0x3E0);
//! # Ok::<(), ddeshm::Error>(())
//! ```

mod atoms;
mod context;
mod handle;
mod main_block;
mod message;
mod window;

pub use context::DdeContext;
pub use handle::{HandleInfo, HandleView};

use ddeshm_mem::{ArenaStats, HashStats};
use std::fmt;

/// Capacity of the process registry.
pub const MAX_PROCS: usize = 64;
/// Capacity of the window remap table.
pub const MAX_WINDOWS: usize = 64;
/// Capacity of the handle table.
pub const MAX_HANDLES: usize = 1024;
/// Value of the first DDE handle.
pub const HANDLE_BASE: u32 = 0x4000;
/// Highest synthetic remote window handle; the rest count down from here.
pub const REMOTE_HWND_TOP: u32 = 0xFFFE;
/// Target addressing every other registered process.
pub const BROADCAST: u32 = 0xFFFF;
/// Handle flag: the block may be attached by other processes.
pub const HANDLE_DDESHARE: u32 = 0x2000;

/// A shared memory block handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DdeHandle(u32);

impl DdeHandle {
    /// Wraps a raw handle value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Bit index in the handle table, `None` outside the handle range.
    pub(crate) fn bit(self) -> Option<usize> {
        let bit = self.0.checked_sub(HANDLE_BASE)? as usize;
        (bit < MAX_HANDLES).then_some(bit)
    }

    pub(crate) const fn from_bit(bit: usize) -> Self {
        Self(HANDLE_BASE + bit as u32)
    }
}

impl fmt::Debug for DdeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DdeHandle({:#x})", self.0)
    }
}

impl fmt::Display for DdeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How a message was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Synchronous: the sender waits for the handler's result.
    Send,
    /// Asynchronous: acknowledged later, result discarded.
    Post,
}

/// An inbound message as seen by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdeMessage {
    /// Delivery mode.
    pub kind: MessageKind,
    /// Local handle of the target window, or [`BROADCAST`].
    pub hwnd: u32,
    /// Remote handle of the sending window, if the sender named one.
    pub source: Option<u32>,
    /// Pid of the sender.
    pub sender_pid: i32,
    /// Message id.
    pub message: u32,
    /// First parameter.
    pub wparam: u64,
    /// Second parameter.
    pub lparam: u64,
}

/// An outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Message id.
    pub id: u32,
    /// First parameter.
    pub wparam: u64,
    /// Second parameter.
    pub lparam: u64,
    /// Local handle of the sending window.
    pub source: Option<u32>,
}

impl Message {
    /// A message with zero parameters and no source window.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self {
            id,
            wparam: 0,
            lparam: 0,
            source: None,
        }
    }

    #[must_use]
    pub const fn wparam(mut self, wparam: u64) -> Self {
        self.wparam = wparam;
        self
    }

    #[must_use]
    pub const fn lparam(mut self, lparam: u64) -> Self {
        self.lparam = lparam;
        self
    }

    /// Names the sending window. It is mapped to a remote handle before
    /// transmission.
    #[must_use]
    pub const fn from_window(mut self, local: u32) -> Self {
        self.source = Some(local);
        self
    }
}

/// Per-context message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageStats {
    pub sent: u64,
    pub posted: u64,
    pub received: u64,
    pub acks: u64,
    pub timeouts: u64,
    pub stale_reaped: u64,
    pub stray_acks: u64,
}

/// A registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Registry slot.
    pub index: usize,
    pub pid: i32,
    /// Windows it has mapped.
    pub windows: u32,
    /// Result of the liveness probe at snapshot time.
    pub alive: bool,
}

/// A mapped window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowInfo {
    /// Synthetic handle used by other processes.
    pub remote: u32,
    /// Handle in the owning process.
    pub local: u32,
    /// Pid of the owning process.
    pub pid: i32,
}

/// Point-in-time view of the shared state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub processes: Vec<ProcessInfo>,
    pub windows: Vec<WindowInfo>,
    pub atoms: HashStats,
    /// Allocated DDE handles.
    pub handles: usize,
    /// Main block arena.
    pub arena: ArenaStats,
}
