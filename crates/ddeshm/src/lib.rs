//! `ddeshm`: inter-process DDE over SysV shared memory
//!
//! Cooperating processes exchange window messages and share memory blocks
//! through one shared main block:
//!
//! - **Process registry**: per-process message queue, semaphore and owned
//!   arena chain, reaped lazily when a liveness probe fails
//! - **Window remap**: local window handles mapped to synthetic handles
//!   valid in every process
//! - **Messages**: synchronous SEND with ACK and timeout, asynchronous
//!   POST, broadcast
//! - **Atoms**: shared, case-insensitive, refcounted string table
//! - **Handles**: shared memory blocks addressed by a 1024-entry table
//!
//! # Architecture
//!
//! - [`ipc`]: thin wrappers over `shm*`, `sem*`, `msg*` and the wake-up
//!   signal
//! - [`dde`]: the main block and the per-process [`DdeContext`]
//! - `ddeshm_mem`: allocator and tables working on raw memory
//!
//! Every mutation of shared state happens under a crash-safe
//! reader/writer semaphore whose holders are undone by the kernel if they
//! die.
//!
//! # Example
//!
//! ```no_run
//! use ddeshm::{DdeConfig, DdeContext};
//!
//! let mut ctx = DdeContext::attach(DdeConfig::default())?;
//! let atom = ctx.add_atom("System")?;
//! assert_eq!(ctx.find_atom("SYSTEM")?, Some(atom));
//! # Ok::<(), ddeshm::Error>(())
//! ```

pub mod config;
pub mod dde;
pub mod error;
pub mod ipc;

// Re-export commonly used types
pub use config::DdeConfig;
pub use dde::{
    BROADCAST, DdeContext, DdeHandle, DdeMessage, HANDLE_DDESHARE, HandleInfo, HandleView,
    Message, MessageKind, MessageStats, ProcessInfo, Snapshot, WindowInfo,
};
pub use ddeshm_mem::Atom;
pub use error::{Error, Result};
