//! Thin wrappers over the SysV IPC primitives the DDE layer is built on.
//!
//! - [`Segment`]: `shmget`/`shmat`/`shmdt`/`shmctl`
//! - [`RwSem`]: reader/writer lock from a two-semaphore set with `SEM_UNDO`
//! - [`MsgQueue`]: typed, non-blocking message queue of fixed-size packets
//! - [`Wakeup`]: `SIGUSR2` notification folded into a pollable self-pipe

pub mod msg;
pub mod sem;
pub mod shm;
pub mod wakeup;

pub use msg::{MsgQueue, Packet};
pub use sem::{ReadGuard, RwSem, WriteGuard};
pub use shm::Segment;
pub use wakeup::Wakeup;

/// Probes `pid` with signal 0.
///
/// `EPERM` means the process exists but belongs to someone else, which
/// still counts as alive.
#[must_use]
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission checks.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || crate::error::errno() == libc::EPERM
}
