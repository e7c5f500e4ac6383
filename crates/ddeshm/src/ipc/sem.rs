//! Crash-safe reader/writer lock over a two-semaphore SysV set.
//!
//! Semaphore 0 counts readers, semaphore 1 counts writers. Every adjustment
//! carries `SEM_UNDO`, so the kernel reverts the contribution of a process
//! that dies while holding the lock.
//!
//! | operation | semop (atomic) |
//! |---|---|
//! | read acquire | `READ += 1`, wait `WRITE == 0` |
//! | read release | `READ -= 1` |
//! | write acquire | wait `READ == 0`, `WRITE += 1`, `READ += 1` |
//! | write release | `WRITE -= 1`, `READ -= 1` |
//!
//! The writer's extra `READ += 1` holds off readers that arrive while the
//! writer is active.

use crate::error::{Error, Result, errno};
use ddeshm_log::{error, trace};

const READ: u16 = 0;
const WRITE: u16 = 1;
const UNDO: i16 = libc::SEM_UNDO as i16;
const NOWAIT: i16 = libc::IPC_NOWAIT as i16;

const fn op(sem_num: u16, sem_op: i16, sem_flg: i16) -> libc::sembuf {
    libc::sembuf {
        sem_num,
        sem_op,
        sem_flg,
    }
}

/// A reader/writer lock shared between processes by semaphore id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwSem {
    id: i32,
}

/// Shared access; released on drop.
#[derive(Debug)]
#[must_use = "the lock is released when the guard is dropped"]
pub struct ReadGuard<'a> {
    sem: &'a RwSem,
}

/// Exclusive access; released on drop.
#[derive(Debug)]
#[must_use = "the lock is released when the guard is dropped"]
pub struct WriteGuard<'a> {
    sem: &'a RwSem,
}

fn degraded(op: &'static str, errno: i32) -> Error {
    error!("semaphore {op} failed: {}", std::io::Error::from_raw_os_error(errno));
    #[cfg(feature = "lock_backtrace")]
    error!("{:?}", backtrace::Backtrace::new());
    Error::LockDegraded { op, errno }
}

impl RwSem {
    /// Creates a fresh, unlocked semaphore pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if the set cannot be created or initialized.
    pub fn create() -> Result<Self> {
        // SAFETY: plain syscall.
        let id = unsafe { libc::semget(libc::IPC_PRIVATE, 2, libc::IPC_CREAT | 0o600) };
        if id == -1 {
            return Err(Error::last_os("semget"));
        }
        let zero = [0u16; 2];
        // SAFETY: SETALL reads one value per semaphore from the array.
        if unsafe { libc::semctl(id, 0, libc::SETALL, zero.as_ptr()) } == -1 {
            let err = Error::last_os("semctl(SETALL)");
            let _ = RwSem { id }.remove();
            return Err(err);
        }
        trace!("created semaphore set {id}");
        Ok(RwSem { id })
    }

    /// Wraps a set created by another process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if no such set exists.
    pub fn from_id(id: i32) -> Result<Self> {
        let sem = RwSem { id };
        sem.values()?;
        Ok(sem)
    }

    /// SysV semaphore set id.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Current `(READ, WRITE)` counts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if the set is gone.
    pub fn values(&self) -> Result<(i32, i32)> {
        // SAFETY: GETVAL takes no argument.
        let read = unsafe { libc::semctl(self.id, i32::from(READ), libc::GETVAL) };
        if read == -1 {
            return Err(Error::last_os("semctl(GETVAL)"));
        }
        // SAFETY: as above.
        let write = unsafe { libc::semctl(self.id, i32::from(WRITE), libc::GETVAL) };
        if write == -1 {
            return Err(Error::last_os("semctl(GETVAL)"));
        }
        Ok((read, write))
    }

    /// Destroys the set; blocked waiters fail with `EIDRM`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] for failures other than an already removed set.
    pub fn remove(&self) -> Result<()> {
        // SAFETY: IPC_RMID takes no argument.
        if unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) } == -1 {
            return match errno() {
                libc::EINVAL | libc::EIDRM => Ok(()),
                errno => Err(Error::Os {
                    call: "semctl(IPC_RMID)",
                    errno,
                }),
            };
        }
        Ok(())
    }

    /// Applies `ops` atomically, retrying interrupted waits. Fails with
    /// the raw `errno`.
    fn semop(&self, ops: &mut [libc::sembuf]) -> std::result::Result<(), i32> {
        loop {
            // SAFETY: `ops` is a valid array of `ops.len()` entries.
            if unsafe { libc::semop(self.id, ops.as_mut_ptr(), ops.len()) } == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                errno => return Err(errno),
            }
        }
    }

    /// Acquires shared access.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockDegraded`] when `semop` fails for a reason
    /// other than interruption. The lock is not held in that case.
    pub fn read(&self) -> Result<ReadGuard<'_>> {
        self.semop(&mut [op(READ, 1, UNDO), op(WRITE, 0, 0)])
            .map_err(|errno| degraded("read_acquire", errno))?;
        Ok(ReadGuard { sem: self })
    }

    /// Acquires exclusive access.
    ///
    /// # Errors
    ///
    /// As [`RwSem::read`].
    pub fn write(&self) -> Result<WriteGuard<'_>> {
        self.semop(&mut [op(READ, 0, 0), op(WRITE, 1, UNDO), op(READ, 1, UNDO)])
            .map_err(|errno| degraded("write_acquire", errno))?;
        Ok(WriteGuard { sem: self })
    }

    /// Acquires exclusive access if nobody holds the lock.
    ///
    /// # Errors
    ///
    /// As [`RwSem::read`]; contention is `Ok(None)`.
    pub fn try_write(&self) -> Result<Option<WriteGuard<'_>>> {
        let mut ops = [
            op(READ, 0, NOWAIT),
            op(WRITE, 1, UNDO | NOWAIT),
            op(READ, 1, UNDO | NOWAIT),
        ];
        match self.semop(&mut ops) {
            Ok(()) => Ok(Some(WriteGuard { sem: self })),
            Err(libc::EAGAIN) => Ok(None),
            Err(errno) => Err(degraded("write_acquire", errno)),
        }
    }

    fn release(&self, name: &'static str, ops: &mut [libc::sembuf]) {
        // The undo record still covers a failed release at exit.
        if let Err(errno) = self.semop(ops) {
            degraded(name, errno);
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.sem.release("read_release", &mut [op(READ, -1, UNDO)]);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.sem
            .release("write_release", &mut [op(WRITE, -1, UNDO), op(READ, -1, UNDO)]);
    }
}
