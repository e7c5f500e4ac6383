//! Cross-process wake-up.
//!
//! A peer is woken with `SIGUSR2`. The handler only writes a byte into a
//! non-blocking self-pipe; waiters `poll` the read end with a timeout.
//! Payloads travel on the message queues, never on the signal.

use crate::error::{Error, Result, errno};
use ddeshm_log::debug;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

static WAKE_FD: AtomicI32 = AtomicI32::new(-1);
static SHARED: Mutex<Weak<Wakeup>> = Mutex::new(Weak::new());

#[cfg(target_os = "linux")]
unsafe fn errno_slot() -> *mut libc::c_int {
    // SAFETY: always valid for the calling thread.
    unsafe { libc::__errno_location() }
}

#[cfg(target_os = "macos")]
unsafe fn errno_slot() -> *mut libc::c_int {
    // SAFETY: always valid for the calling thread.
    unsafe { libc::__error() }
}

extern "C" fn on_signal(_: libc::c_int) {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    // SAFETY: write(2) and errno access are async-signal-safe.
    unsafe {
        let saved = *errno_slot();
        libc::write(fd, [1u8].as_ptr().cast(), 1);
        *errno_slot() = saved;
    }
}

fn set_flags(fd: i32) -> Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let status = libc::fcntl(fd, libc::F_GETFL);
        if status == -1 || libc::fcntl(fd, libc::F_SETFL, status | libc::O_NONBLOCK) == -1 {
            return Err(Error::last_os("fcntl"));
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) == -1 {
            return Err(Error::last_os("fcntl"));
        }
    }
    Ok(())
}

/// The process-wide wake-up channel.
#[derive(Debug)]
pub struct Wakeup {
    read_fd: i32,
    write_fd: i32,
}

impl Wakeup {
    /// Returns the channel, installing the signal handler on first use.
    ///
    /// Every context of the process shares one channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if the pipe or the handler cannot be set up.
    pub fn acquire() -> Result<Arc<Wakeup>> {
        let mut shared = SHARED.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(wakeup) = shared.upgrade() {
            return Ok(wakeup);
        }
        let wakeup = Arc::new(Self::install()?);
        *shared = Arc::downgrade(&wakeup);
        Ok(wakeup)
    }

    fn install() -> Result<Wakeup> {
        let mut fds = [0; 2];
        // SAFETY: `fds` has room for both ends.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(Error::last_os("pipe"));
        }
        let wakeup = Wakeup {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        set_flags(wakeup.read_fd)?;
        set_flags(wakeup.write_fd)?;
        WAKE_FD.store(wakeup.write_fd, Ordering::SeqCst);

        // SAFETY: a zeroed sigaction is a valid starting point; the handler
        // only touches the pipe.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGUSR2, &action, std::ptr::null_mut()) == -1 {
                return Err(Error::last_os("sigaction"));
            }
        }
        debug!("wake-up handler installed");
        Ok(wakeup)
    }

    /// Blocks until woken or `timeout` elapses. Returns whether a wake-up
    /// arrived.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if `poll` fails.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut fd = libc::pollfd {
            fd: self.read_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: one valid pollfd.
        match unsafe { libc::poll(&mut fd, 1, ms) } {
            0 => Ok(false),
            n if n > 0 => {
                self.drain();
                Ok(true)
            }
            _ if errno() == libc::EINTR => Ok(true),
            _ => Err(Error::last_os("poll")),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        // SAFETY: reads into a local buffer; the descriptor is non-blocking.
        while unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
    }

    /// Wakes process `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PeerUnavailable`] if `pid` is gone.
    pub fn notify(&self, pid: i32) -> Result<()> {
        // SAFETY: plain syscall.
        if unsafe { libc::kill(pid, libc::SIGUSR2) } == -1 {
            return match errno() {
                libc::ESRCH => Err(Error::PeerUnavailable { pid }),
                errno => Err(Error::Os { call: "kill", errno }),
            };
        }
        Ok(())
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        // The handler stays installed: a late signal from a peer must not
        // take the default action and kill the process.
        WAKE_FD.store(-1, Ordering::SeqCst);
        // SAFETY: both descriptors are owned by this value.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_notify() {
        let wakeup = Wakeup::acquire().unwrap();
        let again = Wakeup::acquire().unwrap();
        assert!(Arc::ptr_eq(&wakeup, &again));

        // Another test may drain the shared pipe first; retry a few times.
        let woken = (0..10).any(|_| {
            wakeup.notify(std::process::id() as i32).unwrap();
            wakeup.wait(Duration::from_millis(200)).unwrap()
        });
        assert!(woken);
    }

    #[test]
    fn test_notify_missing_process() {
        let wakeup = Wakeup::acquire().unwrap();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        assert_eq!(wakeup.notify(pid), Err(Error::PeerUnavailable { pid }));
    }
}
