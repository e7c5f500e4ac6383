//! SysV shared-memory segments.

use crate::error::{Error, Result, errno};
use ddeshm_log::{debug, trace};
use std::mem::MaybeUninit;
use std::ptr::NonNull;

/// A shared-memory segment attached in this process.
///
/// Dropping the value detaches the segment; it is destroyed by the kernel
/// once it has been marked removed and the last process detached.
#[derive(Debug)]
pub struct Segment {
    id: i32,
    base: NonNull<u8>,
    len: usize,
}

fn stat(id: i32) -> Result<libc::shmid_ds> {
    let mut ds = MaybeUninit::<libc::shmid_ds>::zeroed();
    // SAFETY: IPC_STAT fills the provided buffer.
    if unsafe { libc::shmctl(id, libc::IPC_STAT, ds.as_mut_ptr()) } == -1 {
        return Err(Error::last_os("shmctl(IPC_STAT)"));
    }
    // SAFETY: initialized by the successful call above.
    Ok(unsafe { ds.assume_init() })
}

impl Segment {
    /// Creates a segment under `key`, failing softly if the key is taken.
    ///
    /// Returns `Ok(None)` when another segment already uses `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] when `shmget` fails for any other reason or
    /// the new segment cannot be attached.
    pub fn create_exclusive(key: libc::key_t, len: usize) -> Result<Option<Segment>> {
        // SAFETY: plain syscall.
        let id = unsafe { libc::shmget(key, len, libc::IPC_CREAT | libc::IPC_EXCL | 0o600) };
        if id == -1 {
            return match errno() {
                libc::EEXIST => Ok(None),
                errno => Err(Error::Os {
                    call: "shmget",
                    errno,
                }),
            };
        }
        match Self::attach(id) {
            Ok(segment) => {
                debug!("created segment {id} under key {key:#x} ({len} bytes)");
                Ok(Some(segment))
            }
            Err(e) => {
                let _ = Self::remove_id(id);
                Err(e)
            }
        }
    }

    /// Creates an anonymous segment other processes attach by id.
    ///
    /// On Linux the segment is marked removed straight away: it stays
    /// attachable by id and disappears with its last attachment, so a
    /// crashed owner leaks nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] when the segment cannot be created or
    /// attached.
    pub fn create_private(len: usize) -> Result<Segment> {
        // SAFETY: plain syscall.
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, len, libc::IPC_CREAT | 0o600) };
        if id == -1 {
            return Err(Error::last_os("shmget"));
        }
        let segment = Self::attach(id).inspect_err(|_| {
            let _ = Self::remove_id(id);
        })?;
        #[cfg(target_os = "linux")]
        segment.mark_removed()?;
        trace!("created private segment {id} ({len} bytes)");
        Ok(segment)
    }

    /// Looks up the segment under `key` without creating it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] for failures other than a missing or
    /// vanished segment.
    pub fn open(key: libc::key_t) -> Result<Option<Segment>> {
        // SAFETY: plain syscall.
        let id = unsafe { libc::shmget(key, 0, 0) };
        if id == -1 {
            return match errno() {
                libc::ENOENT => Ok(None),
                errno => Err(Error::Os {
                    call: "shmget",
                    errno,
                }),
            };
        }
        match Self::attach(id) {
            Ok(segment) => Ok(Some(segment)),
            // Removed between the lookup and the attach.
            Err(Error::Os {
                errno: libc::EINVAL | libc::EIDRM,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attaches an existing segment by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] when `shmat` fails, typically because the
    /// segment no longer exists.
    pub fn attach(id: i32) -> Result<Segment> {
        // SAFETY: a null address lets the kernel pick the mapping.
        let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(Error::last_os("shmat"));
        }
        let Some(base) = NonNull::new(addr.cast::<u8>()) else {
            return Err(Error::Os {
                call: "shmat",
                errno: libc::EINVAL,
            });
        };
        let segment = Segment { id, base, len: 0 };
        let len = stat(id)?.shm_segsz as usize;
        Ok(Segment { len, ..segment })
    }

    /// SysV segment id.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Address of the segment in this process.
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Size in bytes.
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Number of processes currently attached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if the segment cannot be queried.
    pub fn attach_count(&self) -> Result<u64> {
        Ok(stat(self.id)?.shm_nattch as u64)
    }

    /// User id of the segment's creator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if the segment cannot be queried.
    pub fn creator_uid(&self) -> Result<u32> {
        Ok(stat(self.id)?.shm_perm.cuid)
    }

    /// Marks the segment for destruction after the last detach.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if `shmctl` fails.
    pub fn mark_removed(&self) -> Result<()> {
        Self::remove_id(self.id)
    }

    /// Marks segment `id` for destruction. Already-gone ids are not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] for permission and other failures.
    pub fn remove_id(id: i32) -> Result<()> {
        // SAFETY: IPC_RMID takes no buffer.
        if unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) } == -1 {
            return match errno() {
                libc::EINVAL | libc::EIDRM => Ok(()),
                errno => Err(Error::Os {
                    call: "shmctl(IPC_RMID)",
                    errno,
                }),
            };
        }
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: `base` came from a successful shmat.
        unsafe {
            libc::shmdt(self.base.as_ptr().cast());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_segment_is_shared_between_attachments() {
        let first = Segment::create_private(64 * 1024).unwrap();
        assert!(first.len() >= 64 * 1024);

        let second = Segment::attach(first.id()).unwrap();
        assert_ne!(first.base(), second.base());

        unsafe {
            first.base().as_ptr().add(100).write(0x5A);
            assert_eq!(second.base().as_ptr().add(100).read(), 0x5A);
        }
        assert_eq!(first.attach_count().unwrap(), 2);
        drop(second);
        assert_eq!(first.attach_count().unwrap(), 1);
    }

    #[test]
    fn test_keyed_segment_exclusive_and_open() {
        let key = 0x5D5E_0000 + (std::process::id() as libc::key_t & 0xFFFF);
        let created = Segment::create_exclusive(key, 4096).unwrap().unwrap();
        assert!(Segment::create_exclusive(key, 4096).unwrap().is_none());

        let opened = Segment::open(key).unwrap().unwrap();
        assert_eq!(opened.id(), created.id());
        assert_eq!(created.creator_uid().unwrap(), unsafe { libc::getuid() });

        created.mark_removed().unwrap();
        drop(opened);
        drop(created);
        assert!(Segment::open(key).unwrap().is_none());
    }

    #[test]
    fn test_attach_missing_segment_fails() {
        assert!(matches!(
            Segment::attach(-1),
            Err(Error::Os { call: "shmat", .. })
        ));
        Segment::remove_id(-1).unwrap();
    }
}
