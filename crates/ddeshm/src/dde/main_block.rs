//! The shared main block.
//!
//! Layout of the segment:
//!
//! ```text
//! 0                  32                                  first
//! | ArenaHeader      | MainBlockData                     | arena fragments ...
//! ```
//!
//! The arena manages everything after [`MainBlockData`]; the atom table
//! lives there. The first process to create the segment under one of the
//! configured keys builds it; later processes adopt it after checking the
//! creator uid, the build state and the magic.

use super::{MAX_HANDLES, MAX_PROCS, MAX_WINDOWS};
use crate::config::DdeConfig;
use crate::error::{Error, Result};
use crate::ipc::{ReadGuard, RwSem, Segment, WriteGuard};
use ddeshm_log::{debug, info, warn};
use ddeshm_mem::arena::ARENA_HEADER_SIZE;
use ddeshm_mem::{Arena, ArenaStorage, AtomTable, BitArray, RawStoragePtr, SegmentId, SlotState};
use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub(crate) const MAGIC: [u8; 16] = *b"DDESHM-MAINBLK1\0";

const BUILDING: u32 = 0;
const READY: u32 = 0x5245_4459;
const DESTROYED: u32 = 0x4445_4144;

const DATA_OFFSET: usize = ARENA_HEADER_SIZE;

/// One registered process. `pid == 0` marks a vacant slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcessEntry {
    pub pid: i32,
    pub queue: i32,
    pub sem: i32,
    /// Newest segment of the owned arena chain, -1 if none.
    pub head_segment: i32,
    pub windows: u32,
    _pad: u32,
}

impl ProcessEntry {
    pub const VACANT: ProcessEntry = ProcessEntry {
        pid: 0,
        queue: -1,
        sem: -1,
        head_segment: -1,
        windows: 0,
        _pad: 0,
    };

    pub const fn new(pid: i32, queue: i32, sem: i32) -> Self {
        ProcessEntry {
            pid,
            queue,
            sem,
            ..Self::VACANT
        }
    }

    pub const fn is_vacant(&self) -> bool {
        self.pid == 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowEntry {
    state: u32,
    pub proc_idx: u32,
    pub local: u32,
}

impl WindowEntry {
    pub const fn occupied(proc_idx: usize, local: u32) -> Self {
        WindowEntry {
            state: SlotState::Occupied as u32,
            proc_idx: proc_idx as u32,
            local,
        }
    }

    pub const fn is_occupied(&self) -> bool {
        self.state == SlotState::Occupied as u32
    }

    pub fn is_owned_by(&self, proc_idx: usize) -> bool {
        self.is_occupied() && self.proc_idx as usize == proc_idx
    }

    /// Turns the entry into a reusable tombstone.
    pub fn release(&mut self) {
        self.state = SlotState::Deleted as u32;
    }
}

/// Location of an allocated handle block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HandleSlot {
    pub segment: i32,
    pub offset: u32,
    /// Registry index of the allocating process.
    pub owner: u32,
}

impl HandleSlot {
    pub const EMPTY: HandleSlot = HandleSlot {
        segment: -1,
        offset: 0,
        owner: u32::MAX,
    };
}

/// Shared state following the arena header.
#[repr(C)]
pub(crate) struct MainBlockData {
    pub magic: [u8; 16],
    pub build_state: AtomicU32,
    pub creator_uid: u32,
    pub lock_sem: i32,
    _pad: u32,
    pub atoms: RawStoragePtr,
    pub procs: [ProcessEntry; MAX_PROCS],
    pub windows: [WindowEntry; MAX_WINDOWS],
    pub handles: BitArray<{ MAX_HANDLES / 32 }>,
    pub handle_slots: [HandleSlot; MAX_HANDLES],
}

/// Segment size for a main block whose arena gets `arena_size` bytes.
pub(crate) const fn segment_len(arena_size: usize) -> usize {
    DATA_OFFSET + size_of::<MainBlockData>() + arena_size
}

/// The attached main block.
#[derive(Debug)]
pub(crate) struct MainBlock {
    segment: Segment,
    lock: RwSem,
    arena: Arena,
}

/// Shared access to [`MainBlockData`].
pub(crate) struct MainRead<'a> {
    _guard: ReadGuard<'a>,
    data: &'a MainBlockData,
}

/// Exclusive access to [`MainBlockData`].
pub(crate) struct MainWrite<'a> {
    _guard: WriteGuard<'a>,
    data: &'a mut MainBlockData,
}

impl Deref for MainRead<'_> {
    type Target = MainBlockData;

    fn deref(&self) -> &MainBlockData {
        self.data
    }
}

impl Deref for MainWrite<'_> {
    type Target = MainBlockData;

    fn deref(&self) -> &MainBlockData {
        self.data
    }
}

impl DerefMut for MainWrite<'_> {
    fn deref_mut(&mut self) -> &mut MainBlockData {
        self.data
    }
}

fn current_uid() -> u32 {
    // SAFETY: getuid cannot fail.
    unsafe { libc::getuid() }
}

impl MainBlock {
    /// Builds or adopts the main block under the first usable key.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceExhausted`] when every key is taken by a foreign
    ///   segment
    /// - [`Error::Os`] and [`Error::LockDegraded`] from the IPC calls
    pub fn open(config: &DdeConfig) -> Result<MainBlock> {
        let len = segment_len(config.segment_size);
        for key in config.keys() {
            // A block being torn down by its last user may vanish between
            // the lookup and the checks; retry the key a few times.
            for _ in 0..3 {
                if let Some(segment) = Segment::create_exclusive(key, len)? {
                    info!("building main block under key {key:#x}");
                    return Self::build(segment);
                }
                let segment = match Segment::open(key) {
                    Ok(Some(segment)) => segment,
                    Ok(None) => continue,
                    Err(Error::Os {
                        errno: libc::EACCES,
                        ..
                    }) => break,
                    Err(e) => return Err(e),
                };
                match Self::adopt(segment, config.build_wait()) {
                    Ok(block) => {
                        info!("attached main block under key {key:#x}");
                        return Ok(block);
                    }
                    // The previous owner tore the block down under us.
                    Err(Error::BadMainBlock {
                        reason: "lock semaphore missing" | "block destroyed",
                    }) => continue,
                    Err(Error::BadMainBlock { reason }) => {
                        warn!("skipping key {key:#x}: {reason}");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Err(Error::ResourceExhausted {
            what: "main block keys",
        })
    }

    fn data_ptr(base: NonNull<u8>) -> NonNull<MainBlockData> {
        // SAFETY: every main block segment is larger than DATA_OFFSET.
        unsafe { base.add(DATA_OFFSET).cast() }
    }

    fn build(segment: Segment) -> Result<MainBlock> {
        let base = segment.base();
        // SAFETY: the segment is fresh, zero-filled and unreachable by
        // other processes until the build state flips to READY.
        let arena = unsafe {
            Arena::create(base, DATA_OFFSET + size_of::<MainBlockData>(), segment.len())
        };
        let lock = match RwSem::create() {
            Ok(lock) => lock,
            Err(e) => {
                let _ = segment.mark_removed();
                return Err(e);
            }
        };

        let storage = ArenaStorage::new(arena, SegmentId(segment.id()));
        let atoms = match AtomTable::create(storage) {
            Ok(atoms) => atoms,
            Err(e) => {
                let _ = lock.remove();
                let _ = segment.mark_removed();
                return Err(e.into());
            }
        };

        // SAFETY: as above; no other reference to the data exists.
        let data = unsafe { Self::data_ptr(base).as_mut() };
        data.creator_uid = current_uid();
        data.lock_sem = lock.id();
        data.atoms = RawStoragePtr::from(atoms.descriptor());
        data.procs = [ProcessEntry::VACANT; MAX_PROCS];
        data.handle_slots = [HandleSlot::EMPTY; MAX_HANDLES];
        data.magic = MAGIC;
        data.build_state.store(READY, Ordering::Release);

        debug!(
            "main block ready: segment {}, semaphore {}, {} arena bytes",
            segment.id(),
            lock.id(),
            arena.size()
        );
        Ok(MainBlock {
            segment,
            lock,
            arena,
        })
    }

    fn adopt(segment: Segment, build_wait: Duration) -> Result<MainBlock> {
        if segment.creator_uid()? != current_uid() {
            return Err(Error::BadMainBlock {
                reason: "created by another user",
            });
        }
        if segment.len() < segment_len(0) {
            return Err(Error::BadMainBlock {
                reason: "segment too small",
            });
        }

        // SAFETY: the segment is large enough to hold the data block.
        let data = unsafe { Self::data_ptr(segment.base()).as_ref() };
        let deadline = Instant::now() + build_wait;
        while data.build_state.load(Ordering::Acquire) == BUILDING {
            if Instant::now() >= deadline {
                return Err(Error::BadMainBlock {
                    reason: "build did not finish",
                });
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        Self::check_ready(data)?;
        let missing = |_: Error| Error::BadMainBlock {
            reason: "lock semaphore missing",
        };
        let lock = RwSem::from_id(data.lock_sem).map_err(missing)?;

        // A last user may have been destroying the block between the checks
        // above and the attach; it marks the block before releasing the lock.
        {
            let _guard = lock.read().map_err(missing)?;
            Self::check_ready(data)?;
        }

        // SAFETY: the builder formatted the arena before publishing READY.
        let arena = unsafe { Arena::from_raw(segment.base()) };
        Ok(MainBlock {
            segment,
            lock,
            arena,
        })
    }

    fn check_ready(data: &MainBlockData) -> Result<()> {
        match data.build_state.load(Ordering::Acquire) {
            DESTROYED => Err(Error::BadMainBlock {
                reason: "block destroyed",
            }),
            READY if data.magic == MAGIC => Ok(()),
            _ => Err(Error::BadMainBlock {
                reason: "magic mismatch",
            }),
        }
    }

    pub fn segment_id(&self) -> i32 {
        self.segment.id()
    }

    pub fn lock(&self) -> &RwSem {
        &self.lock
    }

    pub fn arena(&self) -> Arena {
        self.arena
    }

    /// Backend for tables living in the main block arena.
    pub fn storage(&self) -> ArenaStorage {
        ArenaStorage::new(self.arena, SegmentId(self.segment.id()))
    }

    /// Acquires the global lock for reading.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockDegraded`] if the semaphore fails.
    pub fn read(&self) -> Result<MainRead<'_>> {
        let guard = self.lock.read()?;
        // SAFETY: the segment stays attached for the lifetime of `self`
        // and writers are excluded while the guard is held.
        let data = unsafe { Self::data_ptr(self.segment.base()).as_ref() };
        Ok(MainRead {
            _guard: guard,
            data,
        })
    }

    /// Acquires the global lock for writing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockDegraded`] if the semaphore fails.
    pub fn write(&self) -> Result<MainWrite<'_>> {
        let guard = self.lock.write()?;
        // SAFETY: as in `read`; the write lock excludes every other
        // accessor, in this process and in others.
        let data = unsafe { Self::data_ptr(self.segment.base()).as_mut() };
        Ok(MainWrite {
            _guard: guard,
            data,
        })
    }

    /// Removes the block if this process is its last user.
    ///
    /// Returns whether the block was destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Os`] if the segment cannot be queried or removed,
    /// and [`Error::LockDegraded`] if the main lock fails.
    pub fn destroy_if_last(&self) -> Result<bool> {
        {
            let data = self.write()?;
            if self.segment.attach_count()? > 1 {
                return Ok(false);
            }
            data.build_state.store(DESTROYED, Ordering::Release);
            if let Err(e) = self.segment.mark_removed() {
                data.build_state.store(READY, Ordering::Release);
                return Err(e);
            }
        }
        // Late attachers see DESTROYED under the lock or fail on the
        // removed semaphore; either way they retry the key.
        self.lock.remove()?;
        info!("destroyed main block (segment {})", self.segment.id());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dde::context::tests::test_config;

    #[test]
    fn test_layout() {
        assert_eq!(DATA_OFFSET % 16, 0);
        assert_eq!(size_of::<ProcessEntry>(), 24);
        assert_eq!(size_of::<WindowEntry>(), 12);
        assert_eq!(size_of::<HandleSlot>(), 12);
        assert_eq!(std::mem::align_of::<MainBlockData>(), 8);
    }

    #[test]
    fn test_build_then_adopt() {
        let config = test_config(0x10);
        let first = MainBlock::open(&config).unwrap();
        let second = MainBlock::open(&config).unwrap();
        assert_eq!(first.segment_id(), second.segment_id());
        assert_eq!(first.lock().id(), second.lock().id());

        {
            let mut data = first.write().unwrap();
            data.procs[3] = ProcessEntry::new(1234, 5, 6);
        }
        assert_eq!(second.read().unwrap().procs[3].pid, 1234);
        assert!(second.read().unwrap().procs[4].is_vacant());
        assert!(second.arena().size() >= config.segment_size - 16);

        assert!(!second.destroy_if_last().unwrap());
        drop(second);
        assert!(first.destroy_if_last().unwrap());
    }

    #[test]
    fn test_foreign_segment_is_skipped() {
        let config = test_config(0x11);
        let key = config.keys().next().unwrap();
        // A segment under the first key without our magic.
        let foreign = Segment::create_exclusive(key, segment_len(0)).unwrap().unwrap();
        unsafe {
            MainBlock::data_ptr(foreign.base())
                .as_ref()
                .build_state
                .store(READY, Ordering::Release);
        }

        let block = MainBlock::open(&config).unwrap();
        assert_ne!(block.segment_id(), foreign.id());
        assert!(block.destroy_if_last().unwrap());
        foreign.mark_removed().unwrap();
    }

    #[test]
    fn test_unfinished_build_times_out() {
        let mut config = test_config(0x12);
        config.key_range = 1;
        config.build_wait_ms = 20;
        let key = config.keys().next().unwrap();
        let stuck = Segment::create_exclusive(key, segment_len(0)).unwrap().unwrap();

        assert_eq!(
            MainBlock::open(&config).unwrap_err(),
            Error::ResourceExhausted {
                what: "main block keys"
            }
        );
        stuck.mark_removed().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_destroyed_block_is_not_adopted() {
        let config = test_config(0x13);
        let first = MainBlock::open(&config).unwrap();
        let old = first.segment_id();
        assert!(first.destroy_if_last().unwrap());

        // Linux still lets a late attacher map the removed segment.
        let late = Segment::attach(old).unwrap();
        assert_eq!(
            MainBlock::adopt(late, config.build_wait()).unwrap_err(),
            Error::BadMainBlock {
                reason: "block destroyed"
            }
        );

        let fresh = MainBlock::open(&config).unwrap();
        assert_ne!(fresh.segment_id(), old);
        assert!(fresh.destroy_if_last().unwrap());
    }

    #[test]
    fn test_shared_block_is_kept() {
        let config = test_config(0x14);
        let first = MainBlock::open(&config).unwrap();
        let second = MainBlock::open(&config).unwrap();
        assert!(!first.destroy_if_last().unwrap());
        // The refused teardown left the block usable.
        drop(second.write().unwrap());
        drop(first);
        assert!(second.destroy_if_last().unwrap());
    }
}
