//! Shared memory blocks addressed by DDE handles.
//!
//! A handle is a bit in the main block's handle table plus a
//! `(segment, offset)` slot. The block lives in an arena owned by the
//! allocating process; every block starts with a [`HandleInfo`] header.
//! Arena mutation happens under the owner's semaphore; the handle table
//! under the main lock. When both are needed the owner's lock is taken
//! first.

use super::context::DdeContext;
use super::main_block::HandleSlot;
use super::{DdeHandle, HANDLE_DDESHARE, MAX_HANDLES};
use crate::error::{Error, Result};
use crate::ipc::{RwSem, Segment};
use ddeshm_log::{debug, trace};
use ddeshm_mem::arena::ARENA_HEADER_SIZE;
use ddeshm_mem::{Arena, HashTable, LocalStorage, Offset};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

/// Header at the start of every handle block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleInfo {
    pub flags: u32,
    pub lock_count: u32,
    /// Payload size in bytes.
    pub size: u32,
    _pad: u32,
}

const INFO_SIZE: usize = size_of::<HandleInfo>();

/// Segments attached by this process, indexed by segment id.
#[derive(Debug)]
pub(crate) struct SegmentCache {
    index: Option<HashTable<LocalStorage>>,
    segments: Vec<Segment>,
}

impl SegmentCache {
    pub fn new() -> Result<Self> {
        Ok(SegmentCache {
            index: Some(HashTable::create(LocalStorage, size_of::<u32>(), 16)?),
            segments: Vec::new(),
        })
    }

    fn position(&self, id: i32) -> Option<usize> {
        let value = self.index.as_ref()?.lookup(id as u32)?;
        Some(u32::from_ne_bytes(value.try_into().ok()?) as usize)
    }

    pub fn get(&self, id: i32) -> Option<&Segment> {
        self.segments.get(self.position(id)?)
    }

    /// Adds an attached segment.
    pub fn insert(&mut self, segment: Segment) -> Result<&Segment> {
        let id = segment.id();
        let position = self.segments.len();
        let index = self.index.as_mut().ok_or(Error::ResourceExhausted {
            what: "segment cache",
        })?;
        if !index.insert(id as u32, &(position as u32).to_ne_bytes()) {
            return Err(Error::ResourceExhausted {
                what: "segment cache",
            });
        }
        self.segments.push(segment);
        Ok(&self.segments[position])
    }

    /// Returns the segment, attaching it on first use.
    pub fn get_or_attach(&mut self, id: i32) -> Result<&Segment> {
        if let Some(position) = self.position(id) {
            return Ok(&self.segments[position]);
        }
        let segment = Segment::attach(id)?;
        trace!("attached segment {id}");
        self.insert(segment)
    }

    /// Detaches segment `id` if it is cached.
    pub fn forget(&mut self, id: i32) {
        let Some(position) = self.position(id) else {
            return;
        };
        let Some(index) = self.index.as_mut() else {
            return;
        };
        index.delete(id as u32);
        self.segments.swap_remove(position);
        if let Some(moved) = self.segments.get(position) {
            index.insert(moved.id() as u32, &(position as u32).to_ne_bytes());
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Detaches every segment.
    pub fn clear(&mut self) {
        for segment in self.segments.drain(..) {
            if let Some(index) = self.index.as_mut() {
                index.delete(segment.id() as u32);
            }
        }
    }
}

impl Drop for SegmentCache {
    fn drop(&mut self) {
        if let Some(index) = self.index.take() {
            let _ = index.destroy();
        }
    }
}

/// A process-local view of a handle's payload.
///
/// Views are independent: attaching the same handle twice yields two views
/// of the same bytes.
#[derive(Debug)]
pub struct HandleView<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _context: PhantomData<&'a DdeContext>,
}

impl HandleView<'_> {
    /// Payload size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies bytes starting at `offset` into `buf`. Returns the count
    /// copied.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.len.saturating_sub(offset));
        // SAFETY: `offset + count` stays within the payload.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), count);
        }
        count
    }

    /// Copies `data` into the payload at `offset`. Returns the count
    /// copied.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> usize {
        let count = data.len().min(self.len.saturating_sub(offset));
        // SAFETY: `offset + count` stays within the payload.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), count);
        }
        count
    }

    /// Copies the whole payload.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.len];
        self.read_at(0, &mut out);
        out
    }
}

/// Handle slot plus the owner's semaphore, resolved under the main lock.
struct Resolved {
    slot: HandleSlot,
    owner_sem: i32,
}

impl DdeContext {
    /// Allocates a block of `size` payload bytes.
    ///
    /// Set [`HANDLE_DDESHARE`] in `flags` to let other processes attach
    /// it.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceExhausted`] when all 1024 handles are in use or
    ///   no segment can hold the block
    /// - [`Error::Os`] if a new segment cannot be created
    pub fn alloc_handle(&mut self, flags: u32, size: usize) -> Result<DdeHandle> {
        let index = self.ensure_registered()?;
        let payload = u32::try_from(size).map_err(|_| Error::ResourceExhausted {
            what: "arena space",
        })?;

        let bit = {
            let mut data = self.main.write()?;
            data.handles.assign_vacant().ok_or(Error::ResourceExhausted {
                what: "handles",
            })?
        };

        match self.alloc_block(index, INFO_SIZE + size) {
            Ok((segment, offset, block)) => {
                // SAFETY: the block holds a header plus `size` bytes and is
                // not published yet.
                unsafe {
                    block.cast::<HandleInfo>().write(HandleInfo {
                        flags,
                        size: payload,
                        ..HandleInfo::default()
                    });
                }
                let mut data = self.main.write()?;
                data.handle_slots[bit] = HandleSlot {
                    segment,
                    offset: offset.get(),
                    owner: index as u32,
                };
                let handle = DdeHandle::from_bit(bit);
                debug!("allocated handle {handle} ({size} bytes in segment {segment})");
                Ok(handle)
            }
            Err(e) => {
                if let Ok(mut data) = self.main.write() {
                    data.handles.clear(bit);
                }
                Err(e)
            }
        }
    }

    /// Allocates `bytes` from this process' arena chain, adding a segment
    /// when none has room.
    fn alloc_block(&mut self, index: usize, bytes: usize) -> Result<(i32, Offset, NonNull<u8>)> {
        let Some(registration) = self.registration.as_mut() else {
            return Err(Error::InvalidHandle { handle: 0 });
        };
        let sem = registration.sem;
        let _guard = sem.write()?;
        let mut cache = self.segments.borrow_mut();

        for &id in &registration.segments {
            let Some(segment) = cache.get(id) else {
                continue;
            };
            // SAFETY: owned segments are formatted arenas.
            let arena = unsafe { Arena::from_raw(segment.base()) };
            if let Some(offset) = arena.alloc(bytes) {
                return Ok((id, offset, arena.ptr(offset)));
            }
        }

        let needed = Arena::fragment_size_for(bytes)
            .and_then(|fragment| (fragment as usize).checked_add(ARENA_HEADER_SIZE + 16))
            .ok_or(Error::ResourceExhausted {
                what: "arena space",
            })?;
        let segment = Segment::create_private(needed.max(self.config.segment_size))?;
        // SAFETY: fresh private segment.
        let arena = unsafe { Arena::create(segment.base(), ARENA_HEADER_SIZE, segment.len()) };
        arena.set_owner(Some(index));
        arena.set_next_segment(registration.segments.first().copied());
        let id = segment.id();

        // Link the segment into the chain only once it is cached.
        cache.insert(segment)?;
        match self.main.write() {
            Ok(mut data) => data.procs[index].head_segment = id,
            Err(e) => {
                cache.forget(id);
                return Err(e);
            }
        }
        registration.segments.insert(0, id);
        debug!("process {index} added arena segment {id} ({} bytes)", arena.size());

        let offset = arena.alloc(bytes).ok_or(Error::ResourceExhausted {
            what: "arena space",
        })?;
        Ok((id, offset, arena.ptr(offset)))
    }

    /// Releases a block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `handle` is not allocated.
    pub fn free_handle(&mut self, handle: DdeHandle) -> Result<()> {
        let invalid = Error::InvalidHandle {
            handle: handle.get(),
        };
        let bit = handle.bit().ok_or(invalid.clone())?;
        let resolved = {
            let mut data = self.main.write()?;
            if !data.handles.clear(bit) {
                return Err(invalid);
            }
            let slot = data.handle_slots[bit];
            data.handle_slots[bit] = HandleSlot::EMPTY;
            let Some(owner) = data.procs.get(slot.owner as usize).filter(|o| !o.is_vacant()) else {
                return Ok(());
            };
            Resolved {
                slot,
                owner_sem: owner.sem,
            }
        };

        let Ok(sem) = RwSem::from_id(resolved.owner_sem) else {
            return Ok(());
        };
        let _guard = sem.write()?;
        let mut cache = self.segments.borrow_mut();
        let segment = cache.get_or_attach(resolved.slot.segment)?;
        // SAFETY: handle segments are formatted arenas.
        let arena = unsafe { Arena::from_raw(segment.base()) };
        arena.free(Offset::new(resolved.slot.offset))?;
        debug!("freed handle {handle}");
        Ok(())
    }

    fn resolve_handle(&self, handle: DdeHandle) -> Result<(Resolved, bool)> {
        let invalid = Error::InvalidHandle {
            handle: handle.get(),
        };
        let bit = handle.bit().ok_or(invalid.clone())?;
        let data = self.main.read()?;
        if !data.handles.sample(bit) {
            return Err(invalid);
        }
        let slot = data.handle_slots[bit];
        let owner = data.procs.get(slot.owner as usize).ok_or(invalid)?;
        let own = self.process_index() == Some(slot.owner as usize);
        Ok((
            Resolved {
                slot,
                owner_sem: owner.sem,
            },
            own,
        ))
    }

    /// Runs `f` on the header of `handle` under the owner's lock.
    fn with_info<R>(
        &self,
        handle: DdeHandle,
        exclusive: bool,
        f: impl FnOnce(&mut HandleInfo, NonNull<u8>) -> Result<R>,
    ) -> Result<R> {
        let invalid = Error::InvalidHandle {
            handle: handle.get(),
        };
        let (resolved, _) = self.resolve_handle(handle)?;
        let sem = RwSem::from_id(resolved.owner_sem).map_err(|_| invalid.clone())?;
        let _read;
        let _write;
        if exclusive {
            _write = sem.write()?;
        } else {
            _read = sem.read()?;
        }

        let mut cache = self.segments.borrow_mut();
        let segment = cache
            .get_or_attach(resolved.slot.segment)
            .map_err(|_| invalid.clone())?;
        // SAFETY: handle segments are formatted arenas.
        let arena = unsafe { Arena::from_raw(segment.base()) };
        let offset = Offset::new(resolved.slot.offset);
        if !arena.is_allocated(offset) {
            return Err(invalid);
        }
        let block = arena.ptr(offset);
        // SAFETY: allocated handle blocks start with a header; the owner's
        // lock serializes access to it.
        let info = unsafe { block.cast::<HandleInfo>().as_mut() };
        // SAFETY: the payload follows the header.
        f(info, unsafe { block.add(INFO_SIZE) })
    }

    /// Maps the payload of `handle` into this process.
    ///
    /// Other processes may attach only blocks flagged
    /// [`HANDLE_DDESHARE`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] for unallocated or unshared
    /// handles.
    pub fn attach_handle(&self, handle: DdeHandle) -> Result<HandleView<'_>> {
        let (_, own) = self.resolve_handle(handle)?;
        self.with_info(handle, false, |info, payload| {
            if !own && info.flags & HANDLE_DDESHARE == 0 {
                return Err(Error::InvalidHandle {
                    handle: handle.get(),
                });
            }
            Ok(HandleView {
                ptr: payload,
                len: info.size as usize,
                _context: PhantomData,
            })
        })
    }

    /// Increments the lock count. Returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `handle` is not allocated.
    pub fn lock_handle(&self, handle: DdeHandle) -> Result<u32> {
        self.with_info(handle, true, |info, _| {
            info.lock_count = info.lock_count.saturating_add(1);
            Ok(info.lock_count)
        })
    }

    /// Decrements the lock count. Returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `handle` is not allocated.
    pub fn unlock_handle(&self, handle: DdeHandle) -> Result<u32> {
        self.with_info(handle, true, |info, _| {
            info.lock_count = info.lock_count.saturating_sub(1);
            Ok(info.lock_count)
        })
    }

    /// Payload size of `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `handle` is not allocated.
    pub fn handle_size(&self, handle: DdeHandle) -> Result<usize> {
        self.with_info(handle, false, |info, _| Ok(info.size as usize))
    }

    /// Flags of `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `handle` is not allocated.
    pub fn handle_flags(&self, handle: DdeHandle) -> Result<u32> {
        self.with_info(handle, false, |info, _| Ok(info.flags))
    }

    /// Replaces the flags of `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `handle` is not allocated.
    pub fn set_handle_flags(&self, handle: DdeHandle, flags: u32) -> Result<()> {
        self.with_info(handle, true, |info, _| {
            info.flags = flags;
            Ok(())
        })
    }

    /// Whether `raw` names an allocated DDE handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockDegraded`] if the main lock fails.
    pub fn is_dde_handle(&self, raw: u32) -> Result<bool> {
        let Some(bit) = DdeHandle::new(raw).bit() else {
            return Ok(false);
        };
        Ok(self.main.read()?.handles.sample(bit))
    }

    /// Number of allocated handles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockDegraded`] if the main lock fails.
    pub fn handle_count(&self) -> Result<usize> {
        let count = self.main.read()?.handles.count();
        debug_assert!(count <= MAX_HANDLES);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dde::context::tests::test_config;

    #[test]
    fn test_segment_cache() {
        let mut cache = SegmentCache::new().unwrap();
        let a = Segment::create_private(4096).unwrap();
        let b = Segment::create_private(4096).unwrap();
        let (ida, idb) = (a.id(), b.id());
        cache.insert(a).unwrap();
        cache.insert(b).unwrap();
        assert_eq!(cache.len(), 2);

        cache.forget(ida);
        assert!(cache.get(ida).is_none());
        assert_eq!(cache.get(idb).map(Segment::id), Some(idb));

        let again = cache.get_or_attach(idb).unwrap().id();
        assert_eq!(again, idb);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_alloc_write_free() {
        let mut ctx = DdeContext::attach(test_config(0x30)).unwrap();
        let handle = ctx.alloc_handle(HANDLE_DDESHARE, 100).unwrap();
        assert_eq!(handle.get(), 0x4000);
        assert!(ctx.is_dde_handle(handle.get()).unwrap());
        assert!(!ctx.is_dde_handle(0x4001).unwrap());
        assert!(!ctx.is_dde_handle(7).unwrap());

        assert_eq!(ctx.handle_size(handle).unwrap(), 100);
        assert_eq!(ctx.handle_flags(handle).unwrap(), HANDLE_DDESHARE);

        let view = ctx.attach_handle(handle).unwrap();
        assert_eq!(view.write_at(0, b"hello"), 5);
        assert_eq!(view.write_at(98, b"xyz"), 2);
        let other = ctx.attach_handle(handle).unwrap();
        assert_eq!(&other.to_vec()[..5], b"hello");
        assert_eq!(&other.to_vec()[98..], b"xy");

        assert_eq!(ctx.lock_handle(handle).unwrap(), 1);
        assert_eq!(ctx.lock_handle(handle).unwrap(), 2);
        assert_eq!(ctx.unlock_handle(handle).unwrap(), 1);

        ctx.free_handle(handle).unwrap();
        assert_eq!(
            ctx.free_handle(handle),
            Err(Error::InvalidHandle { handle: 0x4000 })
        );
        assert!(ctx.attach_handle(handle).is_err());
        assert_eq!(ctx.handle_count().unwrap(), 0);
    }

    #[test]
    fn test_large_block_gets_own_segment() {
        let mut ctx = DdeContext::attach(test_config(0x31)).unwrap();
        let small = ctx.alloc_handle(0, 64).unwrap();
        let big = ctx.alloc_handle(0, 200 * 1024).unwrap();
        assert_eq!(ctx.registration.as_ref().unwrap().segments.len(), 2);
        assert_eq!(ctx.handle_size(big).unwrap(), 200 * 1024);

        let data = ctx.main.read().unwrap();
        let index = ctx.process_index().unwrap();
        assert_eq!(
            data.procs[index].head_segment,
            data.handle_slots[big.bit().unwrap()].segment
        );
        assert_ne!(
            data.handle_slots[small.bit().unwrap()].segment,
            data.handle_slots[big.bit().unwrap()].segment
        );
    }

    #[test]
    fn test_unshared_block_is_private() {
        let config = test_config(0x32);
        let mut owner = DdeContext::attach(config.clone()).unwrap();
        let other = DdeContext::attach(config).unwrap();

        let handle = owner.alloc_handle(0, 32).unwrap();
        owner.attach_handle(handle).unwrap().write_at(0, &[9; 32]);
        assert!(matches!(
            other.attach_handle(handle),
            Err(Error::InvalidHandle { .. })
        ));

        owner.set_handle_flags(handle, HANDLE_DDESHARE).unwrap();
        assert_eq!(other.attach_handle(handle).unwrap().to_vec(), vec![9; 32]);
    }

    #[test]
    fn test_owner_release_frees_handles() {
        let config = test_config(0x33);
        let mut owner = DdeContext::attach(config.clone()).unwrap();
        let observer = DdeContext::attach(config).unwrap();
        let handle = owner.alloc_handle(HANDLE_DDESHARE, 16).unwrap();
        assert!(observer.is_dde_handle(handle.get()).unwrap());

        owner.detach().unwrap();
        assert!(!observer.is_dde_handle(handle.get()).unwrap());
    }

    #[test]
    fn test_failed_cache_insert_leaves_chain_unlinked() {
        let mut ctx = DdeContext::attach(test_config(0x34)).unwrap();
        let index = ctx.ensure_registered().unwrap();
        let head = ctx.main.read().unwrap().procs[index].head_segment;
        let saved = ctx.segments.borrow_mut().index.take();

        assert_eq!(
            ctx.alloc_handle(0, 64),
            Err(Error::ResourceExhausted {
                what: "segment cache"
            })
        );
        assert!(ctx.registration.as_ref().unwrap().segments.is_empty());
        assert_eq!(ctx.main.read().unwrap().procs[index].head_segment, head);
        assert_eq!(ctx.handle_count().unwrap(), 0);

        ctx.segments.borrow_mut().index = saved;
        let handle = ctx.alloc_handle(0, 64).unwrap();
        let segments = ctx.registration.as_ref().unwrap().segments.clone();
        assert_eq!(segments.len(), 1);
        assert_eq!(ctx.main.read().unwrap().procs[index].head_segment, segments[0]);
        assert_eq!(ctx.handle_size(handle).unwrap(), 64);
    }
}
