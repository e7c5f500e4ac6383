//! First-fit fragment allocator over a raw memory region.
//!
//! An [`Arena`] manages one contiguous region: a shared-memory segment in
//! production, a [`HeapRegion`](crate::storage::HeapRegion) in tests. The
//! region starts with an [`ArenaHeader`]; fragments begin at a caller-chosen
//! first usable offset so that other fixed structures may sit between the
//! header and the fragment area.
//!
//! # Layout
//!
//! ```text
//! base ──► ArenaHeader | caller data | frag | frag | ...... | frag │ end
//!                                     ▲
//!                                     first
//! ```
//!
//! Every fragment starts with an 8-byte header `{ size, link }`. A free
//! fragment's `link` is the offset of the next free fragment (0 ends the
//! list); an allocated fragment's `link` holds a marker used to reject
//! double frees. Fragment sizes include the header and are multiples of 16.
//!
//! # Invariants
//!
//! - The sizes of all fragments, free and allocated, sum to [`Arena::size`].
//! - The free list is in ascending address order.
//! - No two free fragments are address-adjacent once `free` returns.
//!
//! Allocation splits a larger free fragment by shrinking it in place and
//! handing out its high-address tail, so the free list never needs to be
//! relinked on a split.
//!
//! # Example
//!
//! ```
//! use ddeshm_mem::{Arena, HeapRegion};
//!
//! let region = HeapRegion::new(64 * 1024).unwrap();
//! let arena = unsafe { Arena::create(region.base(), 64, region.len()) };
//!
//! let a = arena.alloc(100).unwrap();
//! let b = arena.alloc(5000).unwrap();
//! arena.free(a).unwrap();
//! arena.free(b).unwrap();
//!
//! assert_eq!(arena.free_bytes(), arena.size());
//! ```

use crate::error::MemError;
use ddeshm_log::{error, trace};
use std::mem::size_of;
use std::ptr::NonNull;

/// Fragment sizes are multiples of this.
pub const FRAGMENT_ALIGN: u32 = 16;

/// Bytes of bookkeeping in front of every fragment payload.
pub const FRAGMENT_HEADER: u32 = 8;

/// `link` value of an allocated fragment.
const USED_MARK: u32 = 0xA110_CA7E;

const NIL: u32 = 0;

/// Byte offset from the start of an arena's region.
///
/// Offsets, not pointers, are what shared structures store: each process
/// maps a segment at its own address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(u32);

impl Offset {
    /// Wraps a raw offset.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw offset.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the raw offset as `usize`.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Control block at the start of every arena region.
#[repr(C)]
#[derive(Debug)]
pub struct ArenaHeader {
    /// Bytes under management (sum of all fragment sizes).
    size: u32,
    /// Bytes currently on the free list.
    free: u32,
    /// Offset of the lowest free fragment, `NIL` when none.
    free_list: u32,
    /// Offset of the first fragment.
    first: u32,
    /// Index of the owning process, -1 when unowned.
    owner: i32,
    /// Segment id of the next arena in the owner's chain, -1 ends the chain.
    next_segment: i32,
    _reserved: [u32; 2],
}

/// Size of [`ArenaHeader`] in bytes.
pub const ARENA_HEADER_SIZE: usize = size_of::<ArenaHeader>();

#[repr(C)]
struct Fragment {
    size: u32,
    link: u32,
}

/// Allocation statistics of one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes under management.
    pub size: usize,
    /// Bytes on the free list.
    pub free: usize,
    /// Number of free fragments.
    pub free_fragments: usize,
    /// Number of allocated fragments.
    pub used_fragments: usize,
    /// Size of the largest free fragment, header included.
    pub largest_free: usize,
}

/// One fragment as seen by [`Arena::fragments`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Offset of the fragment header.
    pub offset: u32,
    /// Fragment size including the header.
    pub size: u32,
    /// Whether the fragment is on the free list.
    pub free: bool,
}

/// Handle to an arena living in externally owned memory.
///
/// `Arena` is a thin view: copying it copies the base pointer, not the
/// region. It performs no locking; every mutating call must be serialized by
/// the caller (in shared memory, under the write side of the owning lock).
#[derive(Debug, Clone, Copy)]
pub struct Arena {
    base: NonNull<u8>,
}

const fn round_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

impl Arena {
    /// Formats a region as an empty arena.
    ///
    /// `first` is rounded up to [`FRAGMENT_ALIGN`] and clamped above the
    /// header; the managed size is whatever remains of `len`, rounded down
    /// to [`FRAGMENT_ALIGN`].
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes, aligned to
    /// 16, and not concurrently accessed. Nothing else may use the bytes
    /// from `first` onwards.
    #[must_use]
    pub unsafe fn create(base: NonNull<u8>, first: usize, len: usize) -> Self {
        let len = u32::try_from(len).unwrap_or(u32::MAX) & !(FRAGMENT_ALIGN - 1);
        let first = round_up(
            u32::try_from(first.max(ARENA_HEADER_SIZE)).unwrap_or(len),
            FRAGMENT_ALIGN,
        );
        let size = len.saturating_sub(first);

        let arena = Arena { base };
        // SAFETY: caller guarantees the header bytes are ours to write.
        unsafe {
            base.cast::<ArenaHeader>().as_ptr().write(ArenaHeader {
                size,
                free: size,
                free_list: if size > 0 { first } else { NIL },
                first,
                owner: -1,
                next_segment: -1,
                _reserved: [0; 2],
            });
            if size > 0 {
                arena.frag(first).write(Fragment { size, link: NIL });
            }
        }
        arena
    }

    /// Reopens an arena previously formatted with [`Arena::create`].
    ///
    /// # Safety
    ///
    /// `base` must point at a region formatted by `create` that stays mapped
    /// for as long as the returned view is used.
    #[must_use]
    pub const unsafe fn from_raw(base: NonNull<u8>) -> Self {
        Arena { base }
    }

    /// Returns the region's base address in this process.
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn header(&self) -> &ArenaHeader {
        // SAFETY: `base` points at a formatted header (constructor contract).
        unsafe { self.base.cast::<ArenaHeader>().as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut ArenaHeader {
        // SAFETY: as above; mutation is serialized by the caller's lock and
        // no other reference to the header outlives a single method call.
        unsafe { self.base.cast::<ArenaHeader>().as_mut() }
    }

    /// Pointer to the fragment header at `offset`.
    fn frag(&self, offset: u32) -> *mut Fragment {
        // SAFETY: callers only pass offsets inside [first, first + size).
        unsafe { self.base.as_ptr().add(offset as usize).cast::<Fragment>() }
    }

    fn frag_size(&self, offset: u32) -> u32 {
        // SAFETY: `offset` addresses a fragment header inside the region.
        unsafe { (*self.frag(offset)).size }
    }

    fn frag_link(&self, offset: u32) -> u32 {
        // SAFETY: as in `frag_size`.
        unsafe { (*self.frag(offset)).link }
    }

    fn set_frag(&self, offset: u32, size: u32, link: u32) {
        // SAFETY: as in `frag_size`.
        unsafe { self.frag(offset).write(Fragment { size, link }) }
    }

    fn set_link(&self, offset: u32, link: u32) {
        // SAFETY: as in `frag_size`.
        unsafe { (*self.frag(offset)).link = link }
    }

    /// Bytes under management.
    #[must_use]
    pub fn size(&self) -> usize {
        self.header().size as usize
    }

    /// Bytes currently free, fragment headers included.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.header().free as usize
    }

    /// Offset of the first fragment.
    #[must_use]
    pub fn first(&self) -> u32 {
        self.header().first
    }

    /// Index of the owning process, `None` when unowned.
    #[must_use]
    pub fn owner(&self) -> Option<usize> {
        usize::try_from(self.header().owner).ok()
    }

    /// Records the owning process index.
    pub fn set_owner(&self, owner: Option<usize>) {
        self.header_mut().owner = owner.and_then(|o| i32::try_from(o).ok()).unwrap_or(-1);
    }

    /// Segment id of the next arena in the owner's chain.
    #[must_use]
    pub fn next_segment(&self) -> Option<i32> {
        let next = self.header().next_segment;
        (next >= 0).then_some(next)
    }

    /// Links the next arena of the owner's chain.
    pub fn set_next_segment(&self, next: Option<i32>) {
        self.header_mut().next_segment = next.unwrap_or(-1);
    }

    /// Payload capacity a request of `size` bytes consumes, header included.
    #[must_use]
    pub fn fragment_size_for(size: usize) -> Option<u32> {
        let padded = u32::try_from(size).ok()?.checked_add(FRAGMENT_HEADER + FRAGMENT_ALIGN - 1)?;
        Some(padded & !(FRAGMENT_ALIGN - 1))
    }

    /// Allocates `size` bytes, returning the payload offset.
    ///
    /// First fit over the address-ordered free list. Returns `None` when no
    /// free fragment is large enough; the arena itself never grows.
    pub fn alloc(&self, size: usize) -> Option<Offset> {
        let need = Self::fragment_size_for(size)?;

        let mut prev = NIL;
        let mut cur = self.header().free_list;
        while cur != NIL {
            let cur_size = self.frag_size(cur);
            if cur_size >= need {
                let taken = if cur_size == need {
                    let next = self.frag_link(cur);
                    if prev == NIL {
                        self.header_mut().free_list = next;
                    } else {
                        self.set_link(prev, next);
                    }
                    cur
                } else {
                    // Keep the low part in place on the list, hand out the tail.
                    let remaining = cur_size - need;
                    // SAFETY: `cur` is a live free fragment.
                    unsafe { (*self.frag(cur)).size = remaining };
                    cur + remaining
                };

                self.set_frag(taken, need, USED_MARK);
                self.header_mut().free -= need;
                trace!("alloc {size} bytes -> fragment {taken:#x} ({need} bytes)");
                return Some(Offset(taken + FRAGMENT_HEADER));
            }
            prev = cur;
            cur = self.frag_link(cur);
        }

        trace!("alloc {size} bytes failed, {} bytes free", self.free_bytes());
        None
    }

    /// Validates that `offset` is the payload of an allocated fragment and
    /// returns the fragment offset and size.
    fn used_fragment(&self, offset: Offset) -> Result<(u32, u32), MemError> {
        let header = self.header();
        let raw = offset.get();
        let end = header.first + header.size;

        let Some(frag) = raw.checked_sub(FRAGMENT_HEADER) else {
            return Err(MemError::InvalidOffset { offset: raw });
        };
        if frag < header.first || frag >= end || frag % FRAGMENT_ALIGN != 0 {
            return Err(MemError::InvalidOffset { offset: raw });
        }

        let size = self.frag_size(frag);
        if self.frag_link(frag) != USED_MARK
            || size < FRAGMENT_ALIGN
            || size % FRAGMENT_ALIGN != 0
            || size > end - frag
        {
            return Err(MemError::CorruptFragment { offset: frag });
        }
        Ok((frag, size))
    }

    /// Returns a fragment to the free list, merging it with free neighbours.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::InvalidOffset`] for offsets outside the fragment
    /// area and [`MemError::CorruptFragment`] for double frees or damaged
    /// headers. The arena is left untouched in both cases.
    pub fn free(&self, offset: Offset) -> Result<(), MemError> {
        let (frag, size) = self.used_fragment(offset).inspect_err(|e| {
            error!("free({:#x}) rejected: {e}", offset.get());
        })?;

        let mut prev = NIL;
        let mut next = self.header().free_list;
        while next != NIL && next < frag {
            prev = next;
            next = self.frag_link(next);
        }

        self.set_frag(frag, size, next);
        if prev == NIL {
            self.header_mut().free_list = frag;
        } else {
            self.set_link(prev, frag);
        }

        if next != NIL && frag + size == next {
            trace!("merge {frag:#x} with following {next:#x}");
            self.set_frag(frag, size + self.frag_size(next), self.frag_link(next));
        }
        if prev != NIL && prev + self.frag_size(prev) == frag {
            trace!("merge {frag:#x} into preceding {prev:#x}");
            self.set_frag(prev, self.frag_size(prev) + self.frag_size(frag), self.frag_link(frag));
        }

        self.header_mut().free += size;
        Ok(())
    }

    /// Checks whether `offset` is the payload of a live allocation.
    #[must_use]
    pub fn is_allocated(&self, offset: Offset) -> bool {
        self.used_fragment(offset).is_ok()
    }

    /// Usable payload bytes of the allocation at `offset`.
    #[must_use]
    pub fn usable_size(&self, offset: Offset) -> Option<usize> {
        self.used_fragment(offset)
            .ok()
            .map(|(_, size)| (size - FRAGMENT_HEADER) as usize)
    }

    /// Resolves an offset to an address in this process.
    #[must_use]
    pub fn ptr(&self, offset: Offset) -> NonNull<u8> {
        // SAFETY: offsets handed out by this arena lie inside the region.
        unsafe { self.base.add(offset.as_usize()) }
    }

    /// Converts an address inside the region back to an offset.
    #[must_use]
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<Offset> {
        let delta = ptr.as_ptr().addr().checked_sub(self.base.as_ptr().addr())?;
        let header = self.header();
        let delta = u32::try_from(delta).ok()?;
        (delta < header.first + header.size).then_some(Offset(delta))
    }

    /// Walks every fragment in address order.
    pub fn fragments(&self) -> impl Iterator<Item = FragmentInfo> + '_ {
        let end = self.header().first + self.header().size;
        let mut cur = self.header().first;
        std::iter::from_fn(move || {
            if cur >= end {
                return None;
            }
            let size = self.frag_size(cur);
            if size == 0 {
                return None;
            }
            let info = FragmentInfo {
                offset: cur,
                size,
                free: self.frag_link(cur) != USED_MARK,
            };
            cur += size;
            Some(info)
        })
    }

    /// Walks the free list.
    pub fn free_fragments(&self) -> impl Iterator<Item = FragmentInfo> + '_ {
        let mut cur = self.header().free_list;
        std::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            let info = FragmentInfo {
                offset: cur,
                size: self.frag_size(cur),
                free: true,
            };
            cur = self.frag_link(cur);
            Some(info)
        })
    }

    /// Returns allocation statistics.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats {
            size: self.size(),
            free: self.free_bytes(),
            free_fragments: 0,
            used_fragments: 0,
            largest_free: 0,
        };
        for frag in self.fragments() {
            if frag.free {
                stats.free_fragments += 1;
                stats.largest_free = stats.largest_free.max(frag.size as usize);
            } else {
                stats.used_fragments += 1;
            }
        }
        stats
    }

    /// Verifies the structural invariants listed in the module docs.
    ///
    /// # Errors
    ///
    /// Returns the offset of the first fragment found inconsistent.
    pub fn check(&self) -> Result<(), MemError> {
        let header = self.header();
        let end = header.first + header.size;

        let mut total = 0u32;
        let mut cur = header.first;
        while cur < end {
            let size = self.frag_size(cur);
            if size < FRAGMENT_ALIGN || size % FRAGMENT_ALIGN != 0 || size > end - cur {
                return Err(MemError::CorruptFragment { offset: cur });
            }
            total += size;
            cur += size;
        }
        if total != header.size {
            return Err(MemError::CorruptFragment { offset: cur });
        }

        let mut free_total = 0u32;
        let mut last_end: Option<u32> = None;
        for frag in self.free_fragments() {
            if let Some(prev_end) = last_end
                && frag.offset <= prev_end
            {
                // Out of order (<) or adjacent to the previous free fragment (==).
                return Err(MemError::CorruptFragment { offset: frag.offset });
            }
            free_total += frag.size;
            last_end = Some(frag.offset + frag.size);
        }
        if free_total != header.free {
            return Err(MemError::CorruptFragment { offset: header.free_list });
        }
        Ok(())
    }
}
