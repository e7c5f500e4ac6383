//! Storage backends for tables.
//!
//! A table never touches memory directly: it asks a [`Storage`] backend for
//! blocks and resolves the returned [`StoragePtr`] through the same backend
//! every time it needs an address. The same table code therefore runs on
//! the process heap ([`LocalStorage`]) and inside a shared arena
//! ([`ArenaStorage`]), where the stored pointer must be a segment-relative
//! offset.

use crate::arena::{Arena, Offset};
use crate::error::MemError;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Alignment of every block handed out by the backends in this module.
pub const STORAGE_ALIGN: usize = 16;

/// SysV shared-memory segment id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(pub i32);

/// Location of a block owned by a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePtr {
    /// Address in this process' heap. Never stored in shared memory.
    Local(NonNull<u8>),
    /// Offset inside a shared segment, valid in every attached process.
    Shared(SegmentId, Offset),
}

/// Fixed-layout encoding of an optional [`StoragePtr`].
///
/// This is what shared descriptors embed. Tag 0 means "no block".
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawStoragePtr {
    tag: u32,
    segment: i32,
    addr: u64,
}

const TAG_NONE: u32 = 0;
const TAG_LOCAL: u32 = 1;
const TAG_SHARED: u32 = 2;

impl RawStoragePtr {
    /// The "no block" value.
    pub const NULL: RawStoragePtr = RawStoragePtr {
        tag: TAG_NONE,
        segment: -1,
        addr: 0,
    };

    /// Decodes the pointer, `None` for [`RawStoragePtr::NULL`] or garbage.
    #[must_use]
    pub fn get(self) -> Option<StoragePtr> {
        match self.tag {
            TAG_LOCAL => NonNull::new(std::ptr::with_exposed_provenance_mut::<u8>(
                usize::try_from(self.addr).ok()?,
            )).map(StoragePtr::Local),
            TAG_SHARED => Some(StoragePtr::Shared(
                SegmentId(self.segment),
                Offset::new(u32::try_from(self.addr).ok()?),
            )),
            _ => None,
        }
    }

    /// Encodes the pointer for storage inside a table value.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..4].copy_from_slice(&self.tag.to_ne_bytes());
        out[4..8].copy_from_slice(&self.segment.to_ne_bytes());
        out[8..].copy_from_slice(&self.addr.to_ne_bytes());
        out
    }

    /// Decodes a value written by [`RawStoragePtr::to_bytes`].
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let word = |range: std::ops::Range<usize>| bytes.get(range).unwrap_or(&[]);
        RawStoragePtr {
            tag: word(0..4).try_into().map_or(TAG_NONE, u32::from_ne_bytes),
            segment: word(4..8).try_into().map_or(-1, i32::from_ne_bytes),
            addr: word(8..16).try_into().map_or(0, u64::from_ne_bytes),
        }
    }

    /// Whether this is the null value.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.tag == TAG_NONE
    }
}

impl From<StoragePtr> for RawStoragePtr {
    fn from(ptr: StoragePtr) -> Self {
        match ptr {
            StoragePtr::Local(p) => RawStoragePtr {
                tag: TAG_LOCAL,
                segment: -1,
                addr: p.as_ptr().expose_provenance() as u64,
            },
            StoragePtr::Shared(segment, offset) => RawStoragePtr {
                tag: TAG_SHARED,
                segment: segment.0,
                addr: u64::from(offset.get()),
            },
        }
    }
}

impl From<Option<StoragePtr>> for RawStoragePtr {
    fn from(ptr: Option<StoragePtr>) -> Self {
        ptr.map_or(RawStoragePtr::NULL, RawStoragePtr::from)
    }
}

/// Allocation backend used by [`HashTable`](crate::HashTable) and
/// [`AtomTable`](crate::AtomTable).
///
/// Blocks are zero-filled and at least 8-byte aligned.
pub trait Storage {
    /// Allocates `bytes` bytes, `None` when the backend is exhausted.
    fn allocate(&self, bytes: usize) -> Option<StoragePtr>;

    /// Resolves a pointer to an address in this process.
    fn access(&self, ptr: StoragePtr) -> Option<NonNull<u8>>;

    /// Returns a block to the backend.
    ///
    /// # Errors
    ///
    /// Fails when `ptr` was not handed out by this backend.
    fn release(&self, ptr: StoragePtr) -> Result<(), MemError>;
}

/// Heap-backed storage for tables private to one process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

impl LocalStorage {
    fn layout(bytes: usize) -> Option<Layout> {
        Layout::from_size_align(bytes.checked_add(STORAGE_ALIGN)?, STORAGE_ALIGN).ok()
    }
}

impl Storage for LocalStorage {
    fn allocate(&self, bytes: usize) -> Option<StoragePtr> {
        let layout = Self::layout(bytes)?;
        // SAFETY: the layout has non-zero size.
        let start = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        // SAFETY: the block is at least STORAGE_ALIGN bytes and 16-aligned;
        // the prefix records the payload size for `release`.
        unsafe {
            start.cast::<usize>().write(bytes);
            Some(StoragePtr::Local(start.add(STORAGE_ALIGN)))
        }
    }

    fn access(&self, ptr: StoragePtr) -> Option<NonNull<u8>> {
        match ptr {
            StoragePtr::Local(p) => Some(p),
            StoragePtr::Shared(..) => None,
        }
    }

    fn release(&self, ptr: StoragePtr) -> Result<(), MemError> {
        let StoragePtr::Local(p) = ptr else {
            return Err(MemError::UnresolvedPointer);
        };
        // SAFETY: `p` came from `allocate`, which put the size prefix
        // STORAGE_ALIGN bytes in front of it.
        unsafe {
            let start = p.sub(STORAGE_ALIGN);
            let bytes = start.cast::<usize>().read();
            let layout = Self::layout(bytes).ok_or(MemError::UnresolvedPointer)?;
            alloc::dealloc(start.as_ptr(), layout);
        }
        Ok(())
    }
}

/// Storage carved out of one [`Arena`].
///
/// The arena is usually a mapped shared segment, so pointers are recorded
/// as `(segment, offset)` pairs. Callers hold the arena's write lock around
/// `allocate` and `release`.
#[derive(Debug, Clone, Copy)]
pub struct ArenaStorage {
    arena: Arena,
    segment: SegmentId,
}

impl ArenaStorage {
    /// Wraps an arena mapped in this process.
    #[must_use]
    pub const fn new(arena: Arena, segment: SegmentId) -> Self {
        Self { arena, segment }
    }

    /// Returns the underlying arena.
    #[must_use]
    pub const fn arena(&self) -> Arena {
        self.arena
    }

    /// Returns the segment id recorded in pointers.
    #[must_use]
    pub const fn segment(&self) -> SegmentId {
        self.segment
    }
}

impl Storage for ArenaStorage {
    fn allocate(&self, bytes: usize) -> Option<StoragePtr> {
        let offset = self.arena.alloc(bytes)?;
        // SAFETY: the fragment payload holds at least `bytes` bytes.
        unsafe { std::ptr::write_bytes(self.arena.ptr(offset).as_ptr(), 0, bytes) };
        Some(StoragePtr::Shared(self.segment, offset))
    }

    fn access(&self, ptr: StoragePtr) -> Option<NonNull<u8>> {
        match ptr {
            StoragePtr::Shared(segment, offset) if segment == self.segment => {
                self.arena.is_allocated(offset).then(|| self.arena.ptr(offset))
            }
            _ => None,
        }
    }

    fn release(&self, ptr: StoragePtr) -> Result<(), MemError> {
        match ptr {
            StoragePtr::Shared(segment, offset) if segment == self.segment => {
                self.arena.free(offset)
            }
            _ => Err(MemError::UnresolvedPointer),
        }
    }
}

/// A zeroed, 16-aligned heap block.
///
/// Stands in for a mapped segment wherever an arena is needed without OS
/// shared memory, and backs the per-process arenas of local tables.
#[derive(Debug)]
pub struct HeapRegion {
    start: NonNull<u8>,
    len: usize,
}

impl HeapRegion {
    /// Allocates a zeroed region of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::NoSpace`] when `len` is zero or the allocation
    /// fails.
    pub fn new(len: usize) -> Result<Self, MemError> {
        let no_space = MemError::NoSpace {
            requested: len,
            free: 0,
        };
        if len == 0 {
            return Err(no_space);
        }
        let layout = Layout::from_size_align(len, STORAGE_ALIGN).map_err(|_| no_space.clone())?;
        // SAFETY: non-zero size checked above.
        let start = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(no_space)?;
        Ok(Self { start, len })
    }

    /// Base address of the region.
    #[must_use]
    pub const fn base(&self) -> NonNull<u8> {
        self.start
    }

    /// Length in bytes.
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: same layout as in `new`, which validated it.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.len, STORAGE_ALIGN);
            alloc::dealloc(self.start.as_ptr(), layout);
        }
    }
}
