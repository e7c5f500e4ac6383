//! Memory primitives for the `ddeshm` DDE subsystem.
//!
//! Everything in this crate works on memory it is handed, addressed by
//! offsets rather than pointers, so the same structures stay valid when a
//! segment is mapped at a different address in every process:
//!
//! - **Arena**: first-fit fragment allocator with a coalescing free list
//! - **Storage backends**: heap-backed or arena-backed allocation behind
//!   the [`Storage`] trait
//! - **Hash table**: integer-keyed open-addressing table sized from a
//!   table of primes kept away from powers of two
//! - **Bit arrays**: fixed-capacity first-fit slot maps
//! - **Atoms**: fixed-capacity, case-insensitive, refcounted string table
//!
//! Nothing here locks. Callers serialize mutation of shared structures.

pub mod arena;
pub mod atom;
pub mod bitmap;
pub mod error;
pub mod hash;
pub mod primes;
pub mod storage;

pub use arena::{Arena, ArenaHeader, ArenaStats, Offset};
pub use atom::{Atom, AtomTable, MIN_STR_ATOM};
pub use bitmap::BitArray;
pub use error::MemError;
pub use hash::{HashDescriptor, HashPolicy, HashStats, HashTable, SlotState};
pub use storage::{
    ArenaStorage, HeapRegion, LocalStorage, RawStoragePtr, SegmentId, Storage,
    StoragePtr,
};
