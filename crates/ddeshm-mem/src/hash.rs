//! Integer-keyed open-addressing hash table over a [`Storage`] backend.
//!
//! The table lives entirely in backend memory: a [`HashDescriptor`] plus a
//! slot array, both reachable from the descriptor's [`StoragePtr`]. A second
//! process holding the same arena can [`attach`](HashTable::attach) to the
//! descriptor and operate on the same table.
//!
//! # Probing
//!
//! Double hashing: the primary slot is `key % capacity`, the step is
//! `key % (capacity - 1) + 1`. Capacities are drawn from
//! [`BEST_PRIMES`](crate::primes::BEST_PRIMES), so every step visits the
//! whole table. Lookups stop at the first [`SlotState::Free`] slot.
//!
//! Keys are 32-bit and need not be unique: callers hashing larger logical
//! keys (strings) pass a disambiguator that inspects the stored value.
//!
//! # Growth
//!
//! Before an insert claims a slot in a growable table, the table is rebuilt
//! if the insert would leave fewer than `(1 - max_load) * capacity` free
//! slots, or if tombstones already exceed that bound. A rebuild copies into
//! a fresh slot array (grown to the next best prime when the live count
//! warrants it), or, when the backend cannot supply the memory, compacts
//! tombstones in place. Slot indices are therefore only stable in fixed
//! tables.

use crate::error::MemError;
use crate::primes::{best_prime, grown_capacity, is_best_prime};
use crate::storage::{RawStoragePtr, Storage, StoragePtr};
use ddeshm_log::{debug, warn};
use std::mem::size_of;
use std::ptr::NonNull;

/// State of one slot.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never used since the last rebuild. Ends a probe sequence.
    Free = 0,
    /// Tombstone: reusable by inserts, skipped by lookups.
    Deleted = 1,
    /// Holds a key and value.
    Occupied = 2,
}

impl SlotState {
    const fn from_raw(raw: u32) -> SlotState {
        match raw {
            0 => SlotState::Free,
            2 => SlotState::Occupied,
            _ => SlotState::Deleted,
        }
    }
}

#[repr(C)]
struct SlotHeader {
    state: u32,
    key: u32,
}

const SLOT_HEADER: usize = size_of::<SlotHeader>();

/// Shared control block of a table.
#[repr(C)]
#[derive(Debug)]
pub struct HashDescriptor {
    slots: RawStoragePtr,
    capacity: u32,
    free: u32,
    deleted: u32,
    bytes_per_value: u32,
    stride: u32,
    max_load_permille: u32,
    growable: u32,
    rebuilds: u32,
}

impl HashDescriptor {
    fn live(&self) -> u32 {
        self.capacity - self.free - self.deleted
    }

    /// Slot count below which free slots (and above which tombstones)
    /// trigger a rebuild.
    fn slack_limit(&self) -> u32 {
        let limit = u64::from(self.capacity) * u64::from(1000 - self.max_load_permille) / 1000;
        limit as u32
    }
}

/// Sizing policy fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPolicy {
    /// Maximum load in permille before a rebuild.
    pub max_load_permille: u32,
    /// Whether the table may grow or rebuild at all.
    pub growable: bool,
}

impl HashPolicy {
    /// Growable table with a 70% load bound.
    pub const GROWABLE: HashPolicy = HashPolicy {
        max_load_permille: 700,
        growable: true,
    };

    /// Fixed table: never rebuilt, so slot indices are stable.
    pub const FIXED: HashPolicy = HashPolicy {
        max_load_permille: 1000,
        growable: false,
    };
}

impl Default for HashPolicy {
    fn default() -> Self {
        HashPolicy::GROWABLE
    }
}

/// Table statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashStats {
    /// Number of slots.
    pub capacity: usize,
    /// Occupied slots.
    pub live: usize,
    /// Free slots.
    pub free: usize,
    /// Deleted slots.
    pub tombstones: usize,
    /// Rebuilds performed since creation.
    pub rebuilds: usize,
}

/// Derives a 32-bit key from arbitrary bytes.
#[must_use]
pub fn key_for(bytes: &[u8]) -> u32 {
    fxhash::hash32(bytes)
}

/// View of one slot array in this process.
#[derive(Clone, Copy)]
struct Slots {
    base: NonNull<u8>,
    stride: usize,
    capacity: u32,
}

impl Slots {
    fn header(&self, idx: u32) -> *mut SlotHeader {
        // SAFETY: idx < capacity, and the array spans capacity * stride bytes.
        unsafe { self.base.as_ptr().add(idx as usize * self.stride).cast() }
    }

    fn state(&self, idx: u32) -> SlotState {
        // SAFETY: see `header`.
        SlotState::from_raw(unsafe { (*self.header(idx)).state })
    }

    fn key(&self, idx: u32) -> u32 {
        // SAFETY: see `header`.
        unsafe { (*self.header(idx)).key }
    }

    fn set(&self, idx: u32, state: SlotState, key: u32) {
        // SAFETY: see `header`.
        unsafe {
            self.header(idx).write(SlotHeader {
                state: state as u32,
                key,
            });
        }
    }

    fn value_ptr(&self, idx: u32) -> *mut u8 {
        // SAFETY: the value follows the header inside the slot.
        unsafe { self.header(idx).cast::<u8>().add(SLOT_HEADER) }
    }

    fn probe(&self, key: u32) -> Probe {
        Probe {
            idx: key % self.capacity,
            step: key % (self.capacity - 1) + 1,
            capacity: self.capacity,
            remaining: self.capacity,
        }
    }

    /// First Free or Deleted slot on `key`'s probe path.
    fn vacancy(&self, key: u32) -> Option<u32> {
        self.probe(key)
            .find(|&idx| self.state(idx) != SlotState::Occupied)
    }

    /// Copies a whole slot (header and value) from `self[from]` to
    /// `dst[to]`.
    fn copy_slot(&self, from: u32, dst: &Slots, to: u32) {
        // SAFETY: both slots lie in their arrays and never alias: either
        // the arrays differ or `from != to`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.header(from).cast::<u8>(),
                dst.header(to).cast::<u8>(),
                self.stride,
            );
        }
    }
}

struct Probe {
    idx: u32,
    step: u32,
    capacity: u32,
    remaining: u32,
}

impl Iterator for Probe {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.idx;
        self.idx = ((u64::from(self.idx) + u64::from(self.step)) % u64::from(self.capacity)) as u32;
        Some(current)
    }
}

/// Open-addressing table mapping `u32` keys to fixed-size byte values.
///
/// Nothing here locks; for shared tables the caller holds the arena's
/// write lock around mutation and at least its read lock around lookups.
pub struct HashTable<S: Storage> {
    storage: S,
    desc: StoragePtr,
    desc_addr: NonNull<HashDescriptor>,
}

impl<S: Storage> std::fmt::Debug for HashTable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("desc", &self.desc)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<S: Storage> HashTable<S> {
    /// Creates a growable table holding values of `bytes_per_value` bytes,
    /// with room for at least `hint` slots.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::NoSpace`] when the backend cannot supply the
    /// descriptor or slot array.
    pub fn create(storage: S, bytes_per_value: usize, hint: usize) -> Result<Self, MemError> {
        Self::with_policy(storage, bytes_per_value, hint, HashPolicy::GROWABLE)
    }

    /// Creates a table with an explicit sizing policy.
    ///
    /// # Errors
    ///
    /// As [`HashTable::create`]; [`MemError::TableFull`] when `hint` exceeds
    /// the largest table capacity.
    pub fn with_policy(
        storage: S,
        bytes_per_value: usize,
        hint: usize,
        policy: HashPolicy,
    ) -> Result<Self, MemError> {
        let capacity =
            best_prime(u32::try_from(hint).unwrap_or(u32::MAX)).ok_or(MemError::TableFull)?;
        let bytes_per_value = u32::try_from(bytes_per_value).map_err(|_| MemError::TableFull)?;
        let stride = (SLOT_HEADER as u32 + bytes_per_value + 7) & !7;

        let slots = Self::alloc_slots(&storage, capacity, stride)?;
        let Some(desc) = storage.allocate(size_of::<HashDescriptor>()) else {
            let _ = storage.release(slots);
            return Err(MemError::NoSpace {
                requested: size_of::<HashDescriptor>(),
                free: 0,
            });
        };
        let desc_addr = storage
            .access(desc)
            .ok_or(MemError::UnresolvedPointer)?
            .cast::<HashDescriptor>();

        // SAFETY: freshly allocated, sized and aligned for a descriptor.
        unsafe {
            desc_addr.write(HashDescriptor {
                slots: RawStoragePtr::from(slots),
                capacity,
                free: capacity,
                deleted: 0,
                bytes_per_value,
                stride,
                max_load_permille: policy.max_load_permille.clamp(100, 1000),
                growable: u32::from(policy.growable),
                rebuilds: 0,
            });
        }

        Ok(Self {
            storage,
            desc,
            desc_addr,
        })
    }

    /// Opens a table created elsewhere through the same backend memory.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::UnresolvedPointer`] when `desc` does not resolve,
    /// and [`MemError::InvalidOffset`] when it does not look like a table
    /// descriptor.
    pub fn attach(storage: S, desc: StoragePtr) -> Result<Self, MemError> {
        let desc_addr = storage
            .access(desc)
            .ok_or(MemError::UnresolvedPointer)?
            .cast::<HashDescriptor>();
        let table = Self {
            storage,
            desc,
            desc_addr,
        };

        let d = table.desc();
        let sane = is_best_prime(d.capacity)
            && d.stride as usize >= SLOT_HEADER + d.bytes_per_value as usize
            && u64::from(d.free) + u64::from(d.deleted) <= u64::from(d.capacity)
            && !d.slots.is_null();
        if !sane {
            let offset = match desc {
                StoragePtr::Shared(_, off) => off.get(),
                StoragePtr::Local(_) => 0,
            };
            return Err(MemError::InvalidOffset { offset });
        }
        Ok(table)
    }

    fn alloc_slots(storage: &S, capacity: u32, stride: u32) -> Result<StoragePtr, MemError> {
        let bytes = capacity as usize * stride as usize;
        storage.allocate(bytes).ok_or(MemError::NoSpace {
            requested: bytes,
            free: 0,
        })
    }

    fn desc(&self) -> &HashDescriptor {
        // SAFETY: `desc_addr` was resolved from a live descriptor block.
        unsafe { self.desc_addr.as_ref() }
    }

    fn desc_mut(&mut self) -> &mut HashDescriptor {
        // SAFETY: as in `desc`; `&mut self` serializes access in-process.
        unsafe { self.desc_addr.as_mut() }
    }

    /// Resolves the current slot array. Another process may have rebuilt
    /// the table, so this is done on every operation.
    fn slots(&self) -> Option<Slots> {
        let d = self.desc();
        let base = self.storage.access(d.slots.get()?)?;
        Some(Slots {
            base,
            stride: d.stride as usize,
            capacity: d.capacity,
        })
    }

    /// Location of the descriptor, for [`HashTable::attach`] elsewhere.
    #[must_use]
    pub fn descriptor(&self) -> StoragePtr {
        self.desc
    }

    /// Returns the storage backend.
    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.desc().capacity as usize
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.desc().live() as usize
    }

    /// Whether the table has no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tombstones.
    #[must_use]
    pub fn tombstones(&self) -> usize {
        self.desc().deleted as usize
    }

    /// Bytes stored per value.
    #[must_use]
    pub fn value_len(&self) -> usize {
        self.desc().bytes_per_value as usize
    }

    /// Returns table statistics.
    #[must_use]
    pub fn stats(&self) -> HashStats {
        let d = self.desc();
        HashStats {
            capacity: d.capacity as usize,
            live: d.live() as usize,
            free: d.free as usize,
            tombstones: d.deleted as usize,
            rebuilds: d.rebuilds as usize,
        }
    }

    /// Finds the slot holding `key` whose value satisfies `accept`.
    pub fn find_slot(&self, key: u32, mut accept: impl FnMut(&[u8]) -> bool) -> Option<usize> {
        let slots = self.slots()?;
        let len = self.value_len();
        for idx in slots.probe(key) {
            match slots.state(idx) {
                SlotState::Free => return None,
                SlotState::Deleted => {}
                SlotState::Occupied => {
                    if slots.key(idx) == key {
                        // SAFETY: an occupied slot carries `len` value bytes.
                        let value = unsafe { std::slice::from_raw_parts(slots.value_ptr(idx), len) };
                        if accept(value) {
                            return Some(idx as usize);
                        }
                    }
                }
            }
        }
        None
    }

    /// Looks up the first live entry for `key`.
    #[must_use]
    pub fn lookup(&self, key: u32) -> Option<&[u8]> {
        self.lookup_with(key, |_| true)
    }

    /// Looks up the entry for `key` confirmed by `accept`.
    pub fn lookup_with(&self, key: u32, accept: impl FnMut(&[u8]) -> bool) -> Option<&[u8]> {
        let idx = self.find_slot(key, accept)?;
        self.value_at(idx)
    }

    /// Mutable access to the first live entry for `key`.
    pub fn lookup_mut(&mut self, key: u32) -> Option<&mut [u8]> {
        let idx = self.find_slot(key, |_| true)?;
        self.value_at_mut(idx)
    }

    /// Key stored at slot `idx`, if occupied.
    #[must_use]
    pub fn key_at(&self, idx: usize) -> Option<u32> {
        let slots = self.slots()?;
        let idx = u32::try_from(idx).ok().filter(|&i| i < slots.capacity)?;
        (slots.state(idx) == SlotState::Occupied).then(|| slots.key(idx))
    }

    /// Value stored at slot `idx`, if occupied.
    #[must_use]
    pub fn value_at(&self, idx: usize) -> Option<&[u8]> {
        let slots = self.slots()?;
        let idx = u32::try_from(idx).ok().filter(|&i| i < slots.capacity)?;
        if slots.state(idx) != SlotState::Occupied {
            return None;
        }
        // SAFETY: occupied slot, value bytes live as long as `&self`.
        Some(unsafe { std::slice::from_raw_parts(slots.value_ptr(idx), self.value_len()) })
    }

    /// Mutable value at slot `idx`, if occupied.
    pub fn value_at_mut(&mut self, idx: usize) -> Option<&mut [u8]> {
        let slots = self.slots()?;
        let idx = u32::try_from(idx).ok().filter(|&i| i < slots.capacity)?;
        if slots.state(idx) != SlotState::Occupied {
            return None;
        }
        // SAFETY: as in `value_at`, exclusive through `&mut self`.
        Some(unsafe { std::slice::from_raw_parts_mut(slots.value_ptr(idx), self.value_len()) })
    }

    /// Inserts or overwrites the value for `key`.
    ///
    /// `value` may be shorter than the table's value size; the remainder
    /// is zero-filled. Returns `false` when `value` is too long or no slot
    /// can be found even after a rebuild.
    pub fn insert(&mut self, key: u32, value: &[u8]) -> bool {
        if value.len() > self.value_len() {
            return false;
        }
        self.settle_tombstones();
        if let Some(idx) = self.find_slot(key, |_| true) {
            return self.write_value(idx, value);
        }
        self.insert_new(key, value).is_some()
    }

    /// Adds an entry for `key` without looking for an existing one.
    ///
    /// Returns the slot index, valid until the next mutation of a growable
    /// table.
    pub fn insert_new(&mut self, key: u32, value: &[u8]) -> Option<usize> {
        if value.len() > self.value_len() {
            return None;
        }
        let idx = self.insert_slot(key)?;
        self.write_value(idx, value).then_some(idx)
    }

    /// Claims a slot for `key` with a zeroed value and returns its index.
    pub fn insert_slot(&mut self, key: u32) -> Option<usize> {
        self.reserve_one();

        let slots = self.slots()?;
        let Some(idx) = slots.vacancy(key) else {
            warn!(
                "hash table full ({} slots, {} live)",
                slots.capacity,
                self.desc().live()
            );
            return None;
        };

        let was = slots.state(idx);
        slots.set(idx, SlotState::Occupied, key);
        // SAFETY: the value area of a slot in our array.
        unsafe { std::ptr::write_bytes(slots.value_ptr(idx), 0, self.value_len()) };

        let d = self.desc_mut();
        match was {
            SlotState::Free => d.free -= 1,
            _ => d.deleted -= 1,
        }
        Some(idx as usize)
    }

    fn write_value(&mut self, idx: usize, value: &[u8]) -> bool {
        let Some(dst) = self.value_at_mut(idx) else {
            return false;
        };
        let (head, tail) = dst.split_at_mut(value.len());
        head.copy_from_slice(value);
        tail.fill(0);
        true
    }

    /// Deletes the first live entry for `key`.
    pub fn delete(&mut self, key: u32) -> bool {
        self.delete_with(key, |_| true)
    }

    /// Deletes the entry for `key` confirmed by `accept`.
    pub fn delete_with(&mut self, key: u32, accept: impl FnMut(&[u8]) -> bool) -> bool {
        match self.find_slot(key, accept) {
            Some(idx) => self.delete_at(idx),
            None => false,
        }
    }

    /// Turns the occupied slot `idx` into a tombstone.
    pub fn delete_at(&mut self, idx: usize) -> bool {
        let Some(slots) = self.slots() else {
            return false;
        };
        let Some(idx) = u32::try_from(idx).ok().filter(|&i| i < slots.capacity) else {
            return false;
        };
        if slots.state(idx) != SlotState::Occupied {
            return false;
        }
        slots.set(idx, SlotState::Deleted, slots.key(idx));
        self.desc_mut().deleted += 1;
        true
    }

    /// Iterates `(slot, key, value)` over live entries.
    pub fn iter(&self) -> impl Iterator<Item = (usize, u32, &[u8])> + '_ {
        let slots = self.slots();
        let capacity = slots.map_or(0, |s| s.capacity);
        (0..capacity).filter_map(move |idx| {
            let key = self.key_at(idx as usize)?;
            Some((idx as usize, key, self.value_at(idx as usize)?))
        })
    }

    /// Rebuilds ahead of an insert if the insert would break the load
    /// bounds.
    fn reserve_one(&mut self) {
        let d = self.desc();
        if d.growable == 0 {
            return;
        }
        let limit = d.slack_limit();
        if d.free.saturating_sub(1) < limit || d.deleted > limit {
            let needed = d.live() + 1;
            self.rebuild(needed);
        }
    }

    /// Rebuilds when tombstones exceed the load bounds, even if no slot
    /// is about to be claimed.
    fn settle_tombstones(&mut self) {
        let d = self.desc();
        if d.growable != 0 && d.deleted > d.slack_limit() {
            let needed = d.live() + 1;
            self.rebuild(needed);
        }
    }

    fn rebuild(&mut self, needed: u32) {
        let d = self.desc();
        let capacity = d.capacity;
        let grow = u64::from(needed) * 1000 >= u64::from(capacity) * u64::from(d.max_load_permille);
        let target = if grow {
            grown_capacity(capacity).unwrap_or(capacity)
        } else {
            capacity
        };

        let rehashed = self.rehash_into(target) || (target != capacity && self.rehash_into(capacity));
        if !rehashed {
            self.compact_in_place();
        }
        self.desc_mut().rebuilds += 1;
        debug!(
            "hash table rebuilt: {capacity} -> {} slots, {} live{}",
            self.desc().capacity,
            self.desc().live(),
            if rehashed { "" } else { " (in place)" }
        );
    }

    /// Copies every live entry into a fresh array of `capacity` slots.
    /// Returns `false`, leaving the table untouched, when the backend
    /// cannot supply the array.
    fn rehash_into(&mut self, capacity: u32) -> bool {
        let Some(old) = self.slots() else {
            return false;
        };
        let stride = self.desc().stride;
        let Ok(new_ptr) = Self::alloc_slots(&self.storage, capacity, stride) else {
            return false;
        };
        let Some(base) = self.storage.access(new_ptr) else {
            let _ = self.storage.release(new_ptr);
            return false;
        };
        let new = Slots {
            base,
            stride: stride as usize,
            capacity,
        };

        let mut live = 0;
        for idx in 0..old.capacity {
            if old.state(idx) == SlotState::Occupied
                && let Some(to) = new.vacancy(old.key(idx))
            {
                old.copy_slot(idx, &new, to);
                live += 1;
            }
        }

        let old_ptr = self.desc().slots;
        let d = self.desc_mut();
        d.slots = RawStoragePtr::from(new_ptr);
        d.capacity = capacity;
        d.free = capacity - live;
        d.deleted = 0;
        if let Some(old_ptr) = old_ptr.get() {
            let _ = self.storage.release(old_ptr);
        }
        true
    }

    /// Clears tombstones without scratch memory.
    ///
    /// Tombstones become free slots, which may cut probe paths short; every
    /// entry is then moved to the first free slot ahead of it on its own
    /// path until no entry moves. Each move shortens an entry's path, so
    /// the loop terminates with every path unbroken.
    fn compact_in_place(&mut self) {
        let Some(slots) = self.slots() else {
            return;
        };

        for idx in 0..slots.capacity {
            if slots.state(idx) == SlotState::Deleted {
                slots.set(idx, SlotState::Free, 0);
            }
        }
        let d = self.desc_mut();
        d.free += d.deleted;
        d.deleted = 0;

        loop {
            let mut moved = false;
            for idx in 0..slots.capacity {
                if slots.state(idx) != SlotState::Occupied {
                    continue;
                }
                let target = slots
                    .probe(slots.key(idx))
                    .take_while(|&j| j != idx)
                    .find(|&j| slots.state(j) == SlotState::Free);
                if let Some(to) = target {
                    slots.copy_slot(idx, &slots, to);
                    slots.set(idx, SlotState::Free, 0);
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }

    /// Releases the slot array and descriptor back to the backend.
    ///
    /// # Errors
    ///
    /// Propagates the backend's release failure.
    pub fn destroy(self) -> Result<(), MemError> {
        if let Some(slots) = self.desc().slots.get() {
            self.storage.release(slots)?;
        }
        self.storage.release(self.desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::primes::is_best_prime;
    use crate::storage::{ArenaStorage, HeapRegion, LocalStorage, SegmentId};

    fn xorshift(state: &mut u32) -> u32 {
        *state ^= *state << 13;
        *state ^= *state >> 17;
        *state ^= *state << 5;
        *state
    }

    fn arena_storage(region: &HeapRegion) -> ArenaStorage {
        let arena = unsafe { Arena::create(region.base(), 0, region.len()) };
        ArenaStorage::new(arena, SegmentId(1))
    }

    #[test]
    fn test_insert_lookup_delete() {
        let mut table = HashTable::create(LocalStorage, 4, 13).unwrap();

        assert!(table.insert(7, &1u32.to_ne_bytes()));
        assert!(table.insert(20, &2u32.to_ne_bytes()));
        assert_eq!(table.lookup(7), Some(&1u32.to_ne_bytes()[..]));
        assert_eq!(table.len(), 2);

        // Overwrite in place.
        assert!(table.insert(7, &3u32.to_ne_bytes()));
        assert_eq!(table.lookup(7), Some(&3u32.to_ne_bytes()[..]));
        assert_eq!(table.len(), 2);

        assert!(table.delete(7));
        assert!(!table.delete(7));
        assert_eq!(table.lookup(7), None);
        assert_eq!(table.lookup(20), Some(&2u32.to_ne_bytes()[..]));
        assert_eq!(table.tombstones(), 1);
    }

    #[test]
    fn test_value_too_long_rejected() {
        let mut table = HashTable::create(LocalStorage, 2, 7).unwrap();
        assert!(!table.insert(1, &[1, 2, 3]));
        assert!(table.insert(1, &[9]));
        assert_eq!(table.lookup(1), Some(&[9u8, 0][..]));
    }

    #[test]
    fn test_grow_from_thirteen() {
        let mut table = HashTable::create(LocalStorage, 4, 13).unwrap();
        assert_eq!(table.capacity(), 13);

        for key in 0..20u32 {
            assert!(table.insert(key * 1009, &key.to_ne_bytes()));
            assert!(is_best_prime(table.capacity() as u32));
        }

        assert!(table.stats().rebuilds >= 1);
        assert!(table.capacity() >= 19);
        for key in 0..20u32 {
            assert_eq!(table.lookup(key * 1009), Some(&key.to_ne_bytes()[..]));
        }
    }

    #[test]
    fn test_colliding_keys_need_disambiguator() {
        let mut table = HashTable::create(LocalStorage, 1, 7).unwrap();
        table.insert_new(5, b"a").unwrap();
        table.insert_new(5, b"b").unwrap();
        table.insert_new(12, b"c").unwrap(); // same primary slot as 5

        assert_eq!(table.lookup_with(5, |v| v == b"b"), Some(&b"b"[..]));
        assert!(table.delete_with(5, |v| v == b"a"));
        assert_eq!(table.lookup_with(5, |v| v == b"a"), None);
        assert_eq!(table.lookup_with(5, |v| v == b"b"), Some(&b"b"[..]));
        assert_eq!(table.lookup(12), Some(&b"c"[..]));
    }

    #[test]
    fn test_fixed_table_never_rebuilds() {
        let mut table = HashTable::with_policy(LocalStorage, 0, 7, HashPolicy::FIXED).unwrap();

        let slots: Vec<_> = (0..7).map(|k| table.insert_slot(k).unwrap()).collect();
        assert!(table.insert_slot(100).is_none());
        assert_eq!(table.capacity(), 7);
        assert_eq!(table.stats().rebuilds, 0);

        // Deleted slots are reused, indices never move.
        assert!(table.delete_at(slots[3]));
        assert_eq!(table.insert_slot(3), Some(slots[3]));
        for (k, &idx) in slots.iter().enumerate() {
            assert_eq!(table.key_at(idx), Some(k as u32));
        }
    }

    #[test]
    fn test_tombstones_trigger_rebuild() {
        let mut table = HashTable::create(LocalStorage, 4, 29).unwrap();
        for round in 0..50u32 {
            assert!(table.insert(round, &round.to_ne_bytes()));
            if round >= 5 {
                assert!(table.delete(round - 5));
            }
        }

        let stats = table.stats();
        assert!(stats.rebuilds >= 1);
        assert_eq!(stats.capacity, 29);
        for key in 45..50u32 {
            assert_eq!(table.lookup(key), Some(&key.to_ne_bytes()[..]));
        }
        for key in 0..45u32 {
            assert_eq!(table.lookup(key), None);
        }
    }

    #[test]
    fn test_in_place_compaction_when_backend_is_full() {
        // Header, slot array (13 x 16 bytes) and descriptor, plus 64 bytes
        // of slack: too little for a second slot array.
        let region = HeapRegion::new(32 + 224 + 64 + 64).unwrap();
        let storage = arena_storage(&region);
        let mut table = HashTable::create(storage, 4, 13).unwrap();

        for key in 1..=8u32 {
            assert!(table.insert(key, &key.to_ne_bytes()));
        }
        for key in 1..=4u32 {
            assert!(table.delete(key));
        }
        assert_eq!(table.tombstones(), 4);

        assert!(table.insert(100, &100u32.to_ne_bytes()));
        let stats = table.stats();
        assert_eq!(stats.rebuilds, 1);
        assert_eq!(stats.tombstones, 0);
        assert_eq!(stats.capacity, 13);

        for key in (5..=8u32).chain([100]) {
            assert_eq!(table.lookup(key), Some(&key.to_ne_bytes()[..]));
        }
        storage.arena().check().unwrap();
    }

    #[test]
    fn test_compaction_repairs_probe_paths() {
        let mut table = HashTable::with_policy(LocalStorage, 4, 13, HashPolicy::FIXED).unwrap();
        // All share primary slot 0 and step 1.
        for key in [0u32, 13 * 12, 26 * 12, 39 * 12] {
            table.insert_new(key, &key.to_ne_bytes()).unwrap();
        }
        assert!(table.delete(0));
        assert!(table.delete(13 * 12));

        table.compact_in_place();
        assert_eq!(table.tombstones(), 0);
        for key in [26 * 12, 39 * 12] {
            assert_eq!(table.lookup(key), Some(&key.to_ne_bytes()[..]));
        }
    }

    #[test]
    fn test_attach_shares_table() {
        let region = HeapRegion::new(8192).unwrap();
        let storage = arena_storage(&region);
        let mut first = HashTable::create(storage, 4, 7).unwrap();
        first.insert(1, &11u32.to_ne_bytes());

        let mut second = HashTable::attach(storage, first.descriptor()).unwrap();
        assert_eq!(second.lookup(1), Some(&11u32.to_ne_bytes()[..]));

        // Growth in one view is visible in the other.
        for key in 2..30u32 {
            second.insert(key, &key.to_ne_bytes());
        }
        assert_eq!(first.capacity(), second.capacity());
        assert_eq!(first.lookup(29), Some(&29u32.to_ne_bytes()[..]));
    }

    #[test]
    fn test_attach_rejects_garbage() {
        let region = HeapRegion::new(4096).unwrap();
        let storage = arena_storage(&region);
        let junk = storage.allocate(64).unwrap();
        assert!(HashTable::attach(storage, junk).is_err());
    }

    #[test]
    fn test_random_ops_match_model() {
        let mut table = HashTable::create(LocalStorage, 4, 7).unwrap();
        let mut model = std::collections::HashMap::new();
        let mut seed = 0x1234_5678;

        for _ in 0..5000 {
            let key = xorshift(&mut seed) % 300;
            let value = xorshift(&mut seed);
            if xorshift(&mut seed) % 3 == 0 {
                assert_eq!(table.delete(key), model.remove(&key).is_some());
            } else {
                assert!(table.insert(key, &value.to_ne_bytes()));
                model.insert(key, value);

                let stats = table.stats();
                let limit = stats.capacity * 300 / 1000;
                assert!(stats.free >= limit);
                assert!(stats.tombstones <= limit);
            }
            assert!(is_best_prime(table.capacity() as u32));
        }

        assert_eq!(table.len(), model.len());
        for (key, value) in &model {
            assert_eq!(table.lookup(*key), Some(&value.to_ne_bytes()[..]));
        }
        assert_eq!(table.iter().count(), model.len());
    }

    #[test]
    fn test_destroy_returns_memory() {
        let region = HeapRegion::new(8192).unwrap();
        let storage = arena_storage(&region);
        let mut table = HashTable::create(storage, 8, 13).unwrap();
        for key in 0..40u32 {
            table.insert(key, &[1; 8]);
        }
        table.destroy().unwrap();
        assert_eq!(storage.arena().free_bytes(), storage.arena().size());
    }
}
