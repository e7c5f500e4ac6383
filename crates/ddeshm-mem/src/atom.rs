//! Case-insensitive, refcounted atom table.
//!
//! An atom is a 16-bit handle for a string. Two kinds exist:
//!
//! - **Integer atoms** `1..MIN_STR_ATOM`, spelled `#<digits>`. They carry
//!   no storage and are never entered in the table.
//! - **String atoms** `MIN_STR_ATOM + slot`, one per slot of a fixed
//!   157-slot [`HashTable`]. The slot value points at a record
//!   `{ refcount, len, bytes }` allocated from the same storage backend.
//!
//! The table never grows, so a slot index (and thus an atom) stays valid
//! until its refcount drops to zero. Released slots become tombstones, which
//! keeps the probe paths of the remaining atoms intact.
//!
//! # Example
//!
//! ```
//! use ddeshm_mem::{AtomTable, LocalStorage};
//!
//! let mut atoms = AtomTable::create(LocalStorage).unwrap();
//!
//! let foo = atoms.add("Foo").unwrap();
//! assert_eq!(atoms.add("FOO").unwrap(), foo);
//! assert_eq!(atoms.refcount(foo), Some(2));
//! assert_eq!(atoms.get_name(foo).as_deref(), Some("Foo"));
//!
//! let small = atoms.add("#42").unwrap();
//! assert_eq!(small.get(), 42);
//! ```

use crate::error::MemError;
use crate::hash::{HashPolicy, HashTable};
use crate::storage::{RawStoragePtr, Storage, StoragePtr};
use ddeshm_log::{trace, warn};
use std::fmt;
use std::mem::size_of;

/// First string atom; integer atoms lie below.
pub const MIN_STR_ATOM: u16 = 0xC000;

/// Number of atom slots.
pub const ATOM_SLOTS: usize = 157;

/// Longest accepted atom name in bytes.
pub const MAX_ATOM_LEN: usize = 255;

const RECORD_HEADER: usize = 2 * size_of::<u32>();
const VALUE_LEN: usize = size_of::<RawStoragePtr>();

/// A 16-bit atom handle. Zero is the invalid atom.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Atom(u16);

impl Atom {
    /// The invalid atom.
    pub const INVALID: Atom = Atom(0);

    /// Wraps a raw atom value.
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw atom value.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Whether this is a non-zero atom.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Whether this is an integer (`#N`) atom.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        self.0 != 0 && self.0 < MIN_STR_ATOM
    }

    fn slot(self) -> Option<usize> {
        let idx = usize::from(self.0.checked_sub(MIN_STR_ATOM)?);
        (idx < ATOM_SLOTS).then_some(idx)
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atom({:#06x})", self.0)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Parses `#<digits>`. `Ok(None)` means `name` is an ordinary string.
fn integer_atom(name: &str) -> Result<Option<Atom>, MemError> {
    let Some(digits) = name.strip_prefix('#') else {
        return Ok(None);
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    match digits.parse::<u32>() {
        Ok(n) if n >= 1 && n < u32::from(MIN_STR_ATOM) => Ok(Some(Atom(n as u16))),
        _ => Err(MemError::InvalidAtom {
            atom: digits.parse::<u16>().unwrap_or(u16::MAX),
        }),
    }
}

/// Table key: two rotate-left hashes over the upper-cased bytes.
fn atom_key(name: &str) -> u32 {
    let (mut h1, mut h2) = (0u32, 0x9E37_79B9u32);
    for byte in name.bytes().map(|b| u32::from(b.to_ascii_uppercase())) {
        h1 = h1.rotate_left(5) ^ byte;
        h2 = h2.rotate_left(11).wrapping_add(byte);
    }
    h1 ^ h2.rotate_left(16)
}

/// The atom table.
///
/// Nothing here locks; for a shared table the caller holds the owning
/// arena's write lock around `add`/`delete` and its read lock around
/// queries.
#[derive(Debug)]
pub struct AtomTable<S: Storage> {
    table: HashTable<S>,
}

impl<S: Storage> AtomTable<S> {
    /// Creates an empty table in `storage`.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::NoSpace`] when the backend cannot hold the slot
    /// array.
    pub fn create(storage: S) -> Result<Self, MemError> {
        let table = HashTable::with_policy(storage, VALUE_LEN, ATOM_SLOTS, HashPolicy::FIXED)?;
        Ok(Self { table })
    }

    /// Opens a table created by another process.
    ///
    /// # Errors
    ///
    /// As [`HashTable::attach`].
    pub fn attach(storage: S, desc: StoragePtr) -> Result<Self, MemError> {
        Ok(Self {
            table: HashTable::attach(storage, desc)?,
        })
    }

    /// Location of the table descriptor.
    #[must_use]
    pub fn descriptor(&self) -> StoragePtr {
        self.table.descriptor()
    }

    /// Number of live string atoms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no string atoms exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn record_at(&self, slot: usize) -> Option<std::ptr::NonNull<u8>> {
        let raw = RawStoragePtr::from_bytes(self.table.value_at(slot)?);
        self.table.storage().access(raw.get()?)
    }

    fn record_name(storage: &S, value: &[u8]) -> Option<Vec<u8>> {
        let record = storage.access(RawStoragePtr::from_bytes(value).get()?)?;
        // SAFETY: records are `{refcount, len, bytes[len]}` written by `add`.
        unsafe {
            let len = record.add(size_of::<u32>()).cast::<u32>().read() as usize;
            let bytes = std::slice::from_raw_parts(record.add(RECORD_HEADER).as_ptr(), len);
            Some(bytes.to_vec())
        }
    }

    fn find_slot(&self, name: &str) -> Option<usize> {
        let storage = self.table.storage();
        self.table.find_slot(atom_key(name), |value| {
            Self::record_name(storage, value).is_some_and(|stored| stored.eq_ignore_ascii_case(name.as_bytes()))
        })
    }

    /// Adds a reference to `name`, creating the atom if needed.
    ///
    /// # Errors
    ///
    /// - [`MemError::NameTooLong`] past [`MAX_ATOM_LEN`] bytes
    /// - [`MemError::InvalidAtom`] for `#0` and `#N` with `N >= 0xC000`
    /// - [`MemError::TableFull`] when no slot is left on the probe path
    /// - [`MemError::NoSpace`] when the backend cannot hold the name
    pub fn add(&mut self, name: &str) -> Result<Atom, MemError> {
        if let Some(atom) = integer_atom(name)? {
            return Ok(atom);
        }
        if name.len() > MAX_ATOM_LEN {
            return Err(MemError::NameTooLong { len: name.len() });
        }
        if name.is_empty() {
            return Err(MemError::InvalidAtom { atom: 0 });
        }

        if let Some(slot) = self.find_slot(name) {
            let record = self.record_at(slot).ok_or(MemError::UnresolvedPointer)?;
            // SAFETY: the refcount is the first field of the record.
            unsafe {
                let refcount = record.cast::<u32>();
                refcount.write(refcount.read().saturating_add(1));
            }
            return Ok(Atom(MIN_STR_ATOM + slot as u16));
        }

        let storage = self.table.storage();
        let bytes = RECORD_HEADER + name.len();
        let record_ptr = storage.allocate(bytes).ok_or(MemError::NoSpace {
            requested: bytes,
            free: 0,
        })?;
        let record = storage.access(record_ptr).ok_or(MemError::UnresolvedPointer)?;
        // SAFETY: freshly allocated block of `bytes` bytes.
        unsafe {
            record.cast::<u32>().write(1);
            record.add(size_of::<u32>()).cast::<u32>().write(name.len() as u32);
            std::ptr::copy_nonoverlapping(
                name.as_ptr(),
                record.add(RECORD_HEADER).as_ptr(),
                name.len(),
            );
        }

        let raw = RawStoragePtr::from(record_ptr).to_bytes();
        let Some(slot) = self.table.insert_new(atom_key(name), &raw) else {
            let _ = self.table.storage().release(record_ptr);
            warn!("atom table full, cannot add {name:?}");
            return Err(MemError::TableFull);
        };

        let atom = Atom(MIN_STR_ATOM + slot as u16);
        trace!("atom {atom} = {name:?}");
        Ok(atom)
    }

    /// Looks up `name` without touching its refcount.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Atom> {
        match integer_atom(name) {
            Ok(Some(atom)) => Some(atom),
            Ok(None) => self
                .find_slot(name)
                .map(|slot| Atom(MIN_STR_ATOM + slot as u16)),
            Err(_) => None,
        }
    }

    /// Drops one reference; the atom is released when none remain.
    ///
    /// Deleting an integer atom is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MemError::InvalidAtom`] for atoms that do not exist.
    pub fn delete(&mut self, atom: Atom) -> Result<(), MemError> {
        if atom.is_integer() {
            return Ok(());
        }
        let invalid = MemError::InvalidAtom { atom: atom.get() };
        let slot = atom.slot().ok_or(invalid.clone())?;
        let record = self.record_at(slot).ok_or(invalid)?;

        // SAFETY: the refcount is the first field of the record.
        let remaining = unsafe {
            let refcount = record.cast::<u32>();
            let remaining = refcount.read().saturating_sub(1);
            refcount.write(remaining);
            remaining
        };
        if remaining > 0 {
            return Ok(());
        }

        if let Some(ptr) = self.table.value_at(slot).and_then(|v| RawStoragePtr::from_bytes(v).get()) {
            self.table.storage().release(ptr)?;
        }
        self.table.delete_at(slot);
        trace!("atom {atom} released");
        Ok(())
    }

    /// Returns the name of `atom`, `#N` for integer atoms.
    #[must_use]
    pub fn get_name(&self, atom: Atom) -> Option<String> {
        if atom.is_integer() {
            return Some(format!("#{}", atom.get()));
        }
        let value = self.table.value_at(atom.slot()?)?;
        let bytes = Self::record_name(self.table.storage(), value)?;
        String::from_utf8(bytes).ok()
    }

    /// Current refcount of a string atom.
    #[must_use]
    pub fn refcount(&self, atom: Atom) -> Option<u32> {
        let record = self.record_at(atom.slot()?)?;
        // SAFETY: the refcount is the first field of the record.
        Some(unsafe { record.cast::<u32>().read() })
    }

    /// Iterates the live string atoms.
    pub fn atoms(&self) -> impl Iterator<Item = Atom> + '_ {
        self.table
            .iter()
            .map(|(slot, _, _)| Atom(MIN_STR_ATOM + slot as u16))
    }

    /// Underlying table statistics.
    #[must_use]
    pub fn stats(&self) -> crate::hash::HashStats {
        self.table.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::storage::{ArenaStorage, HeapRegion, LocalStorage, SegmentId};

    #[test]
    fn test_case_insensitive_refcounting() {
        let mut atoms = AtomTable::create(LocalStorage).unwrap();

        let a = atoms.add("Foo").unwrap();
        let b = atoms.add("foo").unwrap();
        assert_eq!(a, b);
        assert!(a.get() >= MIN_STR_ATOM);
        assert_eq!(atoms.refcount(a), Some(2));

        atoms.delete(a).unwrap();
        assert_eq!(atoms.refcount(a), Some(1));
        assert_eq!(atoms.find("Foo"), Some(a));

        atoms.delete(a).unwrap();
        assert_eq!(atoms.find("Foo"), None);
        assert_eq!(atoms.get_name(a), None);
        assert!(atoms.delete(a).is_err());
    }

    #[test]
    fn test_name_preserves_first_spelling() {
        let mut atoms = AtomTable::create(LocalStorage).unwrap();
        let a = atoms.add("MixedCase").unwrap();
        atoms.add("MIXEDCASE").unwrap();
        assert_eq!(atoms.get_name(a).as_deref(), Some("MixedCase"));
    }

    #[test]
    fn test_integer_atoms() {
        let mut atoms = AtomTable::create(LocalStorage).unwrap();

        let a = atoms.add("#123").unwrap();
        assert_eq!(a, Atom::new(123));
        assert!(a.is_integer());
        assert!(atoms.is_empty());
        assert_eq!(atoms.get_name(a).as_deref(), Some("#123"));
        assert_eq!(atoms.find("#123"), Some(a));
        atoms.delete(a).unwrap();

        assert!(atoms.add("#0").is_err());
        assert!(atoms.add("#49152").is_err());
        assert!(atoms.add("#49151").is_ok());

        // Not all digits: an ordinary string atom.
        let s = atoms.add("#12a").unwrap();
        assert!(!s.is_integer());
    }

    #[test]
    fn test_name_length_limit() {
        let mut atoms = AtomTable::create(LocalStorage).unwrap();
        assert!(atoms.add(&"x".repeat(MAX_ATOM_LEN)).is_ok());
        assert_eq!(
            atoms.add(&"x".repeat(MAX_ATOM_LEN + 1)),
            Err(MemError::NameTooLong { len: 256 })
        );
        assert!(atoms.add("").is_err());
    }

    #[test]
    fn test_full_table_fails_without_growing() {
        let mut atoms = AtomTable::create(LocalStorage).unwrap();
        let all: Vec<_> = (0..ATOM_SLOTS)
            .map(|i| atoms.add(&format!("atom{i}")).unwrap())
            .collect();

        assert_eq!(atoms.add("one-too-many"), Err(MemError::TableFull));
        assert_eq!(atoms.stats().capacity, ATOM_SLOTS);

        // Existing names still resolve on a full table.
        assert_eq!(atoms.add("atom5").unwrap(), all[5]);

        // Releasing atoms leaves tombstones; every other atom stays reachable.
        for atom in all.iter().step_by(3) {
            atoms.delete(*atom).unwrap();
        }
        atoms.delete(all[5]).unwrap();
        for (i, atom) in all.iter().enumerate() {
            let expected = (i % 3 != 0).then_some(*atom);
            assert_eq!(atoms.find(&format!("ATOM{i}")), expected);
        }

        // Tombstones are reused.
        assert!(atoms.add("fresh").is_ok());
    }

    #[test]
    fn test_shared_table_in_arena() {
        let region = HeapRegion::new(64 * 1024).unwrap();
        let arena = unsafe { Arena::create(region.base(), 0, region.len()) };
        let storage = ArenaStorage::new(arena, SegmentId(3));

        let mut first = AtomTable::create(storage).unwrap();
        let atom = first.add("Shared").unwrap();

        let mut second = AtomTable::attach(storage, first.descriptor()).unwrap();
        assert_eq!(second.find("SHARED"), Some(atom));
        second.delete(atom).unwrap();
        assert_eq!(first.find("shared"), None);

        arena.check().unwrap();
    }

    #[test]
    fn test_atom_key_ignores_case() {
        assert_eq!(atom_key("Hello"), atom_key("hELLO"));
        assert_ne!(atom_key("Hello"), atom_key("Hellp"));
    }
}
