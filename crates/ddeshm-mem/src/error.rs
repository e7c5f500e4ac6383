//! Error type for the memory primitives.

use std::fmt;

/// Errors raised by arenas, storage backends and tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemError {
    /// No free fragment is large enough for the request.
    NoSpace {
        /// Requested payload size in bytes.
        requested: usize,
        /// Free bytes remaining in the arena.
        free: usize,
    },

    /// A fixed-capacity table has no usable slot on the probe path.
    TableFull,

    /// An offset does not address a fragment of this arena.
    InvalidOffset {
        /// The rejected offset.
        offset: u32,
    },

    /// A fragment header failed validation (double free or overwrite).
    CorruptFragment {
        /// Offset of the damaged fragment header.
        offset: u32,
    },

    /// A storage pointer could not be resolved by the backend.
    UnresolvedPointer,

    /// An atom id is out of range or no longer allocated.
    InvalidAtom {
        /// The raw atom id.
        atom: u16,
    },

    /// Atom names are limited to 255 bytes.
    NameTooLong {
        /// Length of the rejected name.
        len: usize,
    },
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::NoSpace { requested, free } => {
                write!(f, "no fragment fits {requested} bytes ({free} bytes free)")
            }
            MemError::TableFull => write!(f, "table is full"),
            MemError::InvalidOffset { offset } => {
                write!(f, "offset {offset:#x} is outside the arena")
            }
            MemError::CorruptFragment { offset } => {
                write!(f, "corrupt fragment header at {offset:#x}")
            }
            MemError::UnresolvedPointer => {
                write!(f, "storage pointer does not belong to this backend")
            }
            MemError::InvalidAtom { atom } => write!(f, "invalid atom {atom:#06x}"),
            MemError::NameTooLong { len } => {
                write!(f, "atom name of {len} bytes exceeds 255")
            }
        }
    }
}

impl std::error::Error for MemError {}
