//! Atom operations on the shared atom table, under the main lock.

use super::context::DdeContext;
use crate::error::Result;
use ddeshm_mem::Atom;

impl DdeContext {
    /// Adds a reference to `name`, creating the atom if needed.
    ///
    /// Names compare case-insensitively; `#<digits>` yields an integer
    /// atom without touching the table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`](crate::Error::ResourceExhausted)
    /// when the table is full, or [`Error::Mem`](crate::Error::Mem) for bad
    /// names and a full arena.
    pub fn add_atom(&mut self, name: &str) -> Result<Atom> {
        let _guard = self.main.write()?;
        Ok(self.atoms.add(name)?)
    }

    /// Looks up `name` without adding a reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockDegraded`](crate::Error::LockDegraded) if the
    /// main lock fails.
    pub fn find_atom(&self, name: &str) -> Result<Option<Atom>> {
        let _guard = self.main.read()?;
        Ok(self.atoms.find(name))
    }

    /// Drops one reference to `atom`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mem`](crate::Error::Mem) if `atom` does not exist.
    pub fn delete_atom(&mut self, atom: Atom) -> Result<()> {
        let _guard = self.main.write()?;
        Ok(self.atoms.delete(atom)?)
    }

    /// Name of `atom`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockDegraded`](crate::Error::LockDegraded) if the
    /// main lock fails.
    pub fn atom_name(&self, atom: Atom) -> Result<Option<String>> {
        let _guard = self.main.read()?;
        Ok(self.atoms.get_name(atom))
    }

    /// Reference count of a string atom.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockDegraded`](crate::Error::LockDegraded) if the
    /// main lock fails.
    pub fn atom_refcount(&self, atom: Atom) -> Result<Option<u32>> {
        let _guard = self.main.read()?;
        Ok(self.atoms.refcount(atom))
    }
}
