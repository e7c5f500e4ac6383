//! Window remap table.
//!
//! Local window handles never leave their process. Each mapped window gets
//! a synthetic remote handle, `REMOTE_HWND_TOP - slot`, valid in every
//! process. Slots are claimed first fit; destroyed windows leave a
//! reusable tombstone.

use super::context::DdeContext;
use super::main_block::WindowEntry;
use super::{MAX_WINDOWS, REMOTE_HWND_TOP, WindowInfo};
use crate::error::{Error, Result};
use ddeshm_log::{debug, warn};

/// Remote handle of window slot `slot`.
pub(crate) const fn remote_handle(slot: usize) -> u32 {
    REMOTE_HWND_TOP - slot as u32
}

/// Window slot of a remote handle.
pub(crate) fn window_slot(remote: u32) -> Option<usize> {
    let slot = REMOTE_HWND_TOP.checked_sub(remote)? as usize;
    (slot < MAX_WINDOWS).then_some(slot)
}

impl DdeContext {
    /// Whether `hwnd` lies in the synthetic remote handle range.
    #[must_use]
    pub fn is_remote_window(hwnd: u32) -> bool {
        window_slot(hwnd).is_some()
    }

    /// Maps local window `local` and returns its remote handle.
    ///
    /// Mapping an already mapped window returns the existing handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] when all 64 slots are taken.
    pub fn register_window(&mut self, local: u32) -> Result<u32> {
        let index = self.ensure_registered()?;
        let mut data = self.main.write()?;

        if let Some(slot) = data
            .windows
            .iter()
            .position(|w| w.is_owned_by(index) && w.local == local)
        {
            return Ok(remote_handle(slot));
        }

        let Some(slot) = data.windows.iter().position(|w| !w.is_occupied()) else {
            warn!("window table full, cannot map {local:#x}");
            return Err(Error::ResourceExhausted { what: "windows" });
        };
        data.windows[slot] = WindowEntry::occupied(index, local);
        data.procs[index].windows += 1;
        let remote = remote_handle(slot);
        debug!("window {local:#x} mapped to {remote:#x}");
        Ok(remote)
    }

    /// Unmaps local window `local`.
    ///
    /// Unmapping the process' last window releases its registry entry. If
    /// no other process is attached either, the main block is destroyed
    /// and this context moves to a fresh, empty one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWindow`] if `local` is not mapped by this
    /// process.
    pub fn destroy_window(&mut self, local: u32) -> Result<()> {
        let invalid = Error::InvalidWindow { hwnd: local };
        let index = self.process_index().ok_or(invalid.clone())?;
        let last = {
            let mut data = self.main.write()?;
            let slot = data
                .windows
                .iter()
                .position(|w| w.is_owned_by(index) && w.local == local)
                .ok_or(invalid)?;
            data.windows[slot].release();
            let entry = &mut data.procs[index];
            entry.windows = entry.windows.saturating_sub(1);
            debug!("window {local:#x} unmapped from {:#x}", remote_handle(slot));
            entry.windows == 0
        };
        if last {
            self.release_process()?;
            self.recycle_main_block()?;
        }
        Ok(())
    }

    /// Owner and local handle of remote window `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWindow`] if `remote` is not mapped.
    pub fn resolve_window(&self, remote: u32) -> Result<WindowInfo> {
        let invalid = Error::InvalidWindow { hwnd: remote };
        let slot = window_slot(remote).ok_or(invalid.clone())?;
        let data = self.main.read()?;
        let window = data.windows[slot];
        if !window.is_occupied() {
            return Err(invalid);
        }
        let owner = data.procs[window.proc_idx as usize];
        if owner.is_vacant() {
            return Err(invalid);
        }
        Ok(WindowInfo {
            remote,
            local: window.local,
            pid: owner.pid,
        })
    }

    /// Local handle of `remote` when this process owns it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidWindow`] if `remote` is not mapped by this
    /// process.
    pub fn remote_to_local(&self, remote: u32) -> Result<u32> {
        let invalid = Error::InvalidWindow { hwnd: remote };
        let index = self.process_index().ok_or(invalid.clone())?;
        let slot = window_slot(remote).ok_or(invalid.clone())?;
        let window = self.main.read()?.windows[slot];
        if !window.is_owned_by(index) {
            return Err(invalid);
        }
        Ok(window.local)
    }
}
