//! Temporary identity mapping.
//!
//! The reset and restore code must keep executing while the translation
//! regime changes under it and while the page tables of the calling
//! context are overwritten by the restore loop. Both run with VA == PA over
//! a bounded window that covers the reset/restore code and the resume
//! entry point.
//!
//! # How
//!
//! ```text
//!   section table (live)           IdentityMap (nosave)
//!  ┌──────────────────────┐       ┌─────────────────────┐
//!  │ ...                  │       │ first = base>>shift │
//!  │ [first]   old → PA|a │ ────▶ │ saved[0] = old      │
//!  │ [first+1] old → PA|a │ ────▶ │ saved[1] = old      │
//!  │ ...                  │       │ count               │
//!  └──────────────────────┘       └─────────────────────┘
//! ```
//!
//! Install rewrites each section descriptor in the window to map onto its
//! own physical address and keeps the previous descriptors; remove writes
//! them back. Callers flush the TLB around both.

use core::ops::Range;
use core::ptr::{read_volatile, write_volatile};

use crate::error::{HibernateError, Result};
use crate::memory::{align_down, PhysAddr};

/// Most sections a single identity window may span.
pub const MAX_IDMAP_SECTIONS: usize = 16;

// ═══════════════════════════════════════════════════════════════════════════
// SECTION TABLE
// ═══════════════════════════════════════════════════════════════════════════

/// A translation table level made of block ("section") descriptors.
///
/// Entry `i` translates `[i << shift, (i + 1) << shift)`.
#[derive(Clone, Copy)]
pub struct SectionTable {
    base: *mut u64,
    entries: usize,
    shift: u32,
    attrs: u64,
}

impl SectionTable {
    /// Describe a live table.
    ///
    /// # Safety
    /// - `base` must point at `entries` writable descriptors
    /// - the table must stay valid while an identity window is installed
    pub const unsafe fn new(base: *mut u64, entries: usize, shift: u32, attrs: u64) -> Self {
        Self { base, entries, shift, attrs }
    }

    /// Bytes covered by one descriptor.
    #[inline]
    pub const fn section_size(&self) -> usize {
        1 << self.shift
    }

    /// Attribute bits ORed into every identity descriptor.
    #[inline]
    pub const fn attrs(&self) -> u64 {
        self.attrs
    }

    /// Identity descriptor for entry `index`.
    #[inline]
    pub const fn identity_descriptor(&self, index: usize) -> u64 {
        ((index as u64) << self.shift) | self.attrs
    }

    /// Descriptor indices covering `[base, base + size)`.
    pub fn index_range(&self, base: PhysAddr, size: usize) -> Result<Range<usize>> {
        let section = self.section_size();
        let end = base.checked_add(size).ok_or(HibernateError::IdmapOutOfRange)?;
        // rounded up to the next section, without wrapping near the top
        let last = end
            .checked_add(section - 1)
            .ok_or(HibernateError::IdmapOutOfRange)?
            >> self.shift;
        let first = align_down(base, section) >> self.shift;
        if last > self.entries {
            return Err(HibernateError::IdmapOutOfRange);
        }
        Ok(first..last)
    }

    /// Read descriptor `index`.
    ///
    /// # Safety
    /// `index` must be below `entries`.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> u64 {
        read_volatile(self.base.add(index))
    }

    #[inline]
    unsafe fn write(&self, index: usize, value: u64) {
        write_volatile(self.base.add(index), value)
    }
}

// Descriptors are only touched by the single core running hibernation.
unsafe impl Send for SectionTable {}

impl core::fmt::Debug for SectionTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SectionTable")
            .field("base", &self.base)
            .field("entries", &self.entries)
            .field("section", &format_args!("{:#x}", self.section_size()))
            .field("attrs", &format_args!("{:#x}", self.attrs))
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IDENTITY MAP
// ═══════════════════════════════════════════════════════════════════════════

/// Bookkeeping for one installed identity window.
///
/// Lives in the nosave area: the restore loop removes the window after
/// overwriting ordinary memory, so the saved descriptors must survive it.
pub struct IdentityMap {
    table: Option<SectionTable>,
    first: usize,
    count: usize,
    saved: [u64; MAX_IDMAP_SECTIONS],
}

impl IdentityMap {
    pub const fn new() -> Self {
        Self {
            table: None,
            first: 0,
            count: 0,
            saved: [0; MAX_IDMAP_SECTIONS],
        }
    }

    /// Is a window currently installed?
    pub fn is_installed(&self) -> bool {
        self.table.is_some()
    }

    /// Number of sections in the installed window.
    pub fn sections(&self) -> usize {
        self.count
    }

    /// Map `[base, base + size)` onto itself in `table`.
    ///
    /// Fails without touching the table if the window is out of range, too
    /// large, or a window is already installed.
    ///
    /// # Safety
    /// `table` must be the live table; the caller flushes the TLB after.
    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    pub unsafe fn install(&mut self, table: SectionTable, base: PhysAddr, size: usize) -> Result<()> {
        if self.is_installed() {
            return Err(HibernateError::IdmapAlreadyInstalled);
        }
        let range = table.index_range(base, size)?;
        if range.len() > MAX_IDMAP_SECTIONS {
            return Err(HibernateError::IdmapTooLarge);
        }

        self.first = range.start;
        self.count = range.len();
        for (slot, index) in range.enumerate() {
            self.saved[slot] = table.read(index);
            table.write(index, table.identity_descriptor(index));
        }
        self.table = Some(table);
        Ok(())
    }

    /// Put back the descriptors the window replaced.
    ///
    /// Returns `false` if nothing was installed.
    ///
    /// # Safety
    /// The table recorded at install time must still be valid; the caller
    /// flushes the TLB after.
    pub unsafe fn remove(&mut self) -> bool {
        let Some(table) = self.table.take() else {
            return false;
        };
        for slot in 0..self.count {
            table.write(self.first + slot, self.saved[slot]);
        }
        self.count = 0;
        true
    }

    /// Drop the bookkeeping without writing anything back.
    ///
    /// For a table that is being abandoned, or whose page may already hold
    /// restored contents that the saved descriptors would corrupt.
    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    pub fn forget(&mut self) -> bool {
        self.count = 0;
        self.table.take().is_some()
    }
}

impl Default for IdentityMap {
    fn default() -> Self {
        Self::new()
    }
}
