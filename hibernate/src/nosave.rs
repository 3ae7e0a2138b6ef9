//! The nosave region.
//!
//! Everything the engine touches after the point of no return lives here:
//! the resume stack, the result cell, the identity map bookkeeping and the
//! phase marker. The region is never part of a snapshot and never a restore
//! target, so it is the only memory that is stable while the restore loop
//! rewrites the rest.
//!
//! # Layout
//!
//! On bare-metal targets `NOSAVE_AREA` is emitted into `.data.nosave` and
//! the linker script brackets the section with `__nosave_begin` /
//! `__nosave_end`. Every routine that runs after the point of no return
//! (reset transition, restore loop, stack switch, resume label and the CPU
//! backend operations they call) goes to `.text.nosave` inside the same
//! bracket. Hosted builds have no such script and use the address range of
//! the area object itself.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::error::Result;
use crate::memory::{addr_to_pfn, align_up, PhysAddr, Pfn, PAGE_SHIFT, PAGE_SIZE};
use crate::remap::{IdentityMap, SectionTable};
use crate::result::ResumeResultCell;

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// Resume stack size.
pub const RESUME_STACK_SIZE: usize = 4 * PAGE_SIZE;

/// Most of the resume stack the restore path (restore loop, page copy,
/// identity map install, reset transition) may use. The rest is headroom.
/// Checked against the painted-stack watermark after every resume.
pub const RESTORE_STACK_BUDGET: usize = RESUME_STACK_SIZE / 2;

/// Fill byte for the unused part of the resume stack.
pub const STACK_CANARY: u8 = 0xA5;

// ═══════════════════════════════════════════════════════════════════════════
// NOSAVE REGION
// ═══════════════════════════════════════════════════════════════════════════

/// Physical range `[begin, end)` excluded from snapshot and restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NosaveRegion {
    begin: PhysAddr,
    end: PhysAddr,
}

impl NosaveRegion {
    pub const fn new(begin: PhysAddr, end: PhysAddr) -> Self {
        Self { begin, end }
    }

    /// The region fixed at build time.
    pub fn linked() -> Self {
        #[cfg(target_os = "none")]
        {
            extern "C" {
                static __nosave_begin: u8;
                static __nosave_end: u8;
            }
            unsafe {
                Self::new(
                    core::ptr::addr_of!(__nosave_begin) as PhysAddr,
                    core::ptr::addr_of!(__nosave_end) as PhysAddr,
                )
            }
        }
        #[cfg(not(target_os = "none"))]
        {
            NOSAVE_AREA.region()
        }
    }

    pub const fn begin(&self) -> PhysAddr {
        self.begin
    }

    pub const fn end(&self) -> PhysAddr {
        self.end
    }

    /// First excluded frame.
    pub const fn begin_pfn(&self) -> Pfn {
        addr_to_pfn(self.begin)
    }

    /// One past the last excluded frame. The end is rounded up so a
    /// partially covered page is never treated as writable.
    pub const fn end_pfn(&self) -> Pfn {
        align_up(self.end, PAGE_SIZE) >> PAGE_SHIFT
    }

    /// Frames covered.
    pub const fn page_count(&self) -> usize {
        self.end_pfn() - self.begin_pfn()
    }

    /// Must frame `pfn` stay out of the snapshot and the restore list?
    #[inline]
    pub const fn is_excluded_page(&self, pfn: Pfn) -> bool {
        pfn >= self.begin_pfn() && pfn < self.end_pfn()
    }

    /// Does the region hold byte `addr`?
    #[inline]
    pub const fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.begin && addr < self.end
    }
}

/// Classifier used by the memory manager while building a snapshot.
#[inline]
pub fn is_excluded_page(pfn: Pfn) -> bool {
    NosaveRegion::linked().is_excluded_page(pfn)
}

// ═══════════════════════════════════════════════════════════════════════════
// PHASE
// ═══════════════════════════════════════════════════════════════════════════

/// Where a hibernation attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// No attempt in progress.
    Idle = 0,
    /// Processor being quiesced.
    Preparing = 1,
    /// External snapshot builder running.
    Capturing = 2,
    /// Past the point of no return, heading into the reset.
    Committed = 3,
    /// Resume path copying pages back.
    Restoring = 4,
    /// Back at the original call site.
    Finalizing = 5,
}

impl From<u8> for Phase {
    fn from(val: u8) -> Self {
        match val {
            1 => Phase::Preparing,
            2 => Phase::Capturing,
            3 => Phase::Committed,
            4 => Phase::Restoring,
            5 => Phase::Finalizing,
            _ => Phase::Idle,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RESUME STACK
// ═══════════════════════════════════════════════════════════════════════════

/// Stack the resume path switches to before its first call.
#[repr(C, align(16))]
pub struct ResumeStack {
    data: UnsafeCell<[u8; RESUME_STACK_SIZE]>,
}

impl ResumeStack {
    const fn new() -> Self {
        Self { data: UnsafeCell::new([0; RESUME_STACK_SIZE]) }
    }

    /// Lowest byte of the buffer.
    pub fn base(&self) -> *mut u8 {
        self.data.get() as *mut u8
    }

    /// Initial stack pointer (stacks grow down), 16-byte aligned.
    pub fn top(&self) -> *mut u8 {
        // Both the base and RESUME_STACK_SIZE are 16-byte aligned.
        unsafe { self.base().add(RESUME_STACK_SIZE) }
    }

    /// Fill the whole buffer with `STACK_CANARY`.
    ///
    /// # Safety
    /// Nothing may be running on this stack.
    pub unsafe fn paint(&self) {
        core::ptr::write_bytes(self.base(), STACK_CANARY, RESUME_STACK_SIZE);
    }

    /// High-water mark since the last `paint`, in bytes from the top.
    ///
    /// # Safety
    /// Nothing may be running on this stack.
    pub unsafe fn usage(&self) -> usize {
        let bytes = &*self.data.get();
        match bytes.iter().position(|&b| b != STACK_CANARY) {
            Some(lowest) => RESUME_STACK_SIZE - lowest,
            None => 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// NOSAVE AREA
// ═══════════════════════════════════════════════════════════════════════════

/// All state shared across the power cycle.
#[repr(C, align(4096))]
pub struct NosaveArea {
    stack: ResumeStack,
    result: ResumeResultCell,
    phase: AtomicU8,
    idmap: Mutex<IdentityMap>,
}

// Touched by one logical thread of control at a time.
unsafe impl Sync for NosaveArea {}

impl NosaveArea {
    pub const fn new() -> Self {
        Self {
            stack: ResumeStack::new(),
            result: ResumeResultCell::new(),
            phase: AtomicU8::new(Phase::Idle as u8),
            idmap: Mutex::new(IdentityMap::new()),
        }
    }

    /// Address range of this area.
    pub fn region(&self) -> NosaveRegion {
        let begin = self as *const Self as PhysAddr;
        NosaveRegion::new(begin, begin + core::mem::size_of::<Self>())
    }

    pub fn stack(&self) -> &ResumeStack {
        &self.stack
    }

    pub fn result(&self) -> &ResumeResultCell {
        &self.result
    }

    pub fn phase(&self) -> Phase {
        Phase::from(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Install the identity window `[base, base + size)` into `table`.
    ///
    /// # Safety
    /// See `IdentityMap::install`.
    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    pub unsafe fn install_identity_mapping(
        &self,
        table: SectionTable,
        base: PhysAddr,
        size: usize,
    ) -> Result<()> {
        self.idmap.lock().install(table, base, size)
    }

    /// Remove the installed identity window, if any.
    ///
    /// # Safety
    /// See `IdentityMap::remove`.
    pub unsafe fn remove_identity_mapping(&self) -> bool {
        self.idmap.lock().remove()
    }

    /// Drop the installed window's bookkeeping, leaving the table as is.
    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    pub fn forget_identity_mapping(&self) -> bool {
        self.idmap.lock().forget()
    }

    /// Is an identity window installed?
    pub fn identity_mapped(&self) -> bool {
        self.idmap.lock().is_installed()
    }

    /// Return the bookkeeping to its load-time state.
    ///
    /// A cold boot reloads `.data.nosave` from the kernel image. Platforms
    /// whose resume boot reuses RAM without reloading it call this before
    /// `Hibernator::resume`. The translation table itself is not touched.
    pub fn reset(&self) {
        self.result.arm();
        self.set_phase(Phase::Idle);
        *self.idmap.lock() = IdentityMap::new();
    }
}

impl Default for NosaveArea {
    fn default() -> Self {
        Self::new()
    }
}

/// The area used by the statically wired engine.
#[cfg_attr(target_os = "none", link_section = ".data.nosave")]
pub static NOSAVE_AREA: NosaveArea = NosaveArea::new();
