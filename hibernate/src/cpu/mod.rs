//! CPU seam.
//!
//! Everything the hibernation core needs from the processor, behind one
//! trait so the orchestration stays architecture-neutral.
//!
//! # Backends
//!
//! - `x86_64` - long mode, CR3/CR4 TLB control, WBINVD
//! - `aarch64` - EL1, DAIF masking, set/way cache maintenance
//!
//! Methods used past the point of no return (`flush_*`, `proc_fin`,
//! `proc_init`, `call_with_stack`, `jump_physical`, `halt`) must not touch
//! memory outside the nosave region other than the translation table.
//! Backends link them into `.text.nosave` on bare-metal targets.

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

use crate::context::ProcessorContext;
use crate::error::ResultCode;
use crate::memory::PhysAddr;
use crate::remap::SectionTable;

/// Processor operations used by the hibernation core.
pub trait Cpu {
    /// Number of cores currently executing. Hibernation requires exactly one.
    fn online_cpus(&self) -> usize;

    /// Mask maskable interrupts. Returns whether they were enabled before.
    fn mask_interrupts(&self) -> bool;

    /// Unmask maskable interrupts.
    fn unmask_interrupts(&self);

    /// Quiesce per-thread state that would be stale after resume
    /// (asynchronous exception enables, pending FP exceptions).
    ///
    /// Returns the state word `restore_thread_state` puts back.
    fn flush_thread_state(&self) -> u64;

    /// Reinstate exactly the state `flush_thread_state` returned.
    fn restore_thread_state(&self, saved: u64);

    /// Invalidate every TLB entry on this core.
    fn flush_tlb_all(&self);

    /// Clean and invalidate every data/instruction cache level.
    fn flush_cache_all(&self);

    /// Put cache/MMU control into a state a warm restart can start from.
    fn proc_fin(&self);

    /// Bring the processor back to a known state on the resume path.
    fn proc_init(&self);

    /// The section table reached through the live translation root.
    fn translation_table(&self) -> SectionTable;

    /// The section table reached through `root`, a value as recorded in
    /// `ProcessorContext::table_root`.
    ///
    /// # Safety
    /// `root` must name a valid translation table.
    unsafe fn translation_table_at(&self, root: u64) -> SectionTable;

    /// Save the callee-saved context into `ctx` and run `save`.
    ///
    /// Returns whatever `save` returns if it returns. If the context is
    /// later resumed through `ctx.continuation`, returns `RESULT_SUCCESS`
    /// from this same call.
    ///
    /// # Safety
    /// `ctx` must stay valid and be part of the captured image.
    unsafe fn suspend(
        &self,
        ctx: *mut ProcessorContext,
        save: &mut dyn FnMut(&ProcessorContext) -> ResultCode,
    ) -> ResultCode;

    /// Switch the stack pointer to `stack_top` and run `f` on it.
    ///
    /// `f` is expected to leave through `jump_physical`; if it returns,
    /// the core halts.
    ///
    /// # Safety
    /// `stack_top` must be the top of a buffer large enough for `f`.
    /// Anything `f` captures is read from the old stack.
    unsafe fn call_with_stack(&self, stack_top: *mut u8, f: &mut dyn FnMut()) -> !;

    /// Jump to `entry` with `arg` in the first argument register.
    ///
    /// # Safety
    /// `entry` must be executable at its physical address.
    unsafe fn jump_physical(&self, entry: PhysAddr, arg: usize) -> !;

    /// Stop this core for good.
    fn halt(&self) -> !;
}
