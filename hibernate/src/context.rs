//! Processor context and the capture bracket.
//!
//! `prepare_for_capture` and `finalize_after_resume` bracket the whole
//! hibernation sequence. Between them interrupts stay masked, on both the
//! going-down path and the coming-up path.

use core::ptr::{addr_of, read_volatile};

use crate::cpu::Cpu;
use crate::memory::PhysAddr;
use crate::{hib_log, hib_log_hex};

// ═══════════════════════════════════════════════════════════════════════════
// PROCESSOR CONTEXT
// ═══════════════════════════════════════════════════════════════════════════

/// Architectural state needed to resume as if returning from a call.
///
/// Filled by `Cpu::suspend`. Layout is shared with the `global_asm!`
/// save/resume routines of every backend.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProcessorContext {
    /// Callee-saved registers (x86_64 uses the first six slots).
    pub callee_saved: [u64; 12],
    /// Stack pointer at suspend entry.
    pub stack_pointer: u64,
    /// Where the resume path lands; 0 while no context is recorded.
    pub continuation: u64,
    /// System control register the resume path reinstates (SCTLR_EL1 on
    /// aarch64; unused on x86_64).
    pub control: u64,
    /// Translation root at suspend entry (CR3 / TTBR0_EL1). The resume
    /// label switches back to it; the landing's identity window is
    /// installed through it.
    pub table_root: u64,
}

/// Byte offset of `stack_pointer`.
pub const CTX_SP_OFFSET: usize = 96;
/// Byte offset of `continuation`.
pub const CTX_CONTINUATION_OFFSET: usize = 104;
/// Byte offset of `control`.
pub const CTX_CONTROL_OFFSET: usize = 112;
/// Byte offset of `table_root`.
pub const CTX_TABLE_ROOT_OFFSET: usize = 120;

const _: () = assert!(core::mem::size_of::<ProcessorContext>() == CTX_TABLE_ROOT_OFFSET + 8);

impl ProcessorContext {
    pub const fn empty() -> Self {
        Self {
            callee_saved: [0; 12],
            stack_pointer: 0,
            continuation: 0,
            control: 0,
            table_root: 0,
        }
    }

    /// Has a suspend recorded a continuation?
    pub fn is_recorded(&self) -> bool {
        self.continuation != 0
    }

    /// Forget the recorded continuation once control is back.
    pub fn clear(&mut self) {
        *self = Self::empty();
    }
}

impl Default for ProcessorContext {
    fn default() -> Self {
        Self::empty()
    }
}

/// Read the continuation straight from memory.
///
/// The restore path calls this after every page has been copied, so the
/// value comes from the restored image and never from a register the
/// compiler loaded earlier.
///
/// # Safety
/// `ctx` must point at a `ProcessorContext` in identity-mapped memory.
#[inline(always)]
pub unsafe fn read_continuation(ctx: *const ProcessorContext) -> PhysAddr {
    read_volatile(addr_of!((*ctx).continuation)) as PhysAddr
}

/// Read the recorded translation root straight from memory.
///
/// # Safety
/// Same as `read_continuation`.
#[inline(always)]
pub unsafe fn read_table_root(ctx: *const ProcessorContext) -> u64 {
    read_volatile(addr_of!((*ctx).table_root))
}

// ═══════════════════════════════════════════════════════════════════════════
// CAPTURE BRACKET
// ═══════════════════════════════════════════════════════════════════════════

/// Readiness token returned by `prepare_for_capture`.
///
/// Carries what `finalize_after_resume` needs to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct CaptureReadiness {
    interrupts_were_enabled: bool,
    thread_state: u64,
}

impl CaptureReadiness {
    pub fn interrupts_were_enabled(&self) -> bool {
        self.interrupts_were_enabled
    }

    /// Word returned by `Cpu::flush_thread_state`.
    pub fn thread_state(&self) -> u64 {
        self.thread_state
    }
}

/// Quiesce the processor before capture.
///
/// Masks interrupts and flushes per-thread CPU state. Requires a single
/// online core; that is the caller's precondition and is only checked in
/// debug builds.
pub fn prepare_for_capture<C: Cpu + ?Sized>(cpu: &C) -> CaptureReadiness {
    let online = cpu.online_cpus();
    if online != 1 {
        hib_log_hex!("WARNING: cores online at capture: ", online);
    }
    debug_assert_eq!(online, 1, "hibernation requires a single online core");

    let interrupts_were_enabled = cpu.mask_interrupts();
    let thread_state = cpu.flush_thread_state();
    hib_log!("processor quiesced for capture");

    CaptureReadiness {
        interrupts_were_enabled,
        thread_state,
    }
}

/// Undo `prepare_for_capture`.
///
/// Runs unconditionally once control is back at the original call site,
/// whether or not a power cycle happened in between.
pub fn finalize_after_resume<C: Cpu + ?Sized>(cpu: &C, readiness: CaptureReadiness) {
    cpu.restore_thread_state(readiness.thread_state);
    if readiness.interrupts_were_enabled {
        cpu.unmask_interrupts();
    }
    hib_log!("processor state restored");
}
