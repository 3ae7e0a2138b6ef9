//! AArch64 backend (EL1).
//!
//! The identity window lives in the level-1 table behind TTBR0_EL1 as
//! 1GiB block descriptors. `proc_fin` turns the caches off for the jump;
//! the resume label switches TTBR0_EL1 back to the image's table and turns
//! the caches back on from the saved SCTLR_EL1.

use core::arch::{asm, global_asm};

use crate::context::ProcessorContext;
use crate::cpu::Cpu;
use crate::error::ResultCode;
use crate::memory::PhysAddr;
use crate::remap::SectionTable;

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

// Block descriptor bits
const PTE_VALID: u64 = 1 << 0;
const PTE_AF: u64 = 1 << 10;
const PTE_SH_INNER: u64 = 3 << 8;
const PTE_ATTR_NORMAL: u64 = 0 << 2; // MAIR index 0

const TTBR_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

const L1_ENTRIES: usize = 512;
const L1_SHIFT: u32 = 30;

const SCTLR_C: u64 = 1 << 2;
const SCTLR_I: u64 = 1 << 12;

/// DAIF.I
const DAIF_IRQ: u64 = 1 << 7;
/// DAIF.{D,A,I,F}
const DAIF_MASK: u64 = 0xF << 6;

// ═══════════════════════════════════════════════════════════════════════════
// CONTEXT SAVE / RESUME
// ═══════════════════════════════════════════════════════════════════════════

// morpheus_hib_suspend(ctx: x0, save: x1, arg: x2) -> x0
//
// Records x19-x30, sp, SCTLR_EL1 and TTBR0_EL1 into ctx with the resume
// label as the continuation, then calls save(arg, ctx).
global_asm!(
    ".text",
    ".balign 16",
    ".global morpheus_hib_suspend",
    "morpheus_hib_suspend:",
    "    stp x19, x20, [x0, #0]",
    "    stp x21, x22, [x0, #16]",
    "    stp x23, x24, [x0, #32]",
    "    stp x25, x26, [x0, #48]",
    "    stp x27, x28, [x0, #64]",
    "    stp x29, x30, [x0, #80]",
    "    mov x9, sp",
    "    str x9, [x0, #96]",
    "    adr x9, morpheus_hib_resumed",
    "    str x9, [x0, #104]",
    "    mrs x9, sctlr_el1",
    "    str x9, [x0, #112]",
    "    mrs x9, ttbr0_el1",
    "    str x9, [x0, #120]",
    "    stp x29, x30, [sp, #-16]!",
    "    mov x9, x1",
    "    mov x1, x0",
    "    mov x0, x2",
    "    blr x9",
    "    ldp x29, x30, [sp], #16",
    "    ret",
);

// morpheus_hib_resumed(ctx: x0)
//
// Entered by a branch from the restore path. Switches TTBR0_EL1 back to
// the image's table, reinstates SCTLR_EL1 and the callee-saved registers,
// and returns 0 from the original suspend call.
macro_rules! resumed_label {
    () => {
        concat!(
            ".balign 16\n",
            ".global morpheus_hib_resumed\n",
            "morpheus_hib_resumed:\n",
            "    ldr x9, [x0, #120]\n",
            "    msr ttbr0_el1, x9\n",
            "    isb\n",
            "    tlbi vmalle1\n",
            "    dsb ish\n",
            "    isb\n",
            "    ldr x9, [x0, #112]\n",
            "    msr sctlr_el1, x9\n",
            "    isb\n",
            "    ldp x19, x20, [x0, #0]\n",
            "    ldp x21, x22, [x0, #16]\n",
            "    ldp x23, x24, [x0, #32]\n",
            "    ldp x25, x26, [x0, #48]\n",
            "    ldp x27, x28, [x0, #64]\n",
            "    ldp x29, x30, [x0, #80]\n",
            "    ldr x9, [x0, #96]\n",
            "    mov sp, x9\n",
            "    mov x0, #0\n",
            "    ret\n",
        )
    };
}

#[cfg(target_os = "none")]
global_asm!(".pushsection .text.nosave, \"ax\"", resumed_label!(), ".popsection");

#[cfg(not(target_os = "none"))]
global_asm!(".text", resumed_label!());

type SaveFn = extern "C" fn(usize, *mut ProcessorContext) -> isize;

extern "C" {
    fn morpheus_hib_suspend(ctx: *mut ProcessorContext, save: SaveFn, arg: usize) -> isize;
}

extern "C" fn run_save(arg: usize, ctx: *mut ProcessorContext) -> isize {
    let save = unsafe { &mut *(arg as *mut &mut dyn FnMut(&ProcessorContext) -> ResultCode) };
    save(unsafe { &*ctx }) as isize
}

#[cfg_attr(target_os = "none", link_section = ".text.nosave")]
extern "C" fn run_on_stack(f: usize) {
    let f = unsafe { &mut **(f as *mut &mut dyn FnMut()) };
    f()
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE MAINTENANCE
// ═══════════════════════════════════════════════════════════════════════════

/// Clean and invalidate every data cache level by set/way, up to the
/// level of coherence.
#[cfg_attr(target_os = "none", link_section = ".text.nosave")]
fn clean_inval_dcache_all() {
    unsafe {
        let clidr: u64;
        asm!("mrs {}, clidr_el1", out(reg) clidr, options(nomem, nostack));
        let loc = (clidr >> 24) & 0x7;

        for level in 0..loc {
            let ctype = (clidr >> (level * 3)) & 0x7;
            // 0 none, 1 icache only
            if ctype < 2 {
                continue;
            }

            let ccsidr: u64;
            asm!(
                "msr csselr_el1, {sel}",
                "isb",
                "mrs {ccsidr}, ccsidr_el1",
                sel = in(reg) level << 1,
                ccsidr = out(reg) ccsidr,
                options(nomem, nostack)
            );
            let line_shift = (ccsidr & 0x7) + 4;
            let ways = ((ccsidr >> 3) & 0x3FF) + 1;
            let sets = ((ccsidr >> 13) & 0x7FFF) + 1;
            let way_shift = if ways > 1 { ((ways - 1) as u32).leading_zeros() } else { 0 };

            for way in 0..ways {
                for set in 0..sets {
                    let val = (way << way_shift) | (set << line_shift) | (level << 1);
                    asm!("dc cisw, {}", in(reg) val, options(nostack));
                }
            }
        }

        asm!("dsb sy", "ic iallu", "dsb sy", "isb", options(nostack));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CPU
// ═══════════════════════════════════════════════════════════════════════════

/// The boot core at EL1.
pub struct Aarch64Cpu;

impl Aarch64Cpu {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for Aarch64Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu for Aarch64Cpu {
    fn online_cpus(&self) -> usize {
        // Secondaries stay parked in firmware.
        1
    }

    fn mask_interrupts(&self) -> bool {
        let daif: u64;
        unsafe {
            asm!("mrs {}, daif", "msr daifset, #2", out(reg) daif, options(nomem, nostack));
        }
        daif & DAIF_IRQ == 0
    }

    fn unmask_interrupts(&self) {
        unsafe { asm!("msr daifclr, #2", options(nomem, nostack)) };
    }

    fn flush_thread_state(&self) -> u64 {
        // SError and FIQ; the returned DAIF already has I masked
        let daif: u64;
        unsafe {
            asm!("mrs {}, daif", "msr daifset, #5", "isb", out(reg) daif, options(nomem, nostack));
        }
        daif
    }

    fn restore_thread_state(&self, saved: u64) {
        // proc_init masked D as well; this puts every bit back as captured
        unsafe { asm!("msr daif, {}", "isb", in(reg) saved & DAIF_MASK, options(nomem, nostack)) };
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn flush_tlb_all(&self) {
        unsafe {
            asm!("dsb ishst", "tlbi vmalle1", "dsb ish", "isb", options(nostack));
        }
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn flush_cache_all(&self) {
        clean_inval_dcache_all();
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn proc_fin(&self) {
        unsafe {
            let mut sctlr: u64;
            asm!("mrs {}, sctlr_el1", out(reg) sctlr, options(nomem, nostack));
            sctlr &= !(SCTLR_C | SCTLR_I);
            asm!("msr sctlr_el1, {}", "isb", in(reg) sctlr, options(nostack));
        }
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn proc_init(&self) {
        unsafe {
            asm!(
                "msr daifset, #0xf",
                "ic iallu",
                "tlbi vmalle1",
                "dsb sy",
                "isb",
                options(nostack)
            );
        }
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn translation_table(&self) -> SectionTable {
        let ttbr0: u64;
        unsafe {
            asm!("mrs {}, ttbr0_el1", out(reg) ttbr0, options(nomem, nostack));
            self.translation_table_at(ttbr0)
        }
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    unsafe fn translation_table_at(&self, root: u64) -> SectionTable {
        SectionTable::new(
            (root & TTBR_ADDR_MASK) as *mut u64,
            L1_ENTRIES,
            L1_SHIFT,
            PTE_VALID | PTE_AF | PTE_SH_INNER | PTE_ATTR_NORMAL,
        )
    }

    unsafe fn suspend(
        &self,
        ctx: *mut ProcessorContext,
        save: &mut dyn FnMut(&ProcessorContext) -> ResultCode,
    ) -> ResultCode {
        let mut save = save;
        let arg = &mut save as *mut &mut dyn FnMut(&ProcessorContext) -> ResultCode as usize;
        morpheus_hib_suspend(ctx, run_save, arg) as ResultCode
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    unsafe fn call_with_stack(&self, stack_top: *mut u8, f: &mut dyn FnMut()) -> ! {
        let mut f = f;
        let data = &mut f as *mut &mut dyn FnMut() as usize;
        asm!(
            "mov sp, {top}",
            "blr {entry}",
            "2:",
            "msr daifset, #0xf",
            "wfi",
            "b 2b",
            top = in(reg) stack_top,
            entry = in(reg) run_on_stack as usize,
            in("x0") data,
            options(noreturn)
        )
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    unsafe fn jump_physical(&self, entry: PhysAddr, arg: usize) -> ! {
        asm!("br {}", in(reg) entry, in("x0") arg, options(noreturn))
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn halt(&self) -> ! {
        loop {
            unsafe { asm!("msr daifset, #0xf", "wfi", options(nomem, nostack)) };
        }
    }
}
