//! x86_64 backend.
//!
//! Long mode cannot turn paging off, so the identity window is written
//! into the PDPT as 1GiB pages and the reset transition only writes back
//! the caches before the jump.
//!
//! Context save/resume is `global_asm!` with the System V convention
//! (declared `extern "sysv64"` so UEFI builds use the same registers).
//! The resume label reloads CR3 from the context before anything else, so
//! the landing runs on the image's tables rather than the boot kernel's.

use core::arch::{asm, global_asm};

use crate::context::ProcessorContext;
use crate::cpu::Cpu;
use crate::error::ResultCode;
use crate::memory::PhysAddr;
use crate::remap::SectionTable;

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITABLE: u64 = 1 << 1;
const PTE_HUGE: u64 = 1 << 7;
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const RFLAGS_IF: u64 = 1 << 9;
const CR4_PGE: u64 = 1 << 7;

/// PDPT entries, each mapping 1GiB.
const PDPT_ENTRIES: usize = 512;
const PDPT_SHIFT: u32 = 30;

// ═══════════════════════════════════════════════════════════════════════════
// CONTEXT SAVE / RESUME
// ═══════════════════════════════════════════════════════════════════════════

// morpheus_hib_suspend(ctx: rdi, save: rsi, arg: rdx) -> rax
//
// Records rbx, rbp, r12-r15, rsp and CR3 into ctx, with the resume label
// as the continuation, then calls save(arg, ctx).
global_asm!(
    ".text",
    ".balign 16",
    ".global morpheus_hib_suspend",
    "morpheus_hib_suspend:",
    "    mov [rdi + 0], rbx",
    "    mov [rdi + 8], rbp",
    "    mov [rdi + 16], r12",
    "    mov [rdi + 24], r13",
    "    mov [rdi + 32], r14",
    "    mov [rdi + 40], r15",
    "    mov [rdi + 96], rsp",
    "    lea rax, [rip + morpheus_hib_resumed]",
    "    mov [rdi + 104], rax",
    "    mov rax, cr3",
    "    mov [rdi + 120], rax",
    "    push rbp",
    "    mov rax, rsi",
    "    mov rsi, rdi",
    "    mov rdi, rdx",
    "    call rax",
    "    pop rbp",
    "    ret",
);

// morpheus_hib_resumed(ctx: rdi)
//
// Entered by a jump from the restore path. Reinstates CR3 and the
// callee-saved registers, then returns 0 from the original suspend call.
macro_rules! resumed_label {
    () => {
        concat!(
            ".balign 16\n",
            ".global morpheus_hib_resumed\n",
            "morpheus_hib_resumed:\n",
            "    mov rax, [rdi + 120]\n",
            "    mov cr3, rax\n",
            "    mov rbx, [rdi + 0]\n",
            "    mov rbp, [rdi + 8]\n",
            "    mov r12, [rdi + 16]\n",
            "    mov r13, [rdi + 24]\n",
            "    mov r14, [rdi + 32]\n",
            "    mov r15, [rdi + 40]\n",
            "    mov rsp, [rdi + 96]\n",
            "    xor eax, eax\n",
            "    ret\n",
        )
    };
}

#[cfg(target_os = "none")]
global_asm!(".pushsection .text.nosave, \"ax\"", resumed_label!(), ".popsection");

#[cfg(not(target_os = "none"))]
global_asm!(".text", resumed_label!());

type SaveFn = extern "sysv64" fn(usize, *mut ProcessorContext) -> isize;

extern "sysv64" {
    fn morpheus_hib_suspend(ctx: *mut ProcessorContext, save: SaveFn, arg: usize) -> isize;
}

extern "sysv64" fn run_save(arg: usize, ctx: *mut ProcessorContext) -> isize {
    let save = unsafe { &mut *(arg as *mut &mut dyn FnMut(&ProcessorContext) -> ResultCode) };
    save(unsafe { &*ctx }) as isize
}

#[cfg_attr(target_os = "none", link_section = ".text.nosave")]
extern "sysv64" fn run_on_stack(f: usize) {
    let f = unsafe { &mut **(f as *mut &mut dyn FnMut()) };
    f()
}

// ═══════════════════════════════════════════════════════════════════════════
// CPU
// ═══════════════════════════════════════════════════════════════════════════

/// The boot processor in long mode.
pub struct X86_64Cpu;

impl X86_64Cpu {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for X86_64Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu for X86_64Cpu {
    fn online_cpus(&self) -> usize {
        // APs are never started by this kernel.
        1
    }

    fn mask_interrupts(&self) -> bool {
        let flags: u64;
        unsafe {
            asm!("pushfq", "pop {}", "cli", out(reg) flags, options(nomem));
        }
        flags & RFLAGS_IF != 0
    }

    fn unmask_interrupts(&self) {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    fn flush_thread_state(&self) -> u64 {
        // Drop pending x87 exceptions so the image never resumes into one.
        unsafe { asm!("fnclex", options(nomem, nostack)) };
        0
    }

    fn restore_thread_state(&self, _saved: u64) {
        // Nothing masked by flush_thread_state.
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn flush_tlb_all(&self) {
        // Toggling PGE drops global entries too.
        unsafe {
            asm!(
                "mov {cr4}, cr4",
                "mov {tmp}, {cr4}",
                "xor {tmp}, {pge}",
                "mov cr4, {tmp}",
                "mov cr4, {cr4}",
                cr4 = out(reg) _,
                tmp = out(reg) _,
                pge = in(reg) CR4_PGE,
                options(nostack)
            );
        }
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn flush_cache_all(&self) {
        unsafe { asm!("wbinvd", options(nostack)) };
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn proc_fin(&self) {
        unsafe { asm!("wbinvd", "mfence", options(nostack)) };
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn proc_init(&self) {
        unsafe { asm!("cld", "fninit", options(nomem, nostack)) };
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn translation_table(&self) -> SectionTable {
        let cr3: u64;
        unsafe {
            asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
            self.translation_table_at(cr3)
        }
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    unsafe fn translation_table_at(&self, root: u64) -> SectionTable {
        let pml4 = (root & PTE_ADDR_MASK) as *const u64;
        let pml4e = core::ptr::read_volatile(pml4);
        if pml4e & PTE_PRESENT == 0 {
            return SectionTable::new(core::ptr::null_mut(), 0, PDPT_SHIFT, 0);
        }
        SectionTable::new(
            (pml4e & PTE_ADDR_MASK) as *mut u64,
            PDPT_ENTRIES,
            PDPT_SHIFT,
            PTE_PRESENT | PTE_WRITABLE | PTE_HUGE,
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
            "mov rsp, {top}",
            "call {entry}",
            "2:",
            "cli",
            "hlt",
            "jmp 2b",
            top = in(reg) stack_top,
            entry = in(reg) run_on_stack as usize,
            in("rdi") data,
            options(noreturn)
        )
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    unsafe fn jump_physical(&self, entry: PhysAddr, arg: usize) -> ! {
        asm!("jmp {}", in(reg) entry, in("rdi") arg, options(noreturn))
    }

    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    fn halt(&self) -> ! {
        loop {
            unsafe { asm!("cli", "hlt", options(nomem, nostack)) };
        }
    }
}
