//! Reset transition.
//!
//! Used twice per hibernation: once going down (into the platform reset
//! entry) and once coming up (into the continuation recorded at capture).
//!
//! ```text
//!   1. flush TLB
//!   2. flush caches
//!   3. install identity window (through the recorded translation root)
//!   4. flush TLB + caches
//!   5. proc_fin
//!   6. final flush
//!   7. jump (physical)
//! ```
//!
//! Nothing here logs: by the time it runs, memory outside the nosave region
//! may already belong to the restored image.

use crate::cpu::Cpu;
use crate::memory::PhysAddr;
use crate::nosave::NosaveArea;

/// Identity window the transition executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdmapWindow {
    pub base: PhysAddr,
    pub size: usize,
}

impl IdmapWindow {
    pub const fn new(base: PhysAddr, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// Flush, switch to the identity window, finalize and jump to `entry`.
///
/// The window is installed into the table behind `table_root`, the root
/// recorded at suspend: on the way down that is the live table, on the way
/// up it is the table the resume label switches to.
///
/// A failed identity map install halts the core: there is no caller left
/// to return to. `Hibernator::new` validates the window so that only a
/// window left installed by a previous transition can fail here.
///
/// # Safety
/// Interrupts masked, single core, `entry` inside `window`, `table_root`
/// names a valid translation table.
#[inline(never)]
#[cfg_attr(target_os = "none", link_section = ".text.nosave")]
pub unsafe fn trigger_reset<C: Cpu + ?Sized>(
    cpu: &C,
    nosave: &NosaveArea,
    window: IdmapWindow,
    table_root: u64,
    entry: PhysAddr,
    arg: usize,
) -> ! {
    cpu.flush_tlb_all();
    cpu.flush_cache_all();

    if nosave
        .install_identity_mapping(cpu.translation_table_at(table_root), window.base, window.size)
        .is_err()
    {
        cpu.halt();
    }

    cpu.flush_tlb_all();
    cpu.flush_cache_all();

    cpu.proc_fin();

    cpu.flush_cache_all();
    cpu.flush_tlb_all();

    cpu.jump_physical(entry, arg)
}
