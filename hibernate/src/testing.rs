//! Recording `Cpu` for unit tests.
//!
//! Divergent operations unwind with a typed payload (`Jump`, `Halted`)
//! through `std::panic::resume_unwind`, so tests catch them without the
//! panic hook printing anything.

use core::cell::{Cell, RefCell, UnsafeCell};
use std::panic::resume_unwind;

use crate::context::ProcessorContext;
use crate::cpu::Cpu;
use crate::error::ResultCode;
use crate::memory::PhysAddr;
use crate::remap::SectionTable;

/// 1 GiB sections, like a level-1 block table.
pub const SECTION_SHIFT: u32 = 30;
pub const SECTION_ATTRS: u64 = 0x0000_0000_0000_0705;
pub const TABLE_ENTRIES: usize = 16;

/// Address `suspend` records as the continuation.
pub const CONTINUATION: PhysAddr = 0x4008_0000;

/// Word `flush_thread_state` hands out.
pub const THREAD_STATE: u64 = 0x3c0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Mask,
    Unmask,
    FlushThread,
    RestoreThread,
    FlushTlb,
    FlushCache,
    ProcFin,
    ProcInit,
    TableLookup,
    Suspend,
    StackSwitch(usize),
    Jump(PhysAddr),
    Halt,
}

/// Unwind payload of `jump_physical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jump {
    pub entry: PhysAddr,
    pub arg: usize,
}

/// Unwind payload of `halt`.
#[derive(Debug)]
pub struct Halted;

pub struct MockCpu {
    irq_enabled: bool,
    events: RefCell<Vec<Event>>,
    table: Box<UnsafeCell<[u64; TABLE_ENTRIES]>>,
    restored: Cell<Option<u64>>,
}

impl MockCpu {
    pub fn new(irq_enabled: bool) -> Self {
        Self {
            irq_enabled,
            events: RefCell::new(Vec::new()),
            table: Box::new(UnsafeCell::new([0; TABLE_ENTRIES])),
            restored: Cell::new(None),
        }
    }

    fn push(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }

    pub fn descriptor(&self, index: usize) -> u64 {
        unsafe { (*self.table.get())[index] }
    }

    /// Translation root naming the mock table.
    pub fn root(&self) -> u64 {
        self.table.get() as u64
    }

    /// Word last passed to `restore_thread_state`.
    pub fn restored_thread_state(&self) -> Option<u64> {
        self.restored.get()
    }
}

impl Cpu for MockCpu {
    fn online_cpus(&self) -> usize {
        1
    }

    fn mask_interrupts(&self) -> bool {
        self.push(Event::Mask);
        self.irq_enabled
    }

    fn unmask_interrupts(&self) {
        self.push(Event::Unmask);
    }

    fn flush_thread_state(&self) -> u64 {
        self.push(Event::FlushThread);
        THREAD_STATE
    }

    fn restore_thread_state(&self, saved: u64) {
        self.push(Event::RestoreThread);
        self.restored.set(Some(saved));
    }

    fn flush_tlb_all(&self) {
        self.push(Event::FlushTlb);
    }

    fn flush_cache_all(&self) {
        self.push(Event::FlushCache);
    }

    fn proc_fin(&self) {
        self.push(Event::ProcFin);
    }

    fn proc_init(&self) {
        self.push(Event::ProcInit);
    }

    fn translation_table(&self) -> SectionTable {
        unsafe { self.translation_table_at(self.root()) }
    }

    unsafe fn translation_table_at(&self, root: u64) -> SectionTable {
        self.push(Event::TableLookup);
        SectionTable::new(root as *mut u64, TABLE_ENTRIES, SECTION_SHIFT, SECTION_ATTRS)
    }

    unsafe fn suspend(
        &self,
        ctx: *mut ProcessorContext,
        save: &mut dyn FnMut(&ProcessorContext) -> ResultCode,
    ) -> ResultCode {
        self.push(Event::Suspend);
        (*ctx).stack_pointer = &ctx as *const _ as u64;
        (*ctx).continuation = CONTINUATION as u64;
        (*ctx).table_root = self.root();
        save(&*ctx)
    }

    unsafe fn call_with_stack(&self, stack_top: *mut u8, f: &mut dyn FnMut()) -> ! {
        self.push(Event::StackSwitch(stack_top as usize));
        f();
        self.halt()
    }

    unsafe fn jump_physical(&self, entry: PhysAddr, arg: usize) -> ! {
        self.push(Event::Jump(entry));
        resume_unwind(Box::new(Jump { entry, arg }))
    }

    fn halt(&self) -> ! {
        self.push(Event::Halt);
        resume_unwind(Box::new(Halted))
    }
}
