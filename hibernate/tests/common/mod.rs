//! Common test utilities: a simulated processor and page arena.
//!
//! `SimCpu` models the two jumps that never return on hardware. A jump
//! unwinds with a `Jump` payload; `suspend` catches the one aimed at the
//! reset vector, runs the installed resume dispatcher as the "next boot",
//! and catches the jump into the continuation as the landing.
//!
//! It keeps two translation tables: the image's table, live while the
//! kernel runs and recorded at suspend, and the table the firmware builds
//! on every boot. The landing switches back to the recorded one.
//!
//! On x86_64 Linux `call_with_stack` really moves the stack pointer to the
//! resume stack. A jump or halt issued on that stack first returns to the
//! caller's stack and unwinds from there.

#![allow(dead_code)]

use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use morpheus_hibernate::{
    Cpu, HibernateConfig, Hibernator, NosaveArea, Pbe, PhysAddr, ProcessorContext, RestoreList,
    ResultCode, SectionTable, PAGE_SIZE, RESULT_SUCCESS,
};

pub const SECTION_SHIFT: u32 = 30;
pub const SECTION_ATTRS: u64 = 0x705;
pub const TABLE_ENTRIES: usize = 16;

/// Platform reset entry.
pub const RESET_VECTOR: PhysAddr = 0x4000_0000;
/// Where the simulated suspend routine says it will resume.
pub const CONTINUATION: PhysAddr = 0x4010_0000;
pub const IDMAP_BASE: PhysAddr = 0x4000_0000;
pub const IDMAP_SIZE: usize = 0x4000_0000;

pub fn config() -> HibernateConfig {
    HibernateConfig::new(RESET_VECTOR, IDMAP_BASE, IDMAP_SIZE)
}

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
    PowerCycle,
    Landed,
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

/// A divergence parked while leaving the resume stack.
#[derive(Debug, Clone, Copy)]
enum Exit {
    Jump(Jump),
    Halt,
}

type Table = [u64; TABLE_ENTRIES];

fn kernel_table(tag: u64) -> Table {
    let mut table = [0u64; TABLE_ENTRIES];
    for (i, entry) in table.iter_mut().enumerate() {
        // kernel mappings, none of them identity
        *entry = tag | ((i as u64 + 0x40) << SECTION_SHIFT) | 0x3;
    }
    table
}

// ═══════════════════════════════════════════════════════════════════════════
// STACK SWITCH
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod switch {
    use std::arch::global_asm;

    // sim_enter_stack(top: rdi, entry: rsi, data: rdx, saved_sp: rcx)
    //
    // Saves the callee-saved registers on the current stack, stores rsp in
    // *saved_sp, switches to top and calls entry(data). Returns only
    // through sim_leave_stack(saved_sp).
    global_asm!(
        ".text",
        ".balign 16",
        ".global sim_enter_stack",
        "sim_enter_stack:",
        "    push rbx",
        "    push rbp",
        "    push r12",
        "    push r13",
        "    push r14",
        "    push r15",
        "    mov [rcx], rsp",
        "    mov rsp, rdi",
        "    mov rdi, rdx",
        "    call rsi",
        "    ud2",
        "",
        ".balign 16",
        ".global sim_leave_stack",
        "sim_leave_stack:",
        "    mov rsp, rdi",
        "    pop r15",
        "    pop r14",
        "    pop r13",
        "    pop r12",
        "    pop rbp",
        "    pop rbx",
        "    ret",
    );

    extern "sysv64" {
        pub fn sim_enter_stack(
            top: *mut u8,
            entry: extern "sysv64" fn(usize),
            data: usize,
            saved_sp: *mut usize,
        );
        pub fn sim_leave_stack(saved_sp: usize) -> !;
    }
}

struct StackCall<'c, 'f> {
    cpu: &'c SimCpu,
    f: &'f mut dyn FnMut(),
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
extern "sysv64" fn stack_entry(data: usize) {
    let call = unsafe { &mut *(data as *mut StackCall<'_, '_>) };
    (call.f)();
    call.cpu.halt()
}

// ═══════════════════════════════════════════════════════════════════════════
// SIMULATED CPU
// ═══════════════════════════════════════════════════════════════════════════

pub struct SimCpu {
    events: RefCell<Vec<Event>>,
    image_table: Box<UnsafeCell<Table>>,
    boot_table: Box<UnsafeCell<Table>>,
    pristine_image: Table,
    pristine_boot: Table,
    live_root: Cell<u64>,
    next_boot: RefCell<Option<Box<dyn FnOnce()>>>,
    /// Caller's stack pointer while running on the resume stack, else 0.
    outer_sp: Cell<usize>,
    exit: Cell<Option<Exit>>,
}

impl SimCpu {
    pub fn new() -> Self {
        let pristine_image = kernel_table(0x0080_0000_0000_0000);
        let pristine_boot = kernel_table(0x0040_0000_0000_0000);
        let image_table = Box::new(UnsafeCell::new(pristine_image));
        let live_root = Cell::new(image_table.get() as u64);
        Self {
            // no reallocation while running on the resume stack
            events: RefCell::new(Vec::with_capacity(1024)),
            image_table,
            boot_table: Box::new(UnsafeCell::new(pristine_boot)),
            pristine_image,
            pristine_boot,
            live_root,
            next_boot: RefCell::new(None),
            outer_sp: Cell::new(0),
            exit: Cell::new(None),
        }
    }

    /// A leaked CPU, nosave area and engine wired together.
    pub fn rig() -> (&'static SimCpu, &'static NosaveArea, &'static Hibernator<'static, SimCpu>) {
        let cpu: &'static SimCpu = Box::leak(Box::new(SimCpu::new()));
        let area: &'static NosaveArea = Box::leak(Box::new(NosaveArea::new()));
        let hib = Hibernator::new(cpu, area, config()).expect("valid config");
        let hib: &'static Hibernator<'static, SimCpu> = Box::leak(Box::new(hib));
        cpu.clear_events();
        (cpu, area, hib)
    }

    /// Install what the firmware runs on the boot after the reset.
    pub fn on_next_boot(&self, boot: impl FnOnce() + 'static) {
        *self.next_boot.borrow_mut() = Some(Box::new(boot));
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

    /// Current contents of the image's table.
    pub fn table(&self) -> Table {
        unsafe { *self.image_table.get() }
    }

    /// The image's table as the kernel built it.
    pub fn pristine_table(&self) -> Table {
        self.pristine_image
    }

    /// Current contents of the table the firmware built on the last boot.
    pub fn boot_table(&self) -> Table {
        unsafe { *self.boot_table.get() }
    }

    pub fn image_root(&self) -> u64 {
        self.image_table.get() as u64
    }

    pub fn boot_root(&self) -> u64 {
        self.boot_table.get() as u64
    }

    pub fn live_root(&self) -> u64 {
        self.live_root.get()
    }

    /// Firmware builds fresh tables on every boot and runs on them.
    fn reboot(&self) {
        unsafe { *self.boot_table.get() = self.pristine_boot };
        self.live_root.set(self.boot_root());
    }

    /// Leave through `exit`, from whichever stack we are on.
    fn diverge(&self, exit: Exit) -> ! {
        #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
        {
            let sp = self.outer_sp.replace(0);
            if sp != 0 {
                self.exit.set(Some(exit));
                unsafe { switch::sim_leave_stack(sp) }
            }
        }
        match exit {
            Exit::Jump(jump) => resume_unwind(Box::new(jump)),
            Exit::Halt => resume_unwind(Box::new(Halted)),
        }
    }
}

fn expect_jump(payload: Box<dyn std::any::Any + Send>) -> Jump {
    match payload.downcast::<Jump>() {
        Ok(jump) => *jump,
        Err(other) => resume_unwind(other),
    }
}

impl Cpu for SimCpu {
    fn online_cpus(&self) -> usize {
        1
    }

    fn mask_interrupts(&self) -> bool {
        self.push(Event::Mask);
        true
    }

    fn unmask_interrupts(&self) {
        self.push(Event::Unmask);
    }

    fn flush_thread_state(&self) -> u64 {
        self.push(Event::FlushThread);
        0
    }

    fn restore_thread_state(&self, _saved: u64) {
        self.push(Event::RestoreThread);
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
        unsafe { self.translation_table_at(self.live_root.get()) }
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
        (*ctx).table_root = self.live_root.get();
        // the snapshot holds the image's table as it is now
        let captured = self.table();

        let payload = match catch_unwind(AssertUnwindSafe(|| save(&*ctx))) {
            Ok(code) => return code,
            Err(payload) => payload,
        };
        let down = expect_jump(payload);
        assert_eq!(down.entry, RESET_VECTOR, "going-down jump");

        self.push(Event::PowerCycle);
        self.reboot();
        // staged with the rest of the image; restored up front for brevity
        *self.image_table.get() = captured;
        let boot = self
            .next_boot
            .borrow_mut()
            .take()
            .expect("no resume dispatcher installed");
        let payload = catch_unwind(AssertUnwindSafe(boot)).expect_err("resume returned");

        let up = expect_jump(payload);
        assert_eq!(up, Jump { entry: CONTINUATION, arg: ctx as usize }, "landing jump");
        // the resume label reloads the recorded root
        self.live_root.set((*ctx).table_root);
        self.push(Event::Landed);
        RESULT_SUCCESS
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    unsafe fn call_with_stack(&self, stack_top: *mut u8, f: &mut dyn FnMut()) -> ! {
        self.push(Event::StackSwitch(stack_top as usize));
        let mut call = StackCall { cpu: self, f };
        switch::sim_enter_stack(
            stack_top,
            stack_entry,
            &mut call as *mut StackCall<'_, '_> as usize,
            self.outer_sp.as_ptr(),
        );
        // back on this stack through `diverge`
        let exit = self.exit.take().expect("left the resume stack without an exit");
        self.diverge(exit)
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
    unsafe fn call_with_stack(&self, stack_top: *mut u8, f: &mut dyn FnMut()) -> ! {
        // runs on the caller's stack here
        self.push(Event::StackSwitch(stack_top as usize));
        f();
        self.halt()
    }

    unsafe fn jump_physical(&self, entry: PhysAddr, arg: usize) -> ! {
        self.push(Event::Jump(entry));
        self.diverge(Exit::Jump(Jump { entry, arg }))
    }

    fn halt(&self) -> ! {
        self.push(Event::Halt);
        self.diverge(Exit::Halt)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PAGE ARENA
// ═══════════════════════════════════════════════════════════════════════════

#[repr(C, align(4096))]
struct Page([u8; PAGE_SIZE]);

/// Page-aligned memory standing in for physical RAM.
pub struct Arena {
    base: usize,
    pages: usize,
}

impl Arena {
    /// Leaked, so addresses stay valid for hooks that outlive the test body.
    pub fn new(pages: usize) -> Self {
        let mem: Vec<Page> = (0..pages).map(|_| Page([0; PAGE_SIZE])).collect();
        let mem = Box::leak(mem.into_boxed_slice());
        Self { base: mem.as_mut_ptr() as usize, pages }
    }

    pub fn addr(&self, i: usize) -> PhysAddr {
        assert!(i < self.pages);
        self.base + i * PAGE_SIZE
    }

    pub fn page(&self, i: usize) -> &'static mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr(i) as *mut u8, PAGE_SIZE) }
    }

    pub fn fill(&self, i: usize, byte: u8) {
        self.page(i).fill(byte);
    }

    pub fn all(&self, i: usize, byte: u8) -> bool {
        self.page(i).iter().all(|&b| b == byte)
    }
}

/// Link `(target, staging)` pairs into a leaked restore list.
pub fn restore_list(pairs: &[(PhysAddr, PhysAddr)]) -> RestoreList {
    let nodes: &'static mut [Pbe] = Box::leak(
        pairs
            .iter()
            .map(|&(target, staging)| Pbe::new(target, staging))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );
    for i in 1..nodes.len() {
        let next = &nodes[i] as *const Pbe;
        nodes[i - 1].next = next;
    }
    match nodes.first() {
        Some(head) => unsafe { RestoreList::from_head(head) },
        None => RestoreList::empty(),
    }
}
