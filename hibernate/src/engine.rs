//! Hibernation engine.
//!
//! Ties the pieces together into the two entry points a kernel calls:
//!
//! ```text
//!   begin_hibernation(capture)                     resume(list)
//!   ──────────────────────────                     ────────────
//!   prepare_for_capture                            proc_init
//!   Cpu::suspend ─┬─ capture(PointOfNoReturn)      paint + switch stack
//!                 │    └─ commit ─▶ trigger_reset  identity map on (boot table)
//!                 │                  (reset entry)  restore_pages
//!                 │                                 forget boot window
//!                 │                                 publish success
//!                 └◀──────────── trigger_reset(continuation, image table)
//!   remove identity window (image table)
//!   finalize_after_resume
//!   take result
//! ```
//!
//! `begin_hibernation` returns exactly once per call, always with the code
//! read from the result cell: the capture callback's failure, or the result
//! the resume path published once the image is back.

use core::cell::UnsafeCell;

use crate::context::{
    finalize_after_resume, prepare_for_capture, read_continuation, read_table_root, ProcessorContext,
};
use crate::cpu::Cpu;
use crate::error::{HibernateError, Result, ResultCode, RESULT_SUCCESS};
use crate::memory::PhysAddr;
use crate::nosave::{NosaveArea, Phase};
use crate::remap::MAX_IDMAP_SECTIONS;
use crate::reset::{trigger_reset, IdmapWindow};
use crate::restore::{restore_pages, RestoreList};
use crate::{hib_log, hib_log_hex, hib_trace_hex};

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Platform parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HibernateConfig {
    /// Physical entry the going-down transition jumps to (firmware reset
    /// vector or platform power-off entry).
    pub reset_entry: PhysAddr,
    /// Identity window covering the reset and restore code, the reset
    /// entry and the resume continuation.
    pub idmap: IdmapWindow,
}

impl HibernateConfig {
    pub const fn new(reset_entry: PhysAddr, idmap_base: PhysAddr, idmap_size: usize) -> Self {
        Self {
            reset_entry,
            idmap: IdmapWindow::new(idmap_base, idmap_size),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HIBERNATOR
// ═══════════════════════════════════════════════════════════════════════════

/// One hibernation engine instance.
///
/// Must itself live in ordinary, captured memory: the processor context
/// it holds comes back with the image.
pub struct Hibernator<'a, C: Cpu> {
    cpu: &'a C,
    nosave: &'a NosaveArea,
    config: HibernateConfig,
    context: UnsafeCell<ProcessorContext>,
}

// Used by one core with interrupts masked.
unsafe impl<C: Cpu + Sync> Sync for Hibernator<'_, C> {}

impl<'a, C: Cpu> Hibernator<'a, C> {
    /// Check `config` against the live translation table.
    pub fn new(cpu: &'a C, nosave: &'a NosaveArea, config: HibernateConfig) -> Result<Self> {
        let table = cpu.translation_table();
        let sections = table.index_range(config.idmap.base, config.idmap.size)?;
        if sections.len() > MAX_IDMAP_SECTIONS {
            return Err(HibernateError::IdmapTooLarge);
        }
        if !config.idmap.contains(config.reset_entry) {
            return Err(HibernateError::EntryOutsideIdmap(config.reset_entry));
        }

        hib_log_hex!("identity window base: ", config.idmap.base);
        hib_log_hex!("identity window sections: ", sections.len());

        Ok(Self {
            cpu,
            nosave,
            config,
            context: UnsafeCell::new(ProcessorContext::empty()),
        })
    }

    pub fn config(&self) -> &HibernateConfig {
        &self.config
    }

    pub fn nosave(&self) -> &'a NosaveArea {
        self.nosave
    }

    pub fn phase(&self) -> Phase {
        self.nosave.phase()
    }

    /// Resume stack high-water mark left by the last restore, in bytes.
    pub fn resume_stack_usage(&self) -> usize {
        // Nothing runs on the resume stack outside `resume`.
        unsafe { self.nosave.stack().usage() }
    }

    /// Hibernate.
    ///
    /// `capture` runs with the processor context recorded. It builds the
    /// snapshot and then either calls `PointOfNoReturn::commit` or returns
    /// a nonzero code. That code is published to the result cell and
    /// returned from here; nothing is flushed or torn down beyond the
    /// capture bracket. Returning `RESULT_SUCCESS` without committing is
    /// reported as `HibernateError::NotCommitted`, so `RESULT_SUCCESS`
    /// always means a completed round trip.
    ///
    /// After a commit, this call returns again once the image has been
    /// restored, with the code published by the resume path.
    pub fn begin_hibernation<F>(&self, capture: F) -> ResultCode
    where
        F: FnOnce(PointOfNoReturn<'_, C>) -> ResultCode,
    {
        let nosave = self.nosave;

        nosave.set_phase(Phase::Preparing);
        let readiness = prepare_for_capture(self.cpu);
        nosave.result().arm();

        let mut capture = Some(capture);
        let mut save = |ctx: &ProcessorContext| -> ResultCode {
            nosave.set_phase(Phase::Capturing);

            let continuation = ctx.continuation as PhysAddr;
            if !self.config.idmap.contains(continuation) {
                let err = HibernateError::EntryOutsideIdmap(continuation);
                hib_log!(err.description());
                nosave.result().publish(err.code());
                return err.code();
            }

            // suspend runs `save` exactly once
            let Some(capture) = capture.take() else {
                return HibernateError::NotCommitted.code();
            };
            let code = capture(PointOfNoReturn {
                cpu: self.cpu,
                nosave,
                config: self.config,
                context: self.context.get(),
            });

            // Still here, so no commit happened.
            let code = if code == RESULT_SUCCESS {
                let err = HibernateError::NotCommitted;
                hib_log!(err.description());
                err.code()
            } else {
                hib_log_hex!("capture failed, code: ", code);
                code
            };
            nosave.result().publish(code);
            code
        };

        let code = unsafe { self.cpu.suspend(self.context.get(), &mut save) };

        nosave.set_phase(Phase::Finalizing);
        // A resumed image arrives under the reset transition's window.
        if unsafe { nosave.remove_identity_mapping() } {
            self.cpu.flush_tlb_all();
        }
        finalize_after_resume(self.cpu, readiness);

        // `code` only stands in if the cell was never written.
        let result = nosave.result().take().unwrap_or(code);
        unsafe { (*self.context.get()).clear() };
        nosave.set_phase(Phase::Idle);

        hib_log_hex!("hibernation returned: ", result);
        result
    }

    /// Resume entry, called by the platform's resume dispatcher on the
    /// boot that found a saved image.
    ///
    /// Switches to the resume stack, copies every entry of `list` back and
    /// lands in the continuation recorded by `begin_hibernation`, which
    /// then returns `RESULT_SUCCESS`.
    ///
    /// With `verify_restore_list` the list is validated first and a bad
    /// list halts the core before any page is written.
    ///
    /// # Safety
    /// - single core, interrupts masked
    /// - this instance sits at the same address as in the hibernated image
    /// - every node and staging page of `list` stays intact until read
    /// - the live (boot) translation table is not a restore target
    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    pub unsafe fn resume(&self, list: RestoreList) -> ! {
        let nosave = self.nosave;

        self.cpu.proc_init();
        hib_log!("resuming saved image");

        #[cfg(feature = "verify_restore_list")]
        match list.validate(&nosave.region()) {
            Ok(entries) => hib_log_hex!("restore list entries: ", entries),
            Err(err) => {
                hib_log!(err.description());
                self.cpu.halt();
            }
        }

        hib_trace_hex!("restore list head: ", list.head() as usize);
        nosave.set_phase(Phase::Restoring);

        let plan = RestorePlan {
            cpu: self.cpu,
            nosave,
            window: self.config.idmap,
            context: self.context.get(),
            list,
        };

        let stack = nosave.stack();
        stack.paint();
        self.cpu.call_with_stack(stack.top(), &mut move || unsafe { plan.run() })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// POINT OF NO RETURN
// ═══════════════════════════════════════════════════════════════════════════

/// Handed to the capture callback. `commit` enters the reset transition.
pub struct PointOfNoReturn<'h, C: Cpu> {
    cpu: &'h C,
    nosave: &'h NosaveArea,
    config: HibernateConfig,
    context: *const ProcessorContext,
}

impl<C: Cpu> PointOfNoReturn<'_, C> {
    /// Context recorded at suspend entry. Must be part of the snapshot.
    pub fn context(&self) -> &ProcessorContext {
        unsafe { &*self.context }
    }

    /// Context address, for snapshot builders that check coverage.
    pub fn context_addr(&self) -> PhysAddr {
        self.context as PhysAddr
    }

    /// Power-cycle into the platform reset entry.
    pub fn commit(self) -> ! {
        self.nosave.set_phase(Phase::Committed);
        hib_log_hex!("entering reset transition: ", self.config.reset_entry);
        unsafe {
            let table_root = read_table_root(self.context);
            trigger_reset(
                self.cpu,
                self.nosave,
                self.config.idmap,
                table_root,
                self.config.reset_entry,
                0,
            )
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RESTORE PLAN
// ═══════════════════════════════════════════════════════════════════════════

/// Everything the restore path needs, copied onto the resume stack before
/// the first page is written.
struct RestorePlan<'a, C: Cpu> {
    cpu: &'a C,
    nosave: &'a NosaveArea,
    window: IdmapWindow,
    context: *mut ProcessorContext,
    list: RestoreList,
}

impl<C: Cpu> Clone for RestorePlan<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Cpu> Copy for RestorePlan<'_, C> {}

impl<C: Cpu> RestorePlan<'_, C> {
    /// The boot kernel's table gets the window for the copy. Once the copy
    /// is done that table is abandoned (its page may even hold restored
    /// contents by now), so its window is forgotten rather than removed.
    /// The landing window goes into the image's table recorded at suspend,
    /// which the resume label switches to.
    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    unsafe fn run(self) -> ! {
        let Self {
            cpu,
            nosave,
            window,
            context,
            list,
        } = self;

        if nosave
            .install_identity_mapping(cpu.translation_table(), window.base, window.size)
            .is_err()
        {
            cpu.halt();
        }
        cpu.flush_tlb_all();

        restore_pages(list);

        nosave.forget_identity_mapping();

        nosave.result().publish_success();
        let continuation = read_continuation(context);
        let table_root = read_table_root(context);
        trigger_reset(cpu, nosave, window, table_root, continuation, context as usize)
    }
}
