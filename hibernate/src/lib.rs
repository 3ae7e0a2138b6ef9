//! Hibernation Core
//!
//! Suspend-to-disk for a single core: capture the processor context next to
//! a memory snapshot, power-cycle, copy the snapshot back and return from
//! the original call as if nothing happened.
//!
//! # Architecture
//!
//! ```text
//! going down:
//!   prepare_for_capture          mask IRQs, flush thread state
//!   Cpu::suspend                 record callee-saved regs + continuation
//!     capture (external)         memory manager builds the image
//!     PointOfNoReturn::commit    trigger_reset → platform reset entry
//!
//! [power cycle, firmware finds the image, loads staging pages]
//!
//! coming up:
//!   Hibernator::resume           proc_init, switch to nosave stack
//!     restore_pages              copy every Pbe back (identity mapped)
//!     publish success            result cell in nosave
//!     trigger_reset              → continuation recorded at suspend
//!   Cpu::suspend returns 0
//!   finalize_after_resume        restore thread state, unmask IRQs
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use morpheus_hibernate::{HibernateConfig, Hibernator, NOSAVE_AREA};
//! use morpheus_hibernate::cpu::x86_64::X86_64Cpu;
//!
//! static CPU: X86_64Cpu = X86_64Cpu::new();
//!
//! let config = HibernateConfig::new(RESET_ENTRY, IDMAP_BASE, IDMAP_SIZE);
//! let hib = Hibernator::new(&CPU, &NOSAVE_AREA, config)?;
//!
//! let code = hib.begin_hibernation(|point| {
//!     if let Err(e) = snapshot::build_and_write() {
//!         return e.code();
//!     }
//!     point.commit()
//! });
//! ```
//!
//! # What This Crate Does NOT Do
//!
//! - Choose snapshot pages or build the restore list
//! - Write or read the image on storage
//! - Detect a resume boot (the platform dispatcher calls `resume`)
//! - Device suspend/resume, secondary cores

#![cfg_attr(not(test), no_std)]

pub mod context;
pub mod cpu;
pub mod engine;
pub mod error;
pub mod memory;
pub mod nosave;
pub mod remap;
pub mod reset;
pub mod restore;
pub mod result;
pub mod serial;

#[cfg(test)]
mod testing;

// Re-exports
pub use context::{finalize_after_resume, prepare_for_capture, CaptureReadiness, ProcessorContext};
pub use cpu::Cpu;
pub use engine::{HibernateConfig, Hibernator, PointOfNoReturn};
pub use error::{HibernateError, Result, ResultCode, RESULT_SUCCESS};
pub use memory::{PhysAddr, Pfn, PAGE_SIZE};
pub use nosave::{is_excluded_page, NosaveArea, NosaveRegion, Phase, NOSAVE_AREA, RESUME_STACK_SIZE};
pub use remap::{IdentityMap, SectionTable};
pub use reset::{trigger_reset, IdmapWindow};
pub use restore::{Pbe, RestoreList};
pub use result::ResumeResultCell;
