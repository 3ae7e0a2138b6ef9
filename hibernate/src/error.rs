//! Hibernation errors.
//!
//! Only failures that happen before the point of no return are
//! representable. Past the reset jump there is no caller left to report to.

use core::fmt;

use crate::memory::PhysAddr;

/// Platform result code carried through the resume result cell.
///
/// `0` means the full suspend/resume round trip completed.
pub type ResultCode = i32;

/// Round trip completed.
pub const RESULT_SUCCESS: ResultCode = 0;

/// Hibernation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HibernateError {
    /// The external snapshot builder reported a failure.
    CaptureFailed(ResultCode),
    /// Identity map window falls outside the translation table.
    IdmapOutOfRange,
    /// Identity map window needs more sections than the backup can hold.
    IdmapTooLarge,
    /// An identity mapping is already installed.
    IdmapAlreadyInstalled,
    /// The reset entry is not covered by the identity window.
    EntryOutsideIdmap(PhysAddr),
    /// The capture callback reported success but never committed.
    NotCommitted,
    /// A restore list address is not page aligned.
    MisalignedPage(PhysAddr),
    /// A restore target lies inside the nosave region.
    TargetInNosave(PhysAddr),
    /// A node or staging page would be overwritten before it is read.
    RestoreOverlap(PhysAddr),
}

impl HibernateError {
    /// Get a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            Self::CaptureFailed(_) => "Snapshot capture failed",
            Self::IdmapOutOfRange => "Identity map window outside translation table",
            Self::IdmapTooLarge => "Identity map window exceeds section backup",
            Self::IdmapAlreadyInstalled => "Identity mapping already installed",
            Self::EntryOutsideIdmap(_) => "Reset entry outside identity window",
            Self::NotCommitted => "Capture returned without committing",
            Self::MisalignedPage(_) => "Restore list address not page aligned",
            Self::TargetInNosave(_) => "Restore target inside nosave region",
            Self::RestoreOverlap(_) => "Restore target overlaps an unread page",
        }
    }

    /// Result code reported through the resume result cell.
    ///
    /// Capture failures keep the collaborator's own code; everything else
    /// maps to a fixed negative code.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::CaptureFailed(code) => *code,
            Self::IdmapOutOfRange => -1,
            Self::IdmapTooLarge => -2,
            Self::IdmapAlreadyInstalled => -3,
            Self::MisalignedPage(_) => -4,
            Self::TargetInNosave(_) => -5,
            Self::RestoreOverlap(_) => -6,
            Self::EntryOutsideIdmap(_) => -7,
            Self::NotCommitted => -8,
        }
    }
}

impl fmt::Display for HibernateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CaptureFailed(code) => write!(f, "{} (code {})", self.description(), code),
            Self::MisalignedPage(addr)
            | Self::TargetInNosave(addr)
            | Self::RestoreOverlap(addr)
            | Self::EntryOutsideIdmap(addr) => {
                write!(f, "{} at {:#x}", self.description(), addr)
            }
            _ => f.write_str(self.description()),
        }
    }
}

/// Result type for hibernation operations.
pub type Result<T> = core::result::Result<T, HibernateError>;
