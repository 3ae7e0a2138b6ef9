//! Resume result handoff.
//!
//! One word that crosses the power cycle. From the point of view of the
//! call that started hibernation it is written "in the future" (by the
//! restore path or a pre-reset failure) and read once on return.

use core::sync::atomic::{AtomicI64, Ordering};

use crate::error::{ResultCode, RESULT_SUCCESS};

/// Sentinel meaning "nothing published yet". Outside the `ResultCode` range.
const NO_RESULT: i64 = i64::MIN;

/// Single-writer, single-reader cell scoped to one hibernation attempt.
pub struct ResumeResultCell {
    value: AtomicI64,
}

impl ResumeResultCell {
    pub const fn new() -> Self {
        Self { value: AtomicI64::new(NO_RESULT) }
    }

    /// Reset to "no result" before the reset transition.
    pub fn arm(&self) {
        self.value.store(NO_RESULT, Ordering::SeqCst);
    }

    /// Publish the outcome. The first write of an attempt wins.
    ///
    /// Returns `false` if a result was already published.
    #[cfg_attr(target_os = "none", link_section = ".text.nosave")]
    pub fn publish(&self, code: ResultCode) -> bool {
        self.value
            .compare_exchange(NO_RESULT, code as i64, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Publish success.
    #[inline(always)]
    pub fn publish_success(&self) -> bool {
        self.publish(RESULT_SUCCESS)
    }

    /// Has anything been published since `arm`?
    pub fn is_published(&self) -> bool {
        self.value.load(Ordering::SeqCst) != NO_RESULT
    }

    /// Read the outcome once, leaving the cell disarmed.
    pub fn take(&self) -> Option<ResultCode> {
        match self.value.swap(NO_RESULT, Ordering::SeqCst) {
            NO_RESULT => None,
            code => Some(code as ResultCode),
        }
    }
}

impl Default for ResumeResultCell {
    fn default() -> Self {
        Self::new()
    }
}
