//! Restore list and page copy loop.
//!
//! The memory manager hands over a singly linked list of page backup
//! entries. Each names a staging page (where the image loader put the saved
//! bytes) and the original page they belong in.
//!
//! ```text
//!  head ──▶ ┌──────────────┐    ┌──────────────┐
//!           │ orig_address │    │ orig_address │
//!           │ address      │    │ address      │
//!           │ next ────────┼──▶ │ next = null  │
//!           └──────────────┘    └──────────────┘
//! ```
//!
//! The copy loop trusts the list completely. Every node and every staging
//! page must stay untouched until the loop has read it; `RestoreList::validate`
//! checks that precondition ahead of time for callers that want it.

use core::marker::PhantomData;
use core::ptr::{self, read_volatile, write_volatile};

use crate::error::{HibernateError, Result};
use crate::memory::{is_page_aligned, ranges_overlap, PhysAddr, PAGE_SIZE};
use crate::nosave::NosaveRegion;

const WORDS_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<u64>();

/// One page backup entry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Pbe {
    /// Physical page the saved bytes belong in.
    pub orig_address: PhysAddr,
    /// Staging page holding the saved bytes.
    pub address: PhysAddr,
    /// Next entry, null at the end.
    pub next: *const Pbe,
}

impl Pbe {
    pub const fn new(orig_address: PhysAddr, address: PhysAddr) -> Self {
        Self {
            orig_address,
            address,
            next: ptr::null(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RESTORE LIST
// ═══════════════════════════════════════════════════════════════════════════

/// Head of a restore list. A null head is the empty list.
#[derive(Debug, Clone, Copy)]
pub struct RestoreList {
    head: *const Pbe,
}

impl RestoreList {
    /// The empty list.
    pub const fn empty() -> Self {
        Self { head: ptr::null() }
    }

    /// Wrap a list built by the memory manager.
    ///
    /// # Safety
    /// Every node reachable from `head` must be readable and the chain must
    /// end in a null `next`.
    pub const unsafe fn from_head(head: *const Pbe) -> Self {
        Self { head }
    }

    pub fn head(&self) -> *const Pbe {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Walk the entries in list order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            cur: self.head,
            _list: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Check the list against everything the copy loop assumes.
    ///
    /// - both addresses of every entry are page aligned
    /// - no target lies in `nosave`
    /// - no target page covers a node or a staging page of the list
    ///
    /// Quadratic in the list length. Returns the number of entries.
    pub fn validate(&self, nosave: &NosaveRegion) -> Result<usize> {
        let mut count = 0;
        for pbe in self.iter() {
            if !is_page_aligned(pbe.orig_address) {
                return Err(HibernateError::MisalignedPage(pbe.orig_address));
            }
            if !is_page_aligned(pbe.address) {
                return Err(HibernateError::MisalignedPage(pbe.address));
            }
            if ranges_overlap(pbe.orig_address, PAGE_SIZE, nosave.begin(), nosave.end() - nosave.begin()) {
                return Err(HibernateError::TargetInNosave(pbe.orig_address));
            }

            for other in self.iter() {
                let node = other as *const Pbe as PhysAddr;
                if ranges_overlap(pbe.orig_address, PAGE_SIZE, node, core::mem::size_of::<Pbe>())
                    || ranges_overlap(pbe.orig_address, PAGE_SIZE, other.address, PAGE_SIZE)
                {
                    return Err(HibernateError::RestoreOverlap(pbe.orig_address));
                }
            }
            count += 1;
        }
        Ok(count)
    }
}

/// Iterator over a `RestoreList`.
pub struct Iter<'a> {
    cur: *const Pbe,
    _list: PhantomData<&'a Pbe>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Pbe;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: `RestoreList::from_head` requires readable nodes.
        let pbe = unsafe { &*self.cur };
        self.cur = pbe.next;
        Some(pbe)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COPY LOOP
// ═══════════════════════════════════════════════════════════════════════════

/// Copy one page word by word.
///
/// Volatile accesses keep the compiler from turning this into a `memcpy`
/// call that would leave `.text.nosave`.
///
/// # Safety
/// Both addresses must be page aligned, mapped, and must not overlap.
#[cfg_attr(target_os = "none", link_section = ".text.nosave")]
#[inline(never)]
pub unsafe fn copy_page(dst: PhysAddr, src: PhysAddr) {
    let dst = dst as *mut u64;
    let src = src as *const u64;
    for word in 0..WORDS_PER_PAGE {
        write_volatile(dst.add(word), read_volatile(src.add(word)));
    }
}

/// Copy every staged page back to its original address with `copy`.
///
/// Each node is read in full before its page is written.
///
/// # Safety
/// See `restore_pages`.
#[inline(always)]
pub unsafe fn restore_pages_with<F>(list: RestoreList, mut copy: F)
where
    F: FnMut(PhysAddr, PhysAddr),
{
    let mut cur = list.head;
    while !cur.is_null() {
        let pbe = read_volatile(cur);
        copy(pbe.orig_address, pbe.address);
        cur = pbe.next;
    }
}

/// The restore loop: one page per entry, head to tail, no checks.
///
/// # Safety
/// - runs identity mapped with interrupts masked on the resume stack
/// - every node and staging page is intact when the loop reaches it
/// - no target lies in the nosave region
#[cfg_attr(target_os = "none", link_section = ".text.nosave")]
#[inline(never)]
pub unsafe fn restore_pages(list: RestoreList) {
    restore_pages_with(list, |dst, src| copy_page(dst, src));
}
