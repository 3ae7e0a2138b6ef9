//! Page and address arithmetic shared by the hibernation core.
//!
//! Everything here is `const fn` so it can be evaluated in the nosave
//! layout assertions and used from the restore path without touching any
//! state.

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// Page size (4KB).
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Physical address. The restore path runs identity-mapped, so a physical
/// address is also a dereferenceable pointer there.
pub type PhysAddr = usize;

/// Page frame number (`addr >> PAGE_SHIFT`).
pub type Pfn = usize;

// ═══════════════════════════════════════════════════════════════════════════
// ALIGNMENT
// ═══════════════════════════════════════════════════════════════════════════

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Align a value down to the given power-of-two alignment.
#[inline]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

/// Is `addr` on a page boundary?
#[inline]
pub const fn is_page_aligned(addr: PhysAddr) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

// ═══════════════════════════════════════════════════════════════════════════
// CONVERSIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Frame containing `addr`.
#[inline]
pub const fn addr_to_pfn(addr: PhysAddr) -> Pfn {
    addr >> PAGE_SHIFT
}

/// First byte of frame `pfn`.
#[inline]
pub const fn pfn_to_addr(pfn: Pfn) -> PhysAddr {
    pfn << PAGE_SHIFT
}

/// Convert pages to bytes.
#[inline]
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages * PAGE_SIZE
}

/// Convert bytes to pages (rounded up).
#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    align_up(bytes, PAGE_SIZE) / PAGE_SIZE
}

/// Do `[a, a + a_len)` and `[b, b + b_len)` share at least one byte?
#[inline]
pub const fn ranges_overlap(a: PhysAddr, a_len: usize, b: PhysAddr, b_len: usize) -> bool {
    a < b + b_len && b < a + a_len
}
