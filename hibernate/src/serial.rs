//! Serial debug output.
//!
//! Bare-metal and UEFI x86_64 builds write COM1 @ 0x3F8 by polling. Every
//! other build (aarch64 boards without a fixed UART, hosted test runs)
//! records the bytes into a fixed in-memory history instead, so log lines
//! can be inspected after the fact.
//!
//! Never log past the point of no return: the history and the port state
//! live in ordinary memory that the restore loop overwrites.

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND: COM1
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(all(target_arch = "x86_64", any(target_os = "none", target_os = "uefi")))]
mod backend {
    const COM1: u16 = 0x3F8;
    const COM1_LSR: u16 = COM1 + 5;
    const LSR_TX_EMPTY: u8 = 0x20;

    /// Write bytes to COM1.
    pub fn write(bytes: &[u8]) {
        for &b in bytes {
            putc(b);
        }
    }

    /// Write byte to COM1. Bounded wait, gives up after ~100 spins.
    #[inline]
    fn putc(b: u8) {
        unsafe {
            for _ in 0..100 {
                let status: u8;
                core::arch::asm!(
                    "in al, dx",
                    in("dx") COM1_LSR,
                    out("al") status,
                    options(nostack, preserves_flags)
                );
                if status & LSR_TX_EMPTY != 0 {
                    core::arch::asm!(
                        "out dx, al",
                        in("dx") COM1,
                        in("al") b,
                        options(nostack, preserves_flags)
                    );
                    return;
                }
                core::hint::spin_loop();
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND: IN-MEMORY HISTORY
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(not(all(target_arch = "x86_64", any(target_os = "none", target_os = "uefi"))))]
mod backend {
    use spin::Mutex;

    const HISTORY_SIZE: usize = 64 * 1024;

    pub(super) struct History {
        pub(super) data: [u8; HISTORY_SIZE],
        pub(super) len: usize,
    }

    pub(super) static HISTORY: Mutex<History> = Mutex::new(History {
        data: [0; HISTORY_SIZE],
        len: 0,
    });

    /// Append bytes under one lock so concurrent writers never interleave
    /// inside a single write. A full history starts over from the beginning.
    pub fn write(bytes: &[u8]) {
        let mut history = HISTORY.lock();
        for &b in bytes {
            if history.len == HISTORY_SIZE {
                history.len = 0;
            }
            let len = history.len;
            history.data[len] = b;
            history.len = len + 1;
        }
    }
}

pub use backend::write;

/// Does the recorded history contain `needle`?
///
/// Always `false` when output goes to a real port.
pub fn history_contains(needle: &str) -> bool {
    #[cfg(not(all(target_arch = "x86_64", any(target_os = "none", target_os = "uefi"))))]
    {
        let history = backend::HISTORY.lock();
        let haystack = &history.data[..history.len];
        let needle = needle.as_bytes();
        if needle.is_empty() {
            return true;
        }
        haystack.windows(needle.len()).any(|w| w == needle)
    }
    #[cfg(all(target_arch = "x86_64", any(target_os = "none", target_os = "uefi")))]
    {
        let _ = needle;
        false
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FORMATTING
// ═══════════════════════════════════════════════════════════════════════════

/// Write string.
#[inline]
pub fn puts(s: &str) {
    write(s.as_bytes());
}

/// Write u64 as hex (0x prefix).
pub fn put_hex64(val: u64) {
    let mut buf = *b"0x0000000000000000";
    for i in 0..16 {
        let nibble = ((val >> ((15 - i) * 4)) & 0xF) as u8;
        buf[2 + i] = if nibble < 10 { b'0' + nibble } else { b'a' + nibble - 10 };
    }
    write(&buf);
}

/// Newline.
#[inline]
pub fn newline() {
    write(b"\n");
}

/// Log line with [HIBERNATE] prefix.
#[macro_export]
macro_rules! hib_log {
    ($($arg:tt)*) => {{
        $crate::serial::puts("[HIBERNATE] ");
        $crate::serial::puts($($arg)*);
        $crate::serial::newline();
    }};
}

/// Log line with a hex value appended.
#[macro_export]
macro_rules! hib_log_hex {
    ($msg:expr, $val:expr) => {{
        $crate::serial::puts("[HIBERNATE] ");
        $crate::serial::puts($msg);
        $crate::serial::put_hex64($val as u64);
        $crate::serial::newline();
    }};
}

/// Trace line, compiled out unless the `trace` feature is on.
#[macro_export]
macro_rules! hib_trace_hex {
    ($msg:expr, $val:expr) => {{
        #[cfg(feature = "trace")]
        {
            $crate::hib_log_hex!($msg, $val);
        }
        #[cfg(not(feature = "trace"))]
        {
            let _ = &$val;
        }
    }};
}
