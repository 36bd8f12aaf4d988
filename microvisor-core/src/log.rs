//! Debug ring buffer
//!
//! Lock-free 64 KiB ring the whole hypervisor logs into via the [`log!`]
//! macro; old data is overwritten when the ring wraps. The buffer is
//! exported read-only so an external agent (or the driver, post-stop)
//! can scrape it without hypervisor cooperation. On a bare-metal x86-64
//! build every byte is mirrored to the legacy COM1 UART for early
//! debugging.

use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Ring capacity.
pub const LOG_BUF_SIZE: usize = 64 * 1024;

struct RingStorage(UnsafeCell<[u8; LOG_BUF_SIZE]>);

// Writes are single-byte and position-claimed through WRITE_POS, so
// torn reads are the worst an external scraper can observe.
unsafe impl Sync for RingStorage {}

static LOG_BUFFER: RingStorage = RingStorage(UnsafeCell::new([0; LOG_BUF_SIZE]));
static WRITE_POS: AtomicUsize = AtomicUsize::new(0);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const UART_BASE: u16 = 0x3F8;

#[inline(always)]
fn uart_write_byte(_byte: u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") UART_BASE,
            in("al") _byte,
            options(nomem, nostack, preserves_flags),
        );
    }
}

#[inline]
fn write_byte(b: u8) {
    let pos = WRITE_POS.fetch_add(1, Ordering::Relaxed) % LOG_BUF_SIZE;
    unsafe { (*LOG_BUFFER.0.get())[pos] = b };
    uart_write_byte(b);
}

/// Writer the [`log!`] macro drives.
pub struct RingWriter;

impl Write for RingWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            write_byte(b);
        }
        Ok(())
    }
}

/// Logs a formatted line into the debug ring.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = core::fmt::write(&mut $crate::log::RingWriter, format_args!($($arg)*));
        let _ = $crate::log::RingWriter.write_str("\r\n");
    }};
}

/// Writes one raw byte, for the debug syscall.
pub fn write_char(b: u8) {
    write_byte(b);
}

/// Read-only view of the ring for external tools.
pub fn buffer() -> &'static [u8; LOG_BUF_SIZE] {
    unsafe { &*LOG_BUFFER.0.get() }
}

/// Bytes written since boot (monotonic, not wrapped).
pub fn cursor() -> usize {
    WRITE_POS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    #[test]
    fn ring_receives_formatted_lines() {
        let before = super::cursor();
        log!("vps {} exit {:#x}", 3, 0x72);
        let after = super::cursor();
        assert!(after > before);

        let buf = super::buffer();
        let written: Vec<u8> =
            (before..after).map(|i| buf[i % super::LOG_BUF_SIZE]).collect();
        let text = String::from_utf8_lossy(&written);
        assert!(text.contains("vps 3 exit 0x72"));
    }
}
