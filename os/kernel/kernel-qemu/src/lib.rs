//! # QEMU Debug Console Support
//!
//! Writes kernel diagnostics to QEMU's debug console (I/O port `0x402`,
//! captured with `-debugcon stdio`), either directly through
//! [`qemu_trace!`] or through the `log` facade via [`QemuLogger`].
//!
//! ```text
//! log::info!(..) ──► QemuLogger ──► qemu_trace! ──► QemuSink ──► out 0x402
//! ```
//!
//! Without the `enabled` feature every write is a no-op, which keeps host
//! builds free of port I/O.
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::{LevelFilter, info};
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//!
//! LOGGER.init().expect("logger installed twice");
//! info!("frame allocator ready");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's debug console port.
    const QEMU_DEBUG_PORT: u16 = 0x402;

    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; there is nowhere to report a failed debug write.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[inline(always)]
    #[allow(clippy::inline_always, clippy::needless_pass_by_value)]
    pub fn qemu_write(_: fmt::Arguments) {}
}

/// `print!`-style output straight to the QEMU debug console.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
