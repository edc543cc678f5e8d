//! Kernel logger.
//!
//! Two phases, switched by swapping the function pointers in
//! `tachyon_core::log`:
//!
//! 1. **Early serial** — before the heap exists, [`init_early_serial`]
//!    wires the macros straight to COM1, lock-free and allocation-free.
//! 2. **Sink logger** — once the heap is up, [`init_logger`] installs a
//!    [`Logger`] that timestamps each message, prefixes the level, and
//!    fans out to every registered [`LogSink`].

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use tachyon_core::log::{set_log_fn, set_print_fn, LogLevel};
use tachyon_core::sync::SpinLock;

use crate::config::MAX_LOG_LEVEL;
use crate::drivers::uart16550::{Uart16550, COM1_BASE};
use crate::drivers::vga;

/// An output sink for the logger.
pub trait LogSink: Send + Sync {
    /// Writes a string fragment.
    fn write_str(&self, s: &str);
    /// Most verbose level this sink accepts.
    fn max_level(&self) -> LogLevel;
    /// Name, for diagnostics.
    fn name(&self) -> &'static str;
}

/// Sink writing to a 16550 UART.
pub struct SerialSink {
    uart: Uart16550,
    max_level: LogLevel,
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        self.uart.write_str(s);
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

/// Sink writing to the VGA text console.
pub struct VgaSink {
    max_level: LogLevel,
}

impl LogSink for VgaSink {
    fn write_str(&self, s: &str) {
        vga::write_str(s);
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &'static str {
        "vga"
    }
}

struct Logger {
    sinks: Vec<Box<dyn LogSink>>,
}

static LOGGER: SpinLock<Option<Logger>> = SpinLock::new(None);

/// `fmt::Write` adapter over a sink's `write_str`.
struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Phase 1: early serial
// ---------------------------------------------------------------------------

static EARLY_UART: Uart16550 = Uart16550::new(COM1_BASE);

fn early_print(args: fmt::Arguments<'_>) {
    struct W;
    impl fmt::Write for W {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            EARLY_UART.write_str(s);
            Ok(())
        }
    }
    let _ = W.write_fmt(args);
}

fn early_log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level > MAX_LOG_LEVEL {
        return;
    }
    early_print(format_args!("[    boot] {} ", level.name()));
    early_print(args);
    early_print(format_args!("\n"));
}

/// Brings up COM1 and points the log macros at it. First thing the kernel
/// does.
pub fn init_early_serial() {
    EARLY_UART.init();
    // SAFETY: The early functions are callable from any context.
    unsafe {
        set_print_fn(early_print);
        set_log_fn(early_log);
    }
}

// ---------------------------------------------------------------------------
// Phase 2: sink logger
// ---------------------------------------------------------------------------

fn logger_print(args: fmt::Arguments<'_>) {
    let logger = LOGGER.lock();
    if let Some(logger) = logger.as_ref() {
        for sink in &logger.sinks {
            let _ = SinkWriter(sink.as_ref()).write_fmt(args);
        }
    }
}

fn logger_log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level > MAX_LOG_LEVEL {
        return;
    }
    let now = crate::time::current_ms();
    let logger = LOGGER.lock();
    if let Some(logger) = logger.as_ref() {
        for sink in &logger.sinks {
            if level > sink.max_level() {
                continue;
            }
            let mut w = SinkWriter(sink.as_ref());
            let _ = write!(w, "[{:4}.{:03}] {} ", now / 1000, now % 1000, level.name());
            let _ = w.write_fmt(args);
            let _ = w.write_str("\n");
        }
    }
}

/// Replaces the early serial path with the sink logger. Requires the heap
/// and the time source.
pub fn init_logger() {
    let mut logger = LOGGER.lock();
    assert!(logger.is_none(), "logger already initialized");
    let mut sinks: Vec<Box<dyn LogSink>> = Vec::new();
    sinks.push(Box::new(SerialSink {
        uart: EARLY_UART,
        max_level: MAX_LOG_LEVEL,
    }));
    *logger = Some(Logger { sinks });
    drop(logger);

    // SAFETY: The logger functions are callable from any context.
    unsafe {
        set_print_fn(logger_print);
        set_log_fn(logger_log);
    }
}

/// Registers an additional sink.
pub fn add_sink(sink: Box<dyn LogSink>) {
    let mut logger = LOGGER.lock();
    let logger = logger.as_mut().expect("logger not initialized");
    crate::kdebug!("log: adding sink \"{}\"", sink.name());
    logger.sinks.push(sink);
}

/// Creates the VGA sink (cleared screen, info level).
pub fn vga_sink() -> Box<dyn LogSink> {
    vga::clear();
    Box::new(VgaSink {
        max_level: LogLevel::Info,
    })
}
