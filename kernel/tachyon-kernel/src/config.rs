//! Compile-time kernel configuration.
//!
//! Single source of truth for the constants that shape the kernel's memory
//! map and table sizes. Everything here is a plain `const` so the values
//! show up verbatim in the code that uses them.

use tachyon_core::log::LogLevel;

/// Size of one page / physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Base of the identity-mapped low region holding the kernel image, the
/// boot archive and legacy MMIO (VGA text buffer).
pub const LOW_MEM_BASE: u64 = 0x0;
/// Length of the identity-mapped low region (16 MiB).
pub const LOW_MEM_LEN: u64 = 0x0100_0000;

/// Base of the dynamic memory region handed to the allocators.
pub const DYN_MEM_BASE: u64 = 0x0100_0000;
/// Length of the dynamic memory region (112 MiB).
pub const DYN_MEM_LEN: u64 = 0x0700_0000;

/// Physical address at which the boot loader deposits the file archive.
pub const ARCHIVE_BASE: u64 = 0x0080_0000;
/// Upper bound on the size of the boot archive (4 MiB).
pub const ARCHIVE_MAX_LEN: usize = 0x0040_0000;

/// Bytes of kernel heap carved out of kvalloc at boot.
pub const KERNEL_HEAP_SIZE: usize = 0x10_0000;

/// Kernel stack size of a cooperative task.
pub const TASK_STACK_SIZE: usize = 0x4000;

/// Depth of the network input queue.
pub const INPUT_QUEUE_DEPTH: usize = 32;
/// Payload capacity of one input-queue slot.
pub const INPUT_SLOT_SIZE: usize = 2048;

/// Path of the runtime configuration file inside the boot archive.
pub const CONFIG_FILE_PATH: &str = "/boot/boot.cfg";

/// TCP port the web responder listens on.
pub const WEB_PORT: u16 = 80;

/// Maximum log level compiled into the sinks.
pub const MAX_LOG_LEVEL: LogLevel = LogLevel::Debug;
