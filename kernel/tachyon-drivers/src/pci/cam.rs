//! Legacy PCI configuration access (ports 0xCF8/0xCFC).
//!
//! A 32-bit aligned read/write pair is the primitive; narrower accesses
//! shift and mask out of the containing dword. Writes narrower than 32
//! bits program the address register and then write the partial data port,
//! so neighboring registers stay untouched.

use tachyon_kernel::arch::x86_64::Port;

const CONFIG_ADDRESS: u16 = 0x0CF8;
const CONFIG_DATA: u16 = 0x0CFC;

/// Builds the CONFIG_ADDRESS word for bus/device/function + register
/// offset.
#[inline]
fn make_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    (1u32 << 31)
        | (u32::from(bus) << 16)
        | (u32::from(device & 0x1F) << 11)
        | (u32::from(function & 0x07) << 8)
        | (u32::from(offset) & 0xFC)
}

/// Reads a 32-bit config register. `offset` must be 4-byte aligned.
///
/// # Safety
///
/// Config-space access races with any other config-space user; the caller
/// must be the only one.
pub unsafe fn read_u32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    debug_assert!(offset % 4 == 0);
    // SAFETY: Address-then-data is the CAM protocol.
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(make_address(bus, device, function, offset));
        Port::<u32>::new(CONFIG_DATA).read()
    }
}

/// Reads a 16-bit config register. `offset` must be 2-byte aligned.
///
/// # Safety
///
/// As for [`read_u32`].
pub unsafe fn read_u16(bus: u8, device: u8, function: u8, offset: u8) -> u16 {
    debug_assert!(offset % 2 == 0);
    // SAFETY: Forwarded contract.
    let dword = unsafe { read_u32(bus, device, function, offset & !3) };
    (dword >> (u32::from(offset & 2) * 8)) as u16
}

/// Reads an 8-bit config register.
///
/// # Safety
///
/// As for [`read_u32`].
pub unsafe fn read_u8(bus: u8, device: u8, function: u8, offset: u8) -> u8 {
    // SAFETY: Forwarded contract.
    let dword = unsafe { read_u32(bus, device, function, offset & !3) };
    (dword >> (u32::from(offset & 3) * 8)) as u8
}

/// Writes a 32-bit config register. `offset` must be 4-byte aligned.
///
/// # Safety
///
/// Config writes reprogram hardware; the caller must know the register.
pub unsafe fn write_u32(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    debug_assert!(offset % 4 == 0);
    // SAFETY: Address-then-data is the CAM protocol.
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(make_address(bus, device, function, offset));
        Port::<u32>::new(CONFIG_DATA).write(value);
    }
}

/// Writes a 16-bit config register without touching its neighbor.
///
/// # Safety
///
/// As for [`write_u32`].
pub unsafe fn write_u16(bus: u8, device: u8, function: u8, offset: u8, value: u16) {
    debug_assert!(offset % 2 == 0);
    // SAFETY: The data port supports partial-width writes at the
    // corresponding port offset.
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(make_address(bus, device, function, offset));
        Port::<u16>::new(CONFIG_DATA + u16::from(offset & 2)).write(value);
    }
}

/// Standard configuration-space register offsets (type 0 header).
pub mod regs {
    /// Vendor ID (u16).
    pub const VENDOR_ID: u8 = 0x00;
    /// Device ID (u16).
    pub const DEVICE_ID: u8 = 0x02;
    /// Command register (u16).
    pub const COMMAND: u8 = 0x04;
    /// Revision ID (u8).
    pub const REVISION: u8 = 0x08;
    /// Programming interface (u8).
    pub const PROG_IF: u8 = 0x09;
    /// Subclass (u8).
    pub const SUBCLASS: u8 = 0x0A;
    /// Class code (u8).
    pub const CLASS: u8 = 0x0B;
    /// Header type (u8); bit 7 = multi-function.
    pub const HEADER_TYPE: u8 = 0x0E;
    /// First base address register (u32); BAR1..5 follow at +4 steps.
    pub const BAR0: u8 = 0x10;
    /// Interrupt line (u8).
    pub const INTERRUPT_LINE: u8 = 0x3C;

    // Command-register bits.

    /// I/O space decode enable.
    pub const COMMAND_IO_SPACE: u16 = 1 << 0;
    /// Memory space decode enable.
    pub const COMMAND_MEM_SPACE: u16 = 1 << 1;
    /// Bus-master (DMA) enable.
    pub const COMMAND_BUS_MASTER: u16 = 1 << 2;
    /// Legacy interrupt disable.
    pub const COMMAND_INTERRUPT_DISABLE: u16 = 1 << 10;
}
