//! PCI device discovery and BAR decoding.
//!
//! Probes function 0 of every (bus, device) pair — no multi-function or
//! bridge recursion — and rejects anything that is not a plain type-0
//! header. BAR sizing uses the classic write-all-ones trick with I/O and
//! memory decode disabled around it, since some devices decode the sizing
//! write as a real access.

/// Decoded base address register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBar {
    /// Register not implemented (or consumed by a 64-bit neighbor).
    Unused,
    /// I/O port range.
    Io {
        /// First port.
        base: u32,
        /// Number of ports.
        size: u32,
    },
    /// Memory-mapped range.
    Memory {
        /// Physical base address.
        base: u64,
        /// Length in bytes.
        size: u64,
        /// Prefetchable bit.
        prefetchable: bool,
        /// 64-bit BAR (consumed the following register).
        is_64bit: bool,
    },
}

/// Everything the probe loop needs to know about one function.
#[derive(Debug, Clone, Copy)]
pub struct PciDeviceInfo {
    /// Bus number.
    pub bus: u8,
    /// Device number on the bus.
    pub device: u8,
    /// Function number (always 0 in this kernel).
    pub function: u8,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Class code.
    pub class: u8,
    /// Subclass code.
    pub subclass: u8,
    /// Programming interface.
    pub prog_if: u8,
    /// Revision ID.
    pub revision: u8,
    /// Routed legacy interrupt line (IRQ number).
    pub interrupt_line: u8,
    /// Decoded base address registers.
    pub bars: [PciBar; 6],
}

/// Size encoded by a BAR sizing read: mask the type bits, invert, add one.
pub fn bar_size_from_sizing(sizing: u32, mask: u32) -> u32 {
    (!(sizing & mask)).wrapping_add(1)
}

/// Address mask of an I/O BAR.
pub const BAR_IO_ADDR_MASK: u32 = !0x3;
/// Address mask of a memory BAR.
pub const BAR_MEM_ADDR_MASK: u32 = !0xF;

#[cfg(target_os = "none")]
mod scan {
    use super::*;
    use crate::pci::cam::{self, regs};
    use tachyon_core::error::KResult;

    const MAX_BUSES: u16 = 256;
    const MAX_DEVICES: u8 = 32;

    /// `true` when a function answers with a valid vendor ID.
    fn device_exists(bus: u8, device: u8) -> bool {
        // 0xFFFF is deliberately unassigned so absent devices are
        // recognisable.
        // SAFETY: Probing config space of any BDF is harmless.
        unsafe { cam::read_u16(bus, device, 0, regs::VENDOR_ID) != 0xFFFF }
    }

    /// Decodes the six BARs of a type-0 header, with decode disabled
    /// around the sizing writes.
    fn decode_bars(bus: u8, device: u8) -> [PciBar; 6] {
        // SAFETY: All accesses stay within this function's device.
        unsafe {
            let orig_cmd = cam::read_u16(bus, device, 0, regs::COMMAND);
            cam::write_u16(
                bus,
                device,
                0,
                regs::COMMAND,
                orig_cmd & !(regs::COMMAND_IO_SPACE | regs::COMMAND_MEM_SPACE),
            );

            let mut bars = [PciBar::Unused; 6];
            let mut i = 0;
            while i < 6 {
                let offset = regs::BAR0 + (i as u8) * 4;
                let original = cam::read_u32(bus, device, 0, offset);
                cam::write_u32(bus, device, 0, offset, 0xFFFF_FFFF);
                let sizing = cam::read_u32(bus, device, 0, offset);
                cam::write_u32(bus, device, 0, offset, original);

                if sizing == 0 || sizing == 0xFFFF_FFFF {
                    i += 1;
                    continue;
                }

                if original & 1 != 0 {
                    bars[i] = PciBar::Io {
                        base: original & BAR_IO_ADDR_MASK,
                        size: bar_size_from_sizing(sizing, BAR_IO_ADDR_MASK) & 0xFFFF,
                    };
                    i += 1;
                } else {
                    let mem_type = (original >> 1) & 0x3;
                    let prefetchable = original & 0x8 != 0;
                    match mem_type {
                        0 => {
                            bars[i] = PciBar::Memory {
                                base: u64::from(original & BAR_MEM_ADDR_MASK),
                                size: u64::from(bar_size_from_sizing(sizing, BAR_MEM_ADDR_MASK)),
                                prefetchable,
                                is_64bit: false,
                            };
                            i += 1;
                        }
                        2 if i + 1 < 6 => {
                            let hi_offset = regs::BAR0 + ((i + 1) as u8) * 4;
                            let hi_original = cam::read_u32(bus, device, 0, hi_offset);
                            cam::write_u32(bus, device, 0, hi_offset, 0xFFFF_FFFF);
                            let hi_sizing = cam::read_u32(bus, device, 0, hi_offset);
                            cam::write_u32(bus, device, 0, hi_offset, hi_original);

                            let base = (u64::from(hi_original) << 32)
                                | u64::from(original & BAR_MEM_ADDR_MASK);
                            let mask = (u64::from(hi_sizing) << 32)
                                | u64::from(sizing & BAR_MEM_ADDR_MASK);
                            bars[i] = PciBar::Memory {
                                base,
                                size: (!mask).wrapping_add(1),
                                prefetchable,
                                is_64bit: true,
                            };
                            // The upper half consumed the next register.
                            i += 2;
                        }
                        _ => {
                            // Reserved memory BAR type.
                            i += 1;
                        }
                    }
                }
            }

            cam::write_u16(bus, device, 0, regs::COMMAND, orig_cmd);
            bars
        }
    }

    /// Reads the full [`PciDeviceInfo`] of a present function 0, or `None`
    /// for absent devices and non-type-0 headers.
    pub(crate) fn read_device(bus: u8, device: u8) -> Option<PciDeviceInfo> {
        if !device_exists(bus, device) {
            return None;
        }
        // SAFETY: The device answered; reads are harmless.
        unsafe {
            let header_type = cam::read_u8(bus, device, 0, regs::HEADER_TYPE);
            if header_type & 0x7F != 0 {
                tachyon_kernel::kdebug!(
                    "pci: skipping {:02x}:{:02x}.0 (header type {:#x})",
                    bus,
                    device,
                    header_type
                );
                return None;
            }

            Some(PciDeviceInfo {
                bus,
                device,
                function: 0,
                vendor_id: cam::read_u16(bus, device, 0, regs::VENDOR_ID),
                device_id: cam::read_u16(bus, device, 0, regs::DEVICE_ID),
                class: cam::read_u8(bus, device, 0, regs::CLASS),
                subclass: cam::read_u8(bus, device, 0, regs::SUBCLASS),
                prog_if: cam::read_u8(bus, device, 0, regs::PROG_IF),
                revision: cam::read_u8(bus, device, 0, regs::REVISION),
                interrupt_line: cam::read_u8(bus, device, 0, regs::INTERRUPT_LINE),
                bars: decode_bars(bus, device),
            })
        }
    }

    /// Walks every bus/device pair, invoking `visit` for each present
    /// type-0 function.
    pub(crate) fn for_each_device(mut visit: impl FnMut(&PciDeviceInfo) -> KResult<()>) -> KResult<()> {
        for bus in 0..MAX_BUSES {
            for device in 0..MAX_DEVICES {
                if let Some(info) = read_device(bus as u8, device) {
                    tachyon_kernel::kdebug!(
                        "pci: {:02x}:{:02x}.0 [{:04x}:{:04x}] class {:02x}.{:02x}",
                        info.bus,
                        info.device,
                        info.vendor_id,
                        info.device_id,
                        info.class,
                        info.subclass
                    );
                    visit(&info)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "none")]
pub(crate) use scan::for_each_device;
