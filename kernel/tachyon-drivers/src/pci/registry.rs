//! Driver table and probe loop.
//!
//! Drivers self-describe with a list of `(vendor, device)` IDs, a
//! capability mask and a probe function. [`probe_all`] scans the bus,
//! finds the single driver matching each device, programs the command
//! register from the capability mask (I/O, memory, bus-master; the
//! interrupt capability clears the interrupt-disable bit) and invokes the
//! probe.

use tachyon_core::error::KResult;

use super::enumerate::PciDeviceInfo;

bitflags::bitflags! {
    /// What a driver needs from its device, mapped onto command-register
    /// bits at bind time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverCaps: u16 {
        /// I/O port access.
        const IO = 1 << 0;
        /// MMIO access.
        const MEM = 1 << 1;
        /// Bus-master DMA.
        const DMA = 1 << 2;
        /// Legacy interrupt delivery.
        const INTERRUPT = 1 << 3;
    }
}

/// A `(vendor, device)` pair a driver claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceId {
    /// Vendor ID.
    pub vendor: u16,
    /// Device ID.
    pub device: u16,
}

/// One entry of the static driver table.
pub struct PciDriver {
    /// Driver name, for logs.
    pub name: &'static str,
    /// Devices this driver claims.
    pub ids: &'static [PciDeviceId],
    /// Capabilities to program before probing.
    pub caps: DriverCaps,
    /// Called once per matched device.
    pub probe: fn(&PciDeviceInfo) -> KResult<()>,
}

/// Finds the single driver claiming `(vendor, device)`. Zero or several
/// matches mean no binding.
pub fn lookup_driver<'d>(
    drivers: &'d [PciDriver],
    vendor: u16,
    device: u16,
) -> Option<&'d PciDriver> {
    let mut found = None;
    let mut matches = 0;
    for driver in drivers {
        if driver
            .ids
            .iter()
            .any(|id| id.vendor == vendor && id.device == device)
        {
            matches += 1;
            found = Some(driver);
        }
    }
    if matches == 1 { found } else { None }
}

#[cfg(target_os = "none")]
mod probe {
    use super::*;
    use crate::pci::cam::{self, regs};
    use crate::pci::enumerate::for_each_device;

    /// The built-in driver table.
    pub static DRIVERS: &[PciDriver] = &[crate::e1000::DRIVER];

    /// Programs the command register from a capability mask.
    fn apply_caps(info: &PciDeviceInfo, caps: DriverCaps) {
        // SAFETY: Reprogramming the command register of a device we are
        // about to hand to its driver.
        unsafe {
            let mut cmd = cam::read_u16(info.bus, info.device, 0, regs::COMMAND);
            for (cap, bit) in [
                (DriverCaps::IO, regs::COMMAND_IO_SPACE),
                (DriverCaps::MEM, regs::COMMAND_MEM_SPACE),
                (DriverCaps::DMA, regs::COMMAND_BUS_MASTER),
            ] {
                if caps.contains(cap) {
                    cmd |= bit;
                } else {
                    cmd &= !bit;
                }
            }
            // The interrupt capability is inverted on the wire.
            if caps.contains(DriverCaps::INTERRUPT) {
                cmd &= !regs::COMMAND_INTERRUPT_DISABLE;
            } else {
                cmd |= regs::COMMAND_INTERRUPT_DISABLE;
            }
            cam::write_u16(info.bus, info.device, 0, regs::COMMAND, cmd);
        }
    }

    /// Scans the bus and binds every matched driver.
    pub fn probe_all() -> KResult<()> {
        for_each_device(|info| {
            let Some(driver) = lookup_driver(DRIVERS, info.vendor_id, info.device_id) else {
                return Ok(());
            };
            tachyon_kernel::kinfo!(
                "pci: binding \"{}\" to {:02x}:{:02x}.0 [{:04x}:{:04x}]",
                driver.name,
                info.bus,
                info.device,
                info.vendor_id,
                info.device_id
            );
            apply_caps(info, driver.caps);
            (driver.probe)(info)
        })
    }
}

#[cfg(target_os = "none")]
pub use probe::{probe_all, DRIVERS};
