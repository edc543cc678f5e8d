//! PCI bus support.
//!
//! [`cam`] wraps the legacy configuration-access ports, [`enumerate`]
//! walks the bus and decodes BARs, and [`registry`] holds the static
//! driver table plus the probe loop that binds drivers to discovered
//! devices.

pub mod enumerate;
pub mod registry;

#[cfg(target_os = "none")]
pub mod cam;

pub use enumerate::{PciBar, PciDeviceInfo};
pub use registry::{DriverCaps, PciDeviceId, PciDriver};

#[cfg(target_os = "none")]
pub use registry::probe_all;
