//! In-kernel network stack.
//!
//! Layering, wire to application: [`device`] owns the driver-facing device
//! table and the IRQ-fed input queue; [`ethernet`] frames link-layer
//! traffic; [`arp`], [`ipv4`], [`icmp`] and [`tcp`] implement the
//! protocols. Outbound packets are assembled header-first-by-prepending in
//! a [`send_buf::SendBuf`]; [`checksum`] holds the Internet-checksum fast
//! path shared by IPv4, ICMP and TCP.

pub mod addr;
pub mod arp;
pub mod checksum;
pub mod device;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod send_buf;
pub mod tcp;
pub mod wire;
