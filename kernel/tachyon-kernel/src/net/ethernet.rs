//! Ethernet II framing.

use tachyon_core::bytes::ByteBuf;

use super::addr::MacAddr;
use super::wire::read_u16;

/// Length of the Ethernet II frame header.
pub const ETH_HEADER_LEN: usize = 14;

/// Ethertype for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// Ethertype for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Link-layer-independent protocol identifiers.
///
/// Protocol numbers from specific link layers (the Ethernet ethertype) are
/// translated into these at the device boundary. The discriminants are
/// arbitrary but recognisable, which helps when they show up in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NetProto {
    /// Address resolution.
    Arp = 0xAA,
    /// IPv4.
    Ipv4 = 0x04,
}

impl NetProto {
    /// The Ethernet ethertype carrying this protocol.
    pub fn to_ethertype(self) -> u16 {
        match self {
            Self::Arp => ETHERTYPE_ARP,
            Self::Ipv4 => ETHERTYPE_IPV4,
        }
    }

    /// Decodes an ethertype; `None` for protocols this stack does not
    /// speak.
    pub fn from_ethertype(ethertype: u16) -> Option<Self> {
        match ethertype {
            ETHERTYPE_ARP => Some(Self::Arp),
            ETHERTYPE_IPV4 => Some(Self::Ipv4),
            _ => None,
        }
    }
}

/// A decoded Ethernet II header.
#[derive(Debug, Clone, Copy)]
pub struct EthernetHeader {
    /// Destination hardware address.
    pub dest: MacAddr,
    /// Source hardware address.
    pub src: MacAddr,
    /// Raw ethertype.
    pub ethertype: u16,
}

impl EthernetHeader {
    /// Parses the first [`ETH_HEADER_LEN`] bytes of `frame`.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < ETH_HEADER_LEN {
            return None;
        }
        let mut dest = [0u8; 6];
        let mut src = [0u8; 6];
        dest.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        Some(Self {
            dest: MacAddr(dest),
            src: MacAddr(src),
            ethertype: read_u16(frame, 12),
        })
    }

    /// Appends the header to `buf` in wire order.
    pub fn encode(&self, buf: &mut ByteBuf<'_>) {
        buf.append(&self.dest.0);
        buf.append(&self.src.0);
        buf.append(&self.ethertype.to_be_bytes());
    }
}
