//! ARP for IPv4 over Ethernet.
//!
//! A fixed table maps IPv4 addresses to MAC addresses, learned from every
//! ARP packet that passes by. Requests addressed to one of our devices are
//! answered with the device's own addresses.

use tachyon_core::bytes::ByteBuf;
use tachyon_core::error::{Errno, KResult};
use tachyon_core::sync::SpinLock;

use super::addr::{Ipv4Addr, MacAddr};
use super::device::{self, DevId, PacketView};
use super::ethernet::NetProto;
use super::send_buf::SendBuf;
use super::wire::read_u16;

/// Number of table entries.
pub const ARP_TABLE_SIZE: usize = 32;

/// Hardware type: Ethernet.
const ARP_HTYPE_ETHERNET: u16 = 1;
/// Protocol type: IPv4 (matches the ethertype).
const ARP_PTYPE_IPV4: u16 = 0x0800;

const ARP_OPCODE_REQUEST: u16 = 1;
const ARP_OPCODE_REPLY: u16 = 2;

/// Header (8 bytes) plus the IPv4-over-Ethernet payload (20 bytes).
const ARP_PACKET_LEN: usize = 28;

#[derive(Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Addr,
    mac: MacAddr,
}

static TABLE: SpinLock<[Option<ArpEntry>; ARP_TABLE_SIZE]> =
    SpinLock::new([None; ARP_TABLE_SIZE]);

/// Looks up the MAC for `ip`. `None` when the address has not been seen.
pub fn lookup(ip: Ipv4Addr) -> Option<MacAddr> {
    let table = TABLE.lock();
    let mut found = None;
    for entry in table.iter().flatten() {
        if entry.ip == ip {
            // Two used entries for one address would be a table-update bug.
            assert!(found.is_none(), "duplicate ARP entries for {ip}");
            found = Some(entry.mac);
        }
    }
    found
}

/// Updates the entry for `ip`, or inserts one into a free slot. Returns
/// `true` when an existing entry was updated.
fn update_or_insert(ip: Ipv4Addr, mac: MacAddr) -> KResult<bool> {
    let mut table = TABLE.lock();

    for entry in table.iter_mut().flatten() {
        if entry.ip == ip {
            entry.mac = mac;
            return Ok(true);
        }
    }
    for slot in table.iter_mut() {
        if slot.is_none() {
            *slot = Some(ArpEntry { ip, mac });
            return Ok(false);
        }
    }
    Err(Errno::Enomem)
}

/// Seeds the table directly, bypassing packet handling. Test builds only.
#[cfg(test)]
pub(crate) fn seed_for_tests(ip: Ipv4Addr, mac: MacAddr) {
    let _ = update_or_insert(ip, mac);
}

/// Encodes one complete ARP packet into a fresh part of `sb`.
fn encode_packet(
    sb: &mut SendBuf<'_>,
    opcode: u16,
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
    dest_mac: MacAddr,
    dest_ip: Ipv4Addr,
) -> KResult<()> {
    let buf: &mut ByteBuf<'_> = sb.prepend(ARP_PACKET_LEN)?;
    buf.append(&ARP_HTYPE_ETHERNET.to_be_bytes());
    buf.append(&ARP_PTYPE_IPV4.to_be_bytes());
    buf.append(&[6, 4]); // hlen, plen
    buf.append(&opcode.to_be_bytes());
    buf.append(&src_mac.0);
    buf.append(&src_ip.0);
    buf.append(&dest_mac.0);
    buf.append(&dest_ip.0);
    debug_assert_eq!(buf.len(), ARP_PACKET_LEN);
    Ok(())
}

/// Sends an ARP packet from `dev`, using the device's own addresses as the
/// sender fields.
fn send_common(
    opcode: u16,
    dest_ip: Ipv4Addr,
    dest_mac: MacAddr,
    dev: DevId,
    mut sb: SendBuf<'_>,
) -> KResult<()> {
    let (src_mac, src_ip) = device::with_device(dev, |d| (d.mac, d.ip))?;
    encode_packet(&mut sb, opcode, src_mac, src_ip, dest_mac, dest_ip)?;

    crate::kdebug!(
        "arp: sending opcode {} for {} via {}",
        opcode,
        dest_ip,
        src_ip
    );
    // Requests go to the broadcast MAC; replies straight back.
    device::send(dest_mac, dev, NetProto::Arp, &mut sb)
}

/// Broadcasts a request for `dest_ip` out of `dev`.
pub fn send_request(dest_ip: Ipv4Addr, dev: DevId, sb: SendBuf<'_>) -> KResult<()> {
    send_common(ARP_OPCODE_REQUEST, dest_ip, MacAddr::BROADCAST, dev, sb)
}

/// Handles one received ARP packet: learns the sender's mapping and
/// answers requests directed at the receiving device.
pub fn handle_packet(pkt: &PacketView<'_>, sb: SendBuf<'_>) -> KResult<()> {
    let data = pkt.data;
    if data.len() < ARP_PACKET_LEN {
        crate::kdebug!("arp: packet shorter than IPv4-over-Ethernet layout, dropping");
        return Ok(());
    }

    let htype = read_u16(data, 0);
    let ptype = read_u16(data, 2);
    if htype != ARP_HTYPE_ETHERNET || ptype != ARP_PTYPE_IPV4 {
        crate::kdebug!("arp: unknown htype {:#x} / ptype {:#x}, dropping", htype, ptype);
        return Ok(());
    }
    let (hlen, plen) = (data[4], data[5]);
    if hlen != 6 || plen != 4 {
        crate::kwarn!(
            "arp: hlen={} plen={} unexpected for IPv4 over Ethernet, assuming 6/4",
            hlen,
            plen
        );
    }
    let opcode = read_u16(data, 6);

    let src_mac = MacAddr([data[8], data[9], data[10], data[11], data[12], data[13]]);
    let src_ip = Ipv4Addr([data[14], data[15], data[16], data[17]]);

    update_or_insert(src_ip, src_mac).inspect_err(|e| {
        crate::kwarn!("arp: table update for {} failed: {}", src_ip, e);
    })?;
    crate::kdebug!("arp: learned {} -> {}", src_ip, src_mac);

    // A request names us in the target fields; the reply swaps the sender
    // into the target slots and fills ours in as the sender.
    if opcode == ARP_OPCODE_REQUEST {
        return send_common(ARP_OPCODE_REPLY, src_ip, src_mac, pkt.dev, sb);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::tests::{captured_frame, register_capture_device};
    use tachyon_core::arena::Arena;

    fn request_packet(
        src_mac: MacAddr,
        src_ip: Ipv4Addr,
        dest_mac: MacAddr,
        dest_ip: Ipv4Addr,
    ) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&0x0800u16.to_be_bytes());
        p.extend_from_slice(&[6, 4]);
        p.extend_from_slice(&ARP_OPCODE_REQUEST.to_be_bytes());
        p.extend_from_slice(&src_mac.0);
        p.extend_from_slice(&src_ip.0);
        p.extend_from_slice(&dest_mac.0);
        p.extend_from_slice(&dest_ip.0);
        p
    }

    #[test]
    fn table_update_and_lookup() {
        let ip = Ipv4Addr::new(172, 31, 0, 2);
        let mac_a = MacAddr([2, 2, 2, 2, 2, 2]);
        let mac_b = MacAddr([3, 3, 3, 3, 3, 3]);

        assert!(lookup(ip).is_none());
        assert!(!update_or_insert(ip, mac_a).unwrap());
        assert_eq!(lookup(ip), Some(mac_a));
        // Second learn for the same address replaces the MAC.
        assert!(update_or_insert(ip, mac_b).unwrap());
        assert_eq!(lookup(ip), Some(mac_b));
    }

    #[test]
    fn request_gets_reply_and_table_entry() {
        // The scenario from the wire: peer 10.0.2.2 asks for 10.0.2.15.
        let our_mac = MacAddr([0x52, 0x54, 0x00, 0x66, 0x77, 0x88]);
        let our_ip = Ipv4Addr::new(10, 0, 2, 15);
        let peer_mac = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        let peer_ip = Ipv4Addr::new(10, 0, 2, 2);

        let (dev, cap) = register_capture_device(our_mac, our_ip);

        let packet = request_packet(peer_mac, peer_ip, MacAddr::ZERO, our_ip);
        let view = PacketView {
            src_mac: peer_mac,
            dev,
            proto: NetProto::Arp,
            data: &packet,
        };

        let mut backing = [0u8; 512];
        handle_packet(&view, SendBuf::new(Arena::new(&mut backing))).unwrap();

        // The table learned the sender.
        assert_eq!(lookup(peer_ip), Some(peer_mac));

        // And a reply frame went out: Ethernet header + ARP reply.
        let frame = captured_frame(cap);
        assert_eq!(&frame[0..6], &peer_mac.0, "frame dest");
        assert_eq!(&frame[6..12], &our_mac.0, "frame src");
        assert_eq!(&frame[12..14], &0x0806u16.to_be_bytes());

        let arp = &frame[14..];
        assert_eq!(read_u16(arp, 6), ARP_OPCODE_REPLY);
        assert_eq!(&arp[8..14], &our_mac.0, "sender mac");
        assert_eq!(&arp[14..18], &our_ip.0, "sender ip");
        assert_eq!(&arp[18..24], &peer_mac.0, "target mac");
        assert_eq!(&arp[24..28], &peer_ip.0, "target ip");
    }

    #[test]
    fn short_packet_is_dropped_quietly() {
        let our_mac = MacAddr([0x52, 0x54, 0x00, 0x66, 0x77, 0x99]);
        let (dev, _) = register_capture_device(our_mac, Ipv4Addr::new(172, 31, 1, 1));
        let view = PacketView {
            src_mac: MacAddr::ZERO,
            dev,
            proto: NetProto::Arp,
            data: &[0u8; 10],
        };
        let mut backing = [0u8; 128];
        assert!(handle_packet(&view, SendBuf::new(Arena::new(&mut backing))).is_ok());
    }

    #[test]
    fn reply_opcode_only_updates_table() {
        let our_mac = MacAddr([0x52, 0x54, 0x00, 0x66, 0x77, 0xAA]);
        let our_ip = Ipv4Addr::new(172, 31, 2, 1);
        let (dev, cap) = register_capture_device(our_mac, our_ip);

        let peer_mac = MacAddr([9, 9, 9, 9, 9, 9]);
        let peer_ip = Ipv4Addr::new(172, 31, 2, 7);
        let mut packet = request_packet(peer_mac, peer_ip, our_mac, our_ip);
        packet[6..8].copy_from_slice(&ARP_OPCODE_REPLY.to_be_bytes());

        let view = PacketView {
            src_mac: peer_mac,
            dev,
            proto: NetProto::Arp,
            data: &packet,
        };
        let mut backing = [0u8; 128];
        handle_packet(&view, SendBuf::new(Arena::new(&mut backing))).unwrap();

        assert_eq!(lookup(peer_ip), Some(peer_mac));
        // No frame was sent in response.
        assert!(captured_frame(cap).is_empty());
    }
}
