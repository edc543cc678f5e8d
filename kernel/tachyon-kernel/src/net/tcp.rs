//! TCP engine.
//!
//! A fixed pool of connections plus the segment handling needed to serve
//! short request/response exchanges: listen, three-way handshake with a
//! fixed initial sequence number, in-order data reception with immediate
//! ACKs, single-segment send, and an active close. There is no
//! retransmission, no reordering and no congestion control; out-of-order
//! segments are dropped and the peer's retransmissions are relied upon.
//!
//! Segment checksums are end-to-end: the IPv4 layer passes the
//! pseudo-header alongside every segment, and both directions run the
//! Internet checksum over pseudo-header plus segment.

use tachyon_core::bytes::ByteBuf;
use tachyon_core::error::{Errno, KResult};
use tachyon_core::sync::SpinLock;

use super::addr::Ipv4Addr;
use super::checksum::{finalize, iterate};
use super::ipv4::{self, IPV4_PROTOCOL_TCP};
use super::send_buf::SendBuf;
use super::wire::{read_u16, read_u32};

/// Fixed-size header this stack emits (no options).
pub const TCP_HEADER_LEN: usize = 20;

/// Header length field value for a bare header.
const TCP_DATA_OFFSET_NO_OPT: u8 = 5;

/// Initial send sequence number. Fixed by design; see the module notes.
const TCP_INITIAL_SEQ: u32 = 42;

/// Connections in the pool.
pub const TCP_MAX_CONNS: usize = 64;

/// Per-connection receive buffer capacity.
const RECV_BUF_SIZE: usize = 2048;

/// Listening endpoints.
const MAX_LISTENERS: usize = 8;

bitflags::bitflags! {
    /// TCP header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        /// No more data from the sender.
        const FIN = 1 << 0;
        /// Synchronise sequence numbers.
        const SYN = 1 << 1;
        /// Reset the connection.
        const RST = 1 << 2;
        /// Push buffered data to the application.
        const PSH = 1 << 3;
        /// The acknowledgment field is significant.
        const ACK = 1 << 4;
        /// The urgent-pointer field is significant.
        const URG = 1 << 5;
    }
}

/// The IPv4 pseudo-header included in the end-to-end checksum.
#[derive(Debug, Clone, Copy)]
pub struct PseudoHeader {
    /// Source address of the datagram.
    pub src: Ipv4Addr,
    /// Destination address of the datagram.
    pub dst: Ipv4Addr,
    /// IPv4 protocol number (always TCP here).
    pub protocol: u8,
    /// Length of the TCP segment, header plus payload.
    pub segment_len: u16,
}

impl PseudoHeader {
    /// Wire layout: src, dst, zero, protocol, length.
    pub fn to_bytes(self) -> [u8; 12] {
        let mut b = [0u8; 12];
        b[0..4].copy_from_slice(&self.src.0);
        b[4..8].copy_from_slice(&self.dst.0);
        b[9] = self.protocol;
        b[10..12].copy_from_slice(&self.segment_len.to_be_bytes());
        b
    }
}

/// A decoded TCP header.
#[derive(Debug, Clone, Copy)]
struct TcpHeader {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    /// Header length in 32-bit words.
    data_offset: u8,
    flags: TcpFlags,
    window: u16,
}

impl TcpHeader {
    fn parse(segment: &[u8]) -> Option<Self> {
        if segment.len() < TCP_HEADER_LEN {
            return None;
        }
        Some(Self {
            src_port: read_u16(segment, 0),
            dst_port: read_u16(segment, 2),
            seq: read_u32(segment, 4),
            ack: read_u32(segment, 8),
            data_offset: segment[12] >> 4,
            flags: TcpFlags::from_bits_truncate(segment[13]),
            window: read_u16(segment, 14),
        })
    }

    /// Encodes with a zeroed checksum field; the caller patches bytes
    /// 16..18 once the end-to-end sum is known.
    fn encode(&self) -> [u8; TCP_HEADER_LEN] {
        let mut b = [0u8; TCP_HEADER_LEN];
        b[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        b[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        b[4..8].copy_from_slice(&self.seq.to_be_bytes());
        b[8..12].copy_from_slice(&self.ack.to_be_bytes());
        b[12] = self.data_offset << 4;
        b[13] = self.flags.bits();
        b[14..16].copy_from_slice(&self.window.to_be_bytes());
        // Checksum (16..18) and urgent pointer (18..20) stay zero.
        b
    }
}

/// `true` when pseudo-header plus segment sum to zero.
fn checksum_ok(pseudo: PseudoHeader, segment: &[u8]) -> bool {
    let acc = iterate(iterate(0, &pseudo.to_bytes()), segment);
    finalize(acc).get() == 0
}

// ---------------------------------------------------------------------------
// Connection pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    /// SYN seen, SYN|ACK sent, waiting for the final ACK.
    SynReceived,
    /// Handshake complete; data flows.
    Established,
    /// Peer sent FIN; we still may send.
    CloseWait,
    /// Our FIN is out, waiting for its ACK.
    LastAck,
}

struct TcpConn {
    local_addr: Ipv4Addr,
    local_port: u16,
    peer_addr: Ipv4Addr,
    peer_port: u16,
    /// Next sequence number we will send.
    snd_nxt: u32,
    /// Next sequence number we expect to receive.
    rcv_nxt: u32,
    /// Peer's advertised window (kept for future use).
    peer_window: u16,
    state: TcpState,
    /// Handed out by [`accept`] already.
    accepted: bool,
    recv_len: usize,
    recv_buf: [u8; RECV_BUF_SIZE],
}

struct TcpTable {
    conns: [Option<TcpConn>; TCP_MAX_CONNS],
    listeners: [Option<(Ipv4Addr, u16)>; MAX_LISTENERS],
}

static TABLE: SpinLock<TcpTable> = SpinLock::new(TcpTable {
    conns: [const { None }; TCP_MAX_CONNS],
    listeners: [None; MAX_LISTENERS],
});

/// Handle to a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId(usize);

fn find_conn(
    table: &TcpTable,
    local_addr: Ipv4Addr,
    local_port: u16,
    peer_addr: Ipv4Addr,
    peer_port: u16,
) -> Option<usize> {
    table.conns.iter().position(|c| {
        c.as_ref().is_some_and(|c| {
            c.local_addr == local_addr
                && c.local_port == local_port
                && c.peer_addr == peer_addr
                && c.peer_port == peer_port
        })
    })
}

fn is_listening(table: &TcpTable, addr: Ipv4Addr, port: u16) -> bool {
    table
        .listeners
        .iter()
        .flatten()
        .any(|&(a, p)| a == addr && p == port)
}

// ---------------------------------------------------------------------------
// Segment transmission
// ---------------------------------------------------------------------------

/// Builds one segment with a correct end-to-end checksum and hands it to
/// IPv4.
fn send_segment(
    local_addr: Ipv4Addr,
    local_port: u16,
    peer_addr: Ipv4Addr,
    peer_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    mut sb: SendBuf<'_>,
) -> KResult<()> {
    let header = TcpHeader {
        src_port: local_port,
        dst_port: peer_port,
        seq,
        ack,
        data_offset: TCP_DATA_OFFSET_NO_OPT,
        flags,
        window,
    };
    let mut bytes = header.encode();

    let pseudo = PseudoHeader {
        src: local_addr,
        dst: peer_addr,
        protocol: IPV4_PROTOCOL_TCP,
        segment_len: (TCP_HEADER_LEN + payload.len()) as u16,
    };
    let mut acc = iterate(0, &pseudo.to_bytes());
    acc = iterate(acc, &bytes);
    acc = iterate(acc, payload);
    let sum = finalize(acc).to_bytes();
    bytes[16] = sum[0];
    bytes[17] = sum[1];

    let buf: &mut ByteBuf<'_> = sb.prepend(TCP_HEADER_LEN + payload.len())?;
    buf.append(&bytes);
    if buf.append(payload) != payload.len() {
        return Err(Errno::Enomem);
    }

    ipv4::send_packet(peer_addr, IPV4_PROTOCOL_TCP, sb)
}

// ---------------------------------------------------------------------------
// Segment reception
// ---------------------------------------------------------------------------

/// Handles one TCP segment. `pseudo` carries the addresses from the IPv4
/// header; `segment` is header plus payload.
pub fn handle_segment(pseudo: PseudoHeader, segment: &[u8], sb: SendBuf<'_>) -> KResult<()> {
    if segment.len() < TCP_HEADER_LEN {
        crate::kdebug!("tcp: segment shorter than header, dropping");
        return Ok(());
    }

    if !checksum_ok(pseudo, segment) {
        // A mismatch here means corruption the link CRC did not catch, or
        // a broken sender. Drop loudly.
        crate::kerr!("tcp: end-to-end checksum mismatch, dropping segment");
        return Ok(());
    }

    let Some(header) = TcpHeader::parse(segment) else {
        return Ok(());
    };

    if header.data_offset < TCP_DATA_OFFSET_NO_OPT {
        crate::kdebug!(
            "tcp: header length {} below minimum, dropping",
            header.data_offset
        );
        return Ok(());
    }
    let data_start = header.data_offset as usize * 4;
    if data_start > segment.len() {
        crate::kdebug!("tcp: header length beyond segment end, dropping");
        return Ok(());
    }
    if header.data_offset > TCP_DATA_OFFSET_NO_OPT {
        crate::kwarn!(
            "tcp: segment carries options (header length {}), skipping them",
            header.data_offset
        );
    }
    let payload = &segment[data_start..];

    let local_addr = pseudo.dst;
    let peer_addr = pseudo.src;
    let mut table = TABLE.lock();

    let Some(idx) = find_conn(&table, local_addr, header.dst_port, peer_addr, header.src_port)
    else {
        // New connection attempt: only a SYN to a listening endpoint gets
        // an answer.
        if header.flags.contains(TcpFlags::SYN) && is_listening(&table, local_addr, header.dst_port)
        {
            return accept_syn(&mut table, local_addr, peer_addr, &header, sb);
        }
        crate::kdebug!(
            "tcp: segment for unknown connection {}:{} -> {}:{}, dropping",
            peer_addr,
            header.src_port,
            local_addr,
            header.dst_port
        );
        return Ok(());
    };

    let conn = table.conns[idx].as_mut().unwrap();
    conn.peer_window = header.window;

    match conn.state {
        TcpState::SynReceived => {
            if header.flags.contains(TcpFlags::ACK) && header.ack == conn.snd_nxt {
                conn.state = TcpState::Established;
                crate::kdebug!(
                    "tcp: {}:{} established",
                    conn.peer_addr,
                    conn.peer_port
                );
            }
            Ok(())
        }
        TcpState::Established | TcpState::CloseWait => {
            handle_established(conn, &header, payload, sb)
        }
        TcpState::LastAck => {
            if header.flags.contains(TcpFlags::ACK) && header.ack == conn.snd_nxt {
                crate::kdebug!("tcp: {}:{} closed", conn.peer_addr, conn.peer_port);
                table.conns[idx] = None;
            }
            Ok(())
        }
    }
}

/// Creates a connection for a SYN and answers SYN|ACK.
fn accept_syn(
    table: &mut TcpTable,
    local_addr: Ipv4Addr,
    peer_addr: Ipv4Addr,
    header: &TcpHeader,
    sb: SendBuf<'_>,
) -> KResult<()> {
    let Some(slot) = table.conns.iter().position(Option::is_none) else {
        crate::kwarn!("tcp: connection pool exhausted, dropping SYN");
        return Ok(());
    };

    let rcv_nxt = header.seq.wrapping_add(1);
    table.conns[slot] = Some(TcpConn {
        local_addr,
        local_port: header.dst_port,
        peer_addr,
        peer_port: header.src_port,
        snd_nxt: TCP_INITIAL_SEQ.wrapping_add(1),
        rcv_nxt,
        peer_window: header.window,
        state: TcpState::SynReceived,
        accepted: false,
        recv_len: 0,
        recv_buf: [0; RECV_BUF_SIZE],
    });

    crate::kdebug!(
        "tcp: SYN from {}:{}, replying SYN|ACK",
        peer_addr,
        header.src_port
    );
    send_segment(
        local_addr,
        header.dst_port,
        peer_addr,
        header.src_port,
        TCP_INITIAL_SEQ,
        rcv_nxt,
        TcpFlags::SYN | TcpFlags::ACK,
        RECV_BUF_SIZE as u16,
        &[],
        sb,
    )
}

/// In-order data and FIN processing for an open connection.
fn handle_established(
    conn: &mut TcpConn,
    header: &TcpHeader,
    payload: &[u8],
    sb: SendBuf<'_>,
) -> KResult<()> {
    let mut advance = false;

    if !payload.is_empty() {
        if header.seq != conn.rcv_nxt {
            // No reordering layer: anything but the next expected segment
            // is dropped and left to the peer's retransmission.
            crate::kdebug!(
                "tcp: out-of-order segment (seq {}, expected {}), dropping",
                header.seq,
                conn.rcv_nxt
            );
            return Ok(());
        }
        let space = RECV_BUF_SIZE - conn.recv_len;
        if payload.len() > space {
            crate::kwarn!("tcp: receive buffer full, dropping segment");
            return Ok(());
        }
        conn.recv_buf[conn.recv_len..conn.recv_len + payload.len()].copy_from_slice(payload);
        conn.recv_len += payload.len();
        conn.rcv_nxt = conn.rcv_nxt.wrapping_add(payload.len() as u32);
        advance = true;
    }

    if header.flags.contains(TcpFlags::FIN) && header.seq.wrapping_add(payload.len() as u32) == conn.rcv_nxt
    {
        conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
        conn.state = TcpState::CloseWait;
        advance = true;
        crate::kdebug!("tcp: FIN from {}:{}", conn.peer_addr, conn.peer_port);
    }

    if advance {
        // Acknowledge everything consumed so far.
        return send_segment(
            conn.local_addr,
            conn.local_port,
            conn.peer_addr,
            conn.peer_port,
            conn.snd_nxt,
            conn.rcv_nxt,
            TcpFlags::ACK,
            (RECV_BUF_SIZE - conn.recv_len) as u16,
            &[],
            sb,
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Socket-style interface
// ---------------------------------------------------------------------------

/// Starts accepting connections on `addr:port`.
pub fn listen(addr: Ipv4Addr, port: u16) -> KResult<()> {
    let mut table = TABLE.lock();
    if is_listening(&table, addr, port) {
        return Ok(());
    }
    for slot in table.listeners.iter_mut() {
        if slot.is_none() {
            *slot = Some((addr, port));
            crate::kinfo!("tcp: listening on {}:{}", addr, port);
            return Ok(());
        }
    }
    Err(Errno::Enomem)
}

/// Hands out the next established-but-unclaimed connection on `addr:port`,
/// or `None`. Callers poll this between sleeps.
pub fn accept(addr: Ipv4Addr, port: u16) -> Option<ConnId> {
    let mut table = TABLE.lock();
    for (i, conn) in table.conns.iter_mut().enumerate() {
        if let Some(c) = conn {
            if c.local_addr == addr
                && c.local_port == port
                && !c.accepted
                && matches!(c.state, TcpState::Established | TcpState::CloseWait)
            {
                c.accepted = true;
                return Some(ConnId(i));
            }
        }
    }
    None
}

/// Drains buffered received data into `buf`. Returns the number of bytes
/// copied; zero means nothing has arrived yet.
pub fn recv(id: ConnId, buf: &mut ByteBuf<'_>) -> KResult<usize> {
    let mut table = TABLE.lock();
    let conn = table.conns[id.0].as_mut().ok_or(Errno::Einval)?;

    let n = conn.recv_len.min(buf.spare());
    buf.append(&conn.recv_buf[..n]);
    conn.recv_buf.copy_within(n..conn.recv_len, 0);
    conn.recv_len -= n;
    Ok(n)
}

/// Sends `data` as a single PSH|ACK segment. Returns the number of bytes
/// sent.
pub fn send(id: ConnId, data: &[u8], sb: SendBuf<'_>) -> KResult<usize> {
    let mut table = TABLE.lock();
    let conn = table.conns[id.0].as_mut().ok_or(Errno::Einval)?;
    if !matches!(conn.state, TcpState::Established | TcpState::CloseWait) {
        return Err(Errno::Einval);
    }
    if data.len() > conn.peer_window as usize {
        crate::kwarn!(
            "tcp: segment of {} bytes exceeds peer window {}",
            data.len(),
            conn.peer_window
        );
    }

    let seq = conn.snd_nxt;
    conn.snd_nxt = conn.snd_nxt.wrapping_add(data.len() as u32);
    let (la, lp, pa, pp, ack, win) = (
        conn.local_addr,
        conn.local_port,
        conn.peer_addr,
        conn.peer_port,
        conn.rcv_nxt,
        (RECV_BUF_SIZE - conn.recv_len) as u16,
    );
    drop(table);

    send_segment(
        la,
        lp,
        pa,
        pp,
        seq,
        ack,
        TcpFlags::PSH | TcpFlags::ACK,
        win,
        data,
        sb,
    )?;
    Ok(data.len())
}

/// Starts an active close: sends FIN|ACK and waits (in the state machine)
/// for the peer's ACK, which releases the connection back to the pool.
pub fn close(id: ConnId, sb: SendBuf<'_>) -> KResult<()> {
    let mut table = TABLE.lock();
    let conn = table.conns[id.0].as_mut().ok_or(Errno::Einval)?;

    let seq = conn.snd_nxt;
    conn.snd_nxt = conn.snd_nxt.wrapping_add(1); // the FIN occupies one
    conn.state = TcpState::LastAck;
    let (la, lp, pa, pp, ack) = (
        conn.local_addr,
        conn.local_port,
        conn.peer_addr,
        conn.peer_port,
        conn.rcv_nxt,
    );
    drop(table);

    send_segment(
        la,
        lp,
        pa,
        pp,
        seq,
        ack,
        TcpFlags::FIN | TcpFlags::ACK,
        0,
        &[],
        sb,
    )
}

/// Number of pooled connections currently in use.
pub fn conn_count() -> usize {
    let table = TABLE.lock();
    table.conns.iter().flatten().count()
}
