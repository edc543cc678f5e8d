//! Network device table and input queue.
//!
//! Drivers register a [`NetDevice`] carrying their MAC, MTU and send
//! function; the stack addresses devices through opaque [`DevId`] handles.
//! Inbound frames arrive from IRQ context through [`intr_receive`], which
//! decodes the link header and copies the payload into a slot of a bounded
//! queue — the IRQ path allocates nothing and takes only the queue's own
//! interrupt-safe lock. A cooperative task drains the queue with
//! [`get_input`]; dropping the returned guard releases the slot.

use tachyon_core::error::{Errno, KResult};
use tachyon_core::sync::{IrqSpinLock, SpinLock};

use super::addr::{Ipv4Addr, MacAddr};
use super::ethernet::{EthernetHeader, NetProto, ETH_HEADER_LEN};
use super::send_buf::SendBuf;
use crate::config::{INPUT_QUEUE_DEPTH, INPUT_SLOT_SIZE};

/// Link-layer type of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II.
    Ethernet,
}

/// Driver entry point for transmitting one assembled frame.
pub type SendFrameFn = fn(&NetDevice, &SendBuf<'_>) -> KResult<()>;

/// A registered network device.
pub struct NetDevice {
    /// Hardware address; unique per device.
    pub mac: MacAddr,
    /// Protocol address; assigned from the runtime config after probing.
    pub ip: Ipv4Addr,
    /// Link-layer framing the device speaks.
    pub link_type: LinkType,
    /// Maximum payload the driver accepts in one send.
    pub mtu: usize,
    /// Transmit entry point.
    pub send_frame: SendFrameFn,
    /// Driver-private state, opaque to the stack.
    pub private: *mut (),
}

// SAFETY: The private pointer is owned by the driver, which serialises its
// own state; the table lock serialises everything else.
unsafe impl Send for NetDevice {}

/// Opaque handle to a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevId(usize);

const DEVICE_TABLE_SIZE: usize = 16;

static DEVICES: SpinLock<[Option<NetDevice>; DEVICE_TABLE_SIZE]> =
    SpinLock::new([const { None }; DEVICE_TABLE_SIZE]);

/// Registers a device. Fails with `EEXIST` when the MAC is already present
/// and `ENOMEM` when the table is full.
pub fn register(dev: NetDevice) -> KResult<DevId> {
    let mut table = DEVICES.lock();

    if table
        .iter()
        .flatten()
        .any(|existing| existing.mac == dev.mac)
    {
        return Err(Errno::Eexist);
    }

    for (i, slot) in table.iter_mut().enumerate() {
        if slot.is_none() {
            crate::kinfo!("netdev: registered device {} ({})", i, dev.mac);
            *slot = Some(dev);
            return Ok(DevId(i));
        }
    }
    Err(Errno::Enomem)
}

/// Runs `f` with the device behind `id`.
pub fn with_device<R>(id: DevId, f: impl FnOnce(&NetDevice) -> R) -> KResult<R> {
    let table = DEVICES.lock();
    table[id.0].as_ref().map(f).ok_or(Errno::Enodev)
}

/// Finds the device with the given protocol address.
pub fn lookup_ip(ip: Ipv4Addr) -> Option<DevId> {
    let table = DEVICES.lock();
    let mut found = None;
    for (i, dev) in table.iter().enumerate() {
        if let Some(dev) = dev {
            if dev.ip == ip {
                assert!(found.is_none(), "two devices share address {ip}");
                found = Some(DevId(i));
            }
        }
    }
    found
}

/// Finds the device with the given hardware address.
pub fn lookup_mac(mac: MacAddr) -> Option<DevId> {
    let table = DEVICES.lock();
    table
        .iter()
        .position(|d| d.as_ref().is_some_and(|d| d.mac == mac))
        .map(DevId)
}

/// The first registered device, if any.
pub fn first_device() -> Option<DevId> {
    let table = DEVICES.lock();
    table.iter().position(Option::is_some).map(DevId)
}

/// Assigns a protocol address to a device.
pub fn set_ip(id: DevId, ip: Ipv4Addr) -> KResult<()> {
    let mut table = DEVICES.lock();
    let dev = table[id.0].as_mut().ok_or(Errno::Enodev)?;
    dev.ip = ip;
    Ok(())
}

/// Sends `sb` to `dest_mac` over device `id`, framing it for `proto`.
///
/// The link header is prepended here; the driver sees the fully assembled
/// packet.
pub fn send(dest_mac: MacAddr, id: DevId, proto: NetProto, sb: &mut SendBuf<'_>) -> KResult<()> {
    let table = DEVICES.lock();
    let dev = table[id.0].as_ref().ok_or(Errno::Enodev)?;

    let header = EthernetHeader {
        dest: dest_mac,
        src: dev.mac,
        ethertype: proto.to_ethertype(),
    };
    let buf = sb.prepend(ETH_HEADER_LEN)?;
    header.encode(buf);

    (dev.send_frame)(dev, sb)
}

// ---------------------------------------------------------------------------
// Input queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Filled by the IRQ path, waiting for the receive task.
    Ready,
    /// Handed out through an [`InputGuard`].
    InUse,
}

struct InputSlot {
    state: SlotState,
    src_mac: MacAddr,
    dev: DevId,
    proto: NetProto,
    len: usize,
    data: [u8; INPUT_SLOT_SIZE],
}

struct InputQueue {
    slots: [InputSlot; INPUT_QUEUE_DEPTH],
    /// Next slot to hand to the receive task.
    head: usize,
    /// Next slot the IRQ path fills.
    tail: usize,
    /// Slots in Ready or InUse state.
    count: usize,
    /// Packets dropped because the queue was full.
    dropped: u64,
}

const EMPTY_SLOT: InputSlot = InputSlot {
    state: SlotState::Free,
    src_mac: MacAddr::ZERO,
    dev: DevId(0),
    proto: NetProto::Arp,
    len: 0,
    data: [0; INPUT_SLOT_SIZE],
};

static INPUT: IrqSpinLock<InputQueue> = IrqSpinLock::new(InputQueue {
    slots: [EMPTY_SLOT; INPUT_QUEUE_DEPTH],
    head: 0,
    tail: 0,
    count: 0,
    dropped: 0,
});

/// Accepts one received frame from a driver. Safe to call from IRQ
/// context: the payload is copied into a preallocated slot and nothing is
/// allocated. A full queue or an undecodable frame drops the packet.
pub fn intr_receive(dev: DevId, frame: &[u8]) {
    let Some(header) = EthernetHeader::parse(frame) else {
        return;
    };
    let Some(proto) = NetProto::from_ethertype(header.ethertype) else {
        return;
    };
    let payload = &frame[ETH_HEADER_LEN..];
    if payload.len() > INPUT_SLOT_SIZE {
        return;
    }

    let mut queue = INPUT.lock();
    if queue.count == INPUT_QUEUE_DEPTH {
        // Overflow policy: the newest packet loses.
        queue.dropped += 1;
        return;
    }
    let tail = queue.tail;
    let slot = &mut queue.slots[tail];
    debug_assert_eq!(slot.state, SlotState::Free);
    slot.state = SlotState::Ready;
    slot.src_mac = header.src;
    slot.dev = dev;
    slot.proto = proto;
    slot.len = payload.len();
    slot.data[..payload.len()].copy_from_slice(payload);

    queue.tail = (tail + 1) % INPUT_QUEUE_DEPTH;
    queue.count += 1;
}

/// A borrowed view of one received packet, as handed to the protocol
/// handlers.
#[derive(Clone, Copy)]
pub struct PacketView<'p> {
    /// Sender's hardware address.
    pub src_mac: MacAddr,
    /// Device the packet arrived on.
    pub dev: DevId,
    /// Link-independent protocol of the payload.
    pub proto: NetProto,
    /// Payload bytes (link header already stripped).
    pub data: &'p [u8],
}

/// A packet checked out of the input queue. The slot is returned (and
/// becomes reusable by the IRQ path) when the guard drops.
pub struct InputGuard {
    idx: usize,
    src_mac: MacAddr,
    dev: DevId,
    proto: NetProto,
    data: *const u8,
    len: usize,
    _not_send: core::marker::PhantomData<*mut ()>,
}

impl InputGuard {
    /// Sender's hardware address.
    pub fn src_mac(&self) -> MacAddr {
        self.src_mac
    }

    /// Device the packet arrived on.
    pub fn dev(&self) -> DevId {
        self.dev
    }

    /// Link-independent protocol of the payload.
    pub fn proto(&self) -> NetProto {
        self.proto
    }

    /// The payload bytes.
    pub fn data(&self) -> &[u8] {
        // SAFETY: The slot is in `InUse` state, which the IRQ producer
        // never touches, so the bytes are stable for the guard's lifetime.
        unsafe { core::slice::from_raw_parts(self.data, self.len) }
    }

    /// The borrowed view handed to protocol handlers.
    pub fn view(&self) -> PacketView<'_> {
        PacketView {
            src_mac: self.src_mac,
            dev: self.dev,
            proto: self.proto,
            data: self.data(),
        }
    }
}

impl Drop for InputGuard {
    fn drop(&mut self) {
        let mut queue = INPUT.lock();
        let slot = &mut queue.slots[self.idx];
        debug_assert_eq!(slot.state, SlotState::InUse);
        slot.state = SlotState::Free;
        queue.count -= 1;
    }
}

/// Checks the oldest pending packet out of the queue, FIFO. Returns `None`
/// when nothing is pending.
pub fn get_input() -> Option<InputGuard> {
    let mut queue = INPUT.lock();
    let head = queue.head;
    let slot = &mut queue.slots[head];
    if slot.state != SlotState::Ready {
        return None;
    }
    slot.state = SlotState::InUse;
    let guard = InputGuard {
        idx: head,
        src_mac: slot.src_mac,
        dev: slot.dev,
        proto: slot.proto,
        data: slot.data.as_ptr(),
        len: slot.len,
        _not_send: core::marker::PhantomData,
    };
    queue.head = (head + 1) % INPUT_QUEUE_DEPTH;
    Some(guard)
}

/// Packets dropped on queue overflow since boot.
pub fn dropped_packets() -> u64 {
    INPUT.lock().dropped
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tachyon_core::arena::Arena;
    use tachyon_core::sync::SpinLock;

    fn discard_send(_dev: &NetDevice, _sb: &SendBuf<'_>) -> KResult<()> {
        Ok(())
    }

    /// Frames captured by the mock driver, keyed by capture-slot index
    /// smuggled through the device's private pointer.
    static CAPTURED: SpinLock<Vec<Vec<u8>>> = SpinLock::new(Vec::new());

    fn capture_send(dev: &NetDevice, sb: &SendBuf<'_>) -> KResult<()> {
        let mut backing = [0u8; 2048];
        let mut buf = tachyon_core::bytes::ByteBuf::new(&mut backing);
        sb.assemble(&mut buf)?;
        let idx = dev.private as usize;
        let mut captured = CAPTURED.lock();
        while captured.len() <= idx {
            captured.push(Vec::new());
        }
        captured[idx] = buf.as_slice().to_vec();
        Ok(())
    }

    /// Registers a capture device and returns `(id, capture index)`.
    pub(crate) fn register_capture_device(mac: MacAddr, ip: Ipv4Addr) -> (DevId, usize) {
        let idx = {
            let mut captured = CAPTURED.lock();
            captured.push(Vec::new());
            captured.len() - 1
        };
        let id = register(NetDevice {
            mac,
            ip,
            link_type: LinkType::Ethernet,
            mtu: 1500,
            send_frame: capture_send,
            private: idx as *mut (),
        })
        .unwrap();
        (id, idx)
    }

    /// Returns the last frame captured for the given capture index.
    pub(crate) fn captured_frame(idx: usize) -> Vec<u8> {
        CAPTURED.lock()[idx].clone()
    }

    fn eth_frame(dest: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dest);
        f.extend_from_slice(&src);
        f.extend_from_slice(&ethertype.to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn register_rejects_duplicate_mac() {
        let mac = MacAddr([0xDE, 0xAD, 0x01, 0x02, 0x03, 0x04]);
        let dev = |ip| NetDevice {
            mac,
            ip,
            link_type: LinkType::Ethernet,
            mtu: 1500,
            send_frame: discard_send,
            private: core::ptr::null_mut(),
        };
        let id = register(dev(Ipv4Addr::new(172, 30, 0, 1))).unwrap();
        assert_eq!(register(dev(Ipv4Addr::new(172, 30, 0, 2))), Err(Errno::Eexist));
        assert_eq!(lookup_mac(mac), Some(id));
    }

    #[test]
    fn lookup_by_ip() {
        let mac = MacAddr([0xDE, 0xAD, 0x05, 0x06, 0x07, 0x08]);
        let ip = Ipv4Addr::new(172, 30, 1, 1);
        let id = register(NetDevice {
            mac,
            ip,
            link_type: LinkType::Ethernet,
            mtu: 1500,
            send_frame: discard_send,
            private: core::ptr::null_mut(),
        })
        .unwrap();
        assert_eq!(lookup_ip(ip), Some(id));
        assert_eq!(lookup_ip(Ipv4Addr::new(172, 30, 1, 99)), None);
    }

    #[test]
    fn send_prepends_link_header() {
        let mac = MacAddr([0xDE, 0xAD, 0x09, 0x0A, 0x0B, 0x0C]);
        let (id, cap) = register_capture_device(mac, Ipv4Addr::new(172, 30, 2, 1));

        let mut backing = [0u8; 512];
        let mut sb = SendBuf::new(Arena::new(&mut backing));
        sb.prepend(5).unwrap().append(b"hello");

        let dest = MacAddr([1, 2, 3, 4, 5, 6]);
        send(dest, id, NetProto::Ipv4, &mut sb).unwrap();

        let frame = captured_frame(cap);
        assert_eq!(&frame[0..6], &dest.0);
        assert_eq!(&frame[6..12], &mac.0);
        assert_eq!(&frame[12..14], &0x0800u16.to_be_bytes());
        assert_eq!(&frame[14..], b"hello");
    }

    /// Serialises the tests that touch the global input queue.
    static QUEUE_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    /// Serialises tests across the net modules that reconfigure the global
    /// routing table.
    pub(crate) static ROUTE_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    /// Acquires `lock` even if a previous holder panicked.
    pub(crate) fn hold(lock: &'static std::sync::Mutex<()>) -> std::sync::MutexGuard<'static, ()> {
        lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn input_queue_fifo_and_release() {
        let _serial = hold(&QUEUE_TEST_LOCK);
        let mac = MacAddr([0xDE, 0xAD, 0x0D, 0x0E, 0x0F, 0x10]);
        let (id, _) = register_capture_device(mac, Ipv4Addr::new(172, 30, 3, 1));
        let src = [0x52, 0x54, 0, 0, 0, 1];

        // The queue is global; drain whatever is pending first.
        while get_input().is_some() {}

        intr_receive(id, &eth_frame(mac.0, src, 0x0806, b"first"));
        intr_receive(id, &eth_frame(mac.0, src, 0x0800, b"second"));

        let a = get_input().unwrap();
        assert_eq!(a.proto(), NetProto::Arp);
        assert_eq!(a.data(), b"first");
        assert_eq!(a.src_mac(), MacAddr(src));
        assert_eq!(a.dev(), id);
        drop(a);

        let b = get_input().unwrap();
        assert_eq!(b.proto(), NetProto::Ipv4);
        assert_eq!(b.data(), b"second");
        drop(b);

        assert!(get_input().is_none());
    }

    #[test]
    fn unknown_ethertype_is_dropped() {
        let _serial = hold(&QUEUE_TEST_LOCK);
        let mac = MacAddr([0xDE, 0xAD, 0x11, 0x12, 0x13, 0x14]);
        let (id, _) = register_capture_device(mac, Ipv4Addr::new(172, 30, 4, 1));
        while get_input().is_some() {}
        intr_receive(id, &eth_frame(mac.0, [1; 6], 0x86DD, b"ipv6"));
        assert!(get_input().is_none());
    }
}
