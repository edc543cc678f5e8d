//! Intel 82540EM (e1000) Ethernet driver.
//!
//! Legacy 16-byte descriptors, one permanently bound buffer per
//! descriptor, interrupt-driven receive. The receive IRQ drains the ring
//! into the netdev input queue; transmit assembles the caller's send
//! buffer into the tail descriptor's buffer and bumps the tail register.
//! All DMA addresses go through the paging registry — the driver never
//! casts a virtual pointer to a bus address itself.

pub mod regs;

use core::ptr::{self, NonNull};

use tachyon_core::addr::{PhysAddr, VirtAddr};
use tachyon_core::bytes::ByteBuf;
use tachyon_core::error::{Errno, KResult};
use tachyon_core::sync::{IrqSpinLock, SpinLock};

use tachyon_kernel::arch::x86_64::trap::{register_handler, TrapFrame};
use tachyon_kernel::arch::x86_64::pic;
use tachyon_kernel::mm::registry::{AddrMapping, MappingKind, MemoryType};
use tachyon_kernel::mm::paging::PteFlags;
use tachyon_kernel::mm::{kvalloc, paging};
use tachyon_kernel::net::addr::{Ipv4Addr, MacAddr};
use tachyon_kernel::net::device::{self, DevId, LinkType, NetDevice};
use tachyon_kernel::net::send_buf::SendBuf;

use crate::pci::{DriverCaps, PciBar, PciDeviceId, PciDeviceInfo, PciDriver};

use regs::E1000Regs;

/// Intel vendor ID.
const VENDOR_INTEL: u16 = 0x8086;
/// 82540EM device ID (QEMU's default e1000).
const DEVICE_82540EM: u16 = 0x100E;

/// Transmit ring length.
const TX_RING_LEN: usize = 32;
/// Receive ring length.
const RX_RING_LEN: usize = 128;
/// Bytes per transmit buffer.
const TX_BUF_SIZE: usize = 16288;
/// Bytes per receive buffer (RCTL BSIZE default).
const RX_BUF_SIZE: usize = 2048;

// Descriptor command/status bits.
const TXD_CMD_EOP: u8 = 1 << 0;
const TXD_CMD_RS: u8 = 1 << 3;
const TXD_STAT_DD: u8 = 1 << 0;
const RXD_STAT_DD: u8 = 1 << 0;
const RXD_STAT_EOP: u8 = 1 << 1;

/// Legacy transmit descriptor.
#[repr(C)]
struct TxDesc {
    base_addr: u64,
    length: u16,
    cso: u8,
    /// Bit 5 (DEXT) must stay clear to keep the legacy format.
    cmd: u8,
    status: u8,
    css: u8,
    special: u16,
}

/// Legacy receive descriptor.
#[repr(C)]
struct RxDesc {
    base_addr: u64,
    length: u16,
    checksum: u16,
    status: u8,
    errors: u8,
    special: u16,
}

const _: () = assert!(core::mem::size_of::<TxDesc>() == 16);
const _: () = assert!(core::mem::size_of::<RxDesc>() == 16);

/// Receive-side counters, updated from IRQ context.
#[derive(Default)]
struct RxStats {
    packets: u64,
    interrupts: u64,
    rxo: u64,
    rxdmt0: u64,
    rxt0: u64,
}

struct TxState {
    ring: *mut TxDesc,
    bufs: *mut u8,
    tail: usize,
    packets: u64,
}

// SAFETY: Ring memory is driver-owned; the enclosing lock serialises.
unsafe impl Send for TxState {}

struct RxState {
    ring: *mut RxDesc,
    bufs: *mut u8,
    tail: usize,
    stats: RxStats,
}

// SAFETY: As for TxState.
unsafe impl Send for RxState {}

/// Per-controller driver state, allocated once at probe time and never
/// freed (device teardown is not implemented).
struct E1000Device {
    regs: E1000Regs,
    mac: MacAddr,
    /// Netdev handle, filled in after registration.
    dev_id: Option<DevId>,
    tx: SpinLock<TxState>,
    rx: IrqSpinLock<RxState>,
}

// ---------------------------------------------------------------------------
// EEPROM
// ---------------------------------------------------------------------------

/// Detects which EERD layout the controller speaks: issue a read with only
/// the start bit and watch which done bit answers. (82544GC/EI and 82541xx
/// report completion in bit 1 instead of bit 4.)
fn eeprom_detect_access(regs: &E1000Regs) -> bool {
    regs.write(regs::EERD, regs::EERD_START);
    for _ in 0..999 {
        if regs.read(regs::EERD) & regs::EERD_DONE != 0 {
            return true;
        }
    }
    false
}

/// Reads one 16-bit EEPROM word.
fn eeprom_read16(regs: &E1000Regs, normal_access: bool, addr: u8) -> KResult<u16> {
    if regs.read(regs::EECD) & regs::EECD_PRESENT == 0 {
        tachyon_kernel::kerr!("e1000: EEPROM not present");
        return Err(Errno::Eio);
    }

    let (start, done) = if normal_access {
        ((u32::from(addr) << 8) | regs::EERD_START, regs::EERD_DONE)
    } else {
        ((u32::from(addr) << 2) | regs::EERD_START, regs::EERD_DONE_ALT)
    };
    regs.write(regs::EERD, start);
    let mut data = regs.read(regs::EERD);
    while data & done == 0 {
        core::hint::spin_loop();
        data = regs.read(regs::EERD);
    }
    // Clear the start bit so the next read begins cleanly.
    regs.update(regs::EERD, |v| v & !regs::EERD_START);

    Ok((data >> 16) as u16)
}

/// MAC address from EEPROM words 0..2.
fn read_mac(regs: &E1000Regs, normal_access: bool) -> KResult<MacAddr> {
    let w0 = eeprom_read16(regs, normal_access, 0)?;
    let w1 = eeprom_read16(regs, normal_access, 1)?;
    let w2 = eeprom_read16(regs, normal_access, 2)?;
    Ok(MacAddr([
        w0 as u8,
        (w0 >> 8) as u8,
        w1 as u8,
        (w1 >> 8) as u8,
        w2 as u8,
        (w2 >> 8) as u8,
    ]))
}

// ---------------------------------------------------------------------------
// DMA helpers
// ---------------------------------------------------------------------------

/// Allocates zeroed kvalloc memory and returns it with its bus address.
fn dma_alloc(len: usize) -> KResult<(NonNull<u8>, PhysAddr)> {
    let mem = kvalloc::alloc(len, 64).ok_or(Errno::Enomem)?;
    // SAFETY: Fresh allocation of `len` bytes.
    unsafe { ptr::write_bytes(mem.as_ptr(), 0, len) };
    let phys = paging::virt_to_phys(VirtAddr::new(mem.as_ptr() as u64))?;
    Ok((mem, phys))
}

// ---------------------------------------------------------------------------
// Initialisation
// ---------------------------------------------------------------------------

/// Maps BAR0 as a device-owned MMIO window.
fn map_mmio(base: u64, len: u64) -> KResult<E1000Regs> {
    paging::map_region(AddrMapping {
        vbase: VirtAddr::new(base),
        pbase: PhysAddr::new(base),
        len,
        kind: MappingKind::Alias,
        mem_type: MemoryType::StrongUncacheable,
        perms: PteFlags::WRITABLE,
    })?;
    // SAFETY: Just mapped, identity-style, strong-uncacheable.
    Ok(unsafe { E1000Regs::new(VirtAddr::new(base)) })
}

/// General configuration: clear link reset, loopback and PHY reset.
fn init_ctrl(regs: &E1000Regs) {
    regs.update(regs::CTRL, |ctrl| {
        ctrl & !(regs::CTRL_LRST | regs::CTRL_ILOS | regs::CTRL_PHY_RST)
    });
}

/// Builds the transmit ring: every descriptor permanently points at its
/// buffer and starts out "done" so the send path sees it as free.
fn init_tx(regs: &E1000Regs) -> KResult<TxState> {
    let ring_bytes = TX_RING_LEN * core::mem::size_of::<TxDesc>();
    let (ring_mem, ring_phys) = dma_alloc(ring_bytes)?;
    let (bufs_mem, bufs_phys) = dma_alloc(TX_RING_LEN * TX_BUF_SIZE)?;

    let ring = ring_mem.as_ptr() as *mut TxDesc;
    for i in 0..TX_RING_LEN {
        // SAFETY: `i` is within the freshly allocated ring.
        unsafe {
            (*ring.add(i)).base_addr = bufs_phys.as_u64() + (i * TX_BUF_SIZE) as u64;
            (*ring.add(i)).status = TXD_STAT_DD;
        }
    }

    assert!(ring_phys.is_aligned(16));
    regs.write(regs::TDBAL, ring_phys.as_u64() as u32);
    regs.write(regs::TDBAH, (ring_phys.as_u64() >> 32) as u32);
    regs.write(regs::TDLEN, ring_bytes as u32);
    regs.write(regs::TDH, 0);
    regs.write(regs::TDT, 0);

    // Enable, pad short packets, recommended collision settings for
    // full duplex.
    regs.update(regs::TCTL, |tctl| {
        tctl | regs::TCTL_EN
            | regs::TCTL_PSP
            | (0xF << regs::TCTL_CT_SHIFT)
            | (0x40 << regs::TCTL_COLD_SHIFT)
    });
    // IEEE 802.3 inter-packet gap values.
    regs.write(regs::TIPG, 10 | (8 << 10) | (6 << 20));

    Ok(TxState {
        ring,
        bufs: bufs_mem.as_ptr(),
        tail: 0,
        packets: 0,
    })
}

/// Builds the receive ring and enables the receiver.
fn init_rx(regs: &E1000Regs, mac: MacAddr) -> KResult<RxState> {
    let ring_bytes = RX_RING_LEN * core::mem::size_of::<RxDesc>();
    let (ring_mem, ring_phys) = dma_alloc(ring_bytes)?;
    let (bufs_mem, bufs_phys) = dma_alloc(RX_RING_LEN * RX_BUF_SIZE)?;

    let ring = ring_mem.as_ptr() as *mut RxDesc;
    for i in 0..RX_RING_LEN {
        // SAFETY: `i` is within the freshly allocated ring.
        unsafe {
            (*ring.add(i)).base_addr = bufs_phys.as_u64() + (i * RX_BUF_SIZE) as u64;
        }
    }

    assert!(ring_phys.is_aligned(16));
    regs.write(regs::RDBAL, ring_phys.as_u64() as u32);
    regs.write(regs::RDBAH, (ring_phys.as_u64() >> 32) as u32);
    regs.write(regs::RDLEN, ring_bytes as u32);
    // Head and tail must differ; software consumes one descriptor past
    // the tail.
    regs.write(regs::RDH, 1);
    regs.write(regs::RDT, 0);

    // Accept frames for our own station address.
    regs.write(
        regs::RAL0,
        u32::from_le_bytes([mac.0[0], mac.0[1], mac.0[2], mac.0[3]]),
    );
    regs.write(
        regs::RAH0,
        regs::RAH_AV | u32::from(mac.0[4]) | (u32::from(mac.0[5]) << 8),
    );

    // Buffer size stays at the 2048-byte default; long packets stay off.
    regs.update(regs::RCTL, |rctl| {
        rctl | regs::RCTL_EN | regs::RCTL_UPE | regs::RCTL_MPE | regs::RCTL_BAM
    });

    Ok(RxState {
        ring,
        bufs: bufs_mem.as_ptr(),
        tail: 0,
        stats: RxStats::default(),
    })
}

/// Unmasks the receive interrupt causes and sets the throttle.
fn init_interrupts(regs: &E1000Regs) {
    regs.write(
        regs::IMS,
        regs::INT_RXDMT0 | regs::INT_RXO | regs::INT_RXT0,
    );
    // Throttle to one interrupt per ~128 µs.
    regs.write(regs::ITR, 500);
    // Clear whatever was pending.
    let _ = regs.read(regs::ICR);
}

fn set_link_up(regs: &E1000Regs) {
    regs.update(regs::CTRL, |ctrl| ctrl | regs::CTRL_SLU);
}

// ---------------------------------------------------------------------------
// Receive and transmit
// ---------------------------------------------------------------------------

/// Pulls one frame out of the ring. `EAGAIN` means the ring is drained;
/// `EIO` reports a receive error (the descriptor is recycled either way
/// by the caller advancing past it).
fn rx_poll(rx: &mut RxState, mut deliver: impl FnMut(&[u8])) -> KResult<()> {
    // The descriptor one past the tail is the oldest the hardware may
    // have filled (head and tail cannot start out equal).
    let next = (rx.tail + 1) % RX_RING_LEN;
    // SAFETY: `next` is in bounds; the ring is live DMA memory, so status
    // must be read volatile.
    let status = unsafe { ptr::addr_of!((*rx.ring.add(next)).status).read_volatile() };
    if status & RXD_STAT_DD == 0 {
        return Err(Errno::Eagain);
    }
    // Long frames are disabled, so every frame fits one buffer.
    assert!(status & RXD_STAT_EOP != 0);

    // SAFETY: As above; the error byte is valid once DD|EOP are set.
    let errors = unsafe { ptr::addr_of!((*rx.ring.add(next)).errors).read_volatile() };
    let result = if errors != 0 {
        Err(Errno::Eio)
    } else {
        // SAFETY: Length is hardware-reported and capped by the buffer
        // size; the buffer belongs to this descriptor.
        let len = unsafe { ptr::addr_of!((*rx.ring.add(next)).length).read_volatile() } as usize;
        assert!(len <= RX_BUF_SIZE);
        // SAFETY: As above.
        let frame =
            unsafe { core::slice::from_raw_parts(rx.bufs.add(next * RX_BUF_SIZE), len) };
        deliver(frame);
        rx.stats.packets += 1;
        Ok(())
    };

    // Hand the descriptor back: same buffer, cleared status.
    // SAFETY: `next` is in bounds.
    unsafe {
        ptr::addr_of_mut!((*rx.ring.add(next)).length).write_volatile(0);
        ptr::addr_of_mut!((*rx.ring.add(next)).status).write_volatile(0);
    }
    rx.tail = next;
    result
}

/// The netdev transmit entry point.
fn send_frame(dev: &NetDevice, sb: &SendBuf<'_>) -> KResult<()> {
    // SAFETY: `private` is the E1000Device installed at probe time and is
    // never freed.
    let e1000 = unsafe { &*(dev.private as *const E1000Device) };
    debug_assert_eq!(dev.mac, e1000.mac);
    let len = sb.total_len();
    if len > TX_BUF_SIZE {
        return Err(Errno::Einval);
    }

    let mut tx = e1000.tx.lock();
    let tail = tx.tail;
    // A free descriptor carries the DD bit from its last completion (or
    // from ring setup).
    // SAFETY: `tail` is in bounds; the ring is live DMA memory.
    let status = unsafe { ptr::addr_of!((*tx.ring.add(tail)).status).read_volatile() };
    if status & TXD_STAT_DD == 0 {
        tachyon_kernel::kdebug!("e1000: transmit ring full after {} packets", tx.packets);
        return Err(Errno::Enobufs);
    }

    // SAFETY: The tail buffer belongs to the tail descriptor and the
    // hardware is done with it (DD above).
    let buf_slice =
        unsafe { core::slice::from_raw_parts_mut(tx.bufs.add(tail * TX_BUF_SIZE), TX_BUF_SIZE) };
    let mut buf = ByteBuf::new(buf_slice);
    sb.assemble(&mut buf)?;

    // SAFETY: `tail` is in bounds.
    unsafe {
        ptr::addr_of_mut!((*tx.ring.add(tail)).length).write_volatile(len as u16);
        ptr::addr_of_mut!((*tx.ring.add(tail)).status).write_volatile(0);
        let cmd = ptr::addr_of!((*tx.ring.add(tail)).cmd).read_volatile();
        ptr::addr_of_mut!((*tx.ring.add(tail)).cmd).write_volatile(cmd | TXD_CMD_EOP | TXD_CMD_RS);
    }

    tx.tail = (tail + 1) % TX_RING_LEN;
    e1000.regs.write(regs::TDT, tx.tail as u32);
    tx.packets += 1;
    Ok(())
}

/// IRQ handler: acknowledge by reading ICR, then drain the receive ring.
fn handle_irq(_frame: &mut TrapFrame, ctx: *mut ()) {
    // SAFETY: `ctx` is the E1000Device registered with this vector.
    let e1000 = unsafe { &*(ctx as *const E1000Device) };

    // Reading ICR clears the pending causes.
    let cause = e1000.regs.read(regs::ICR);

    let mut rx = e1000.rx.lock();
    rx.stats.interrupts += 1;
    if cause & regs::INT_RXO != 0 {
        rx.stats.rxo += 1;
        tachyon_kernel::kerr!(
            "e1000: receive ring overrun (rxo {} rxdmt0 {} rxt0 {}, {} packets in {} interrupts)",
            rx.stats.rxo,
            rx.stats.rxdmt0,
            rx.stats.rxt0,
            rx.stats.packets,
            rx.stats.interrupts
        );
    }
    if cause & regs::INT_RXDMT0 != 0 {
        rx.stats.rxdmt0 += 1;
    }
    if cause & regs::INT_RXT0 != 0 {
        rx.stats.rxt0 += 1;
    }

    if cause & (regs::INT_RXDMT0 | regs::INT_RXT0 | regs::INT_RXO) != 0 {
        let Some(dev_id) = e1000.dev_id else {
            return;
        };
        loop {
            let advanced_tail = {
                let result =
                    rx_poll(&mut rx, |frame| device::intr_receive(dev_id, frame));
                match result {
                    Ok(()) => true,
                    Err(Errno::Eagain) => false,
                    Err(e) => {
                        tachyon_kernel::kerr!("e1000: receive error: {}", e);
                        true
                    }
                }
            };
            if advanced_tail {
                e1000.regs.write(regs::RDT, rx.tail as u32);
            } else {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Binds the driver to one discovered controller.
fn probe(info: &PciDeviceInfo) -> KResult<()> {
    let PciBar::Memory { base, size, .. } = info.bars[0] else {
        tachyon_kernel::kerr!("e1000: BAR0 is not a memory BAR");
        return Err(Errno::Enodev);
    };

    let regs = map_mmio(base, size)?;

    let eeprom_normal_access = eeprom_detect_access(&regs);
    let mac = read_mac(&regs, eeprom_normal_access)?;
    tachyon_kernel::kinfo!(
        "e1000: MAC {} (EEPROM access: {})",
        mac,
        if eeprom_normal_access { "normal" } else { "alternate" }
    );

    init_ctrl(&regs);
    let tx = init_tx(&regs)?;
    let rx = init_rx(&regs, mac)?;

    // The device struct lives forever; teardown is not implemented.
    let mem = kvalloc::alloc(
        core::mem::size_of::<E1000Device>(),
        core::mem::align_of::<E1000Device>(),
    )
    .ok_or(Errno::Enomem)?;
    let e1000 = mem.as_ptr() as *mut E1000Device;
    // SAFETY: Fresh allocation, fully written before any use.
    unsafe {
        e1000.write(E1000Device {
            regs,
            mac,
            dev_id: None,
            tx: SpinLock::new(tx),
            rx: IrqSpinLock::new(rx),
        });
    }

    let dev_id = device::register(NetDevice {
        mac,
        ip: Ipv4Addr::UNSPECIFIED,
        link_type: LinkType::Ethernet,
        mtu: TX_BUF_SIZE,
        send_frame,
        private: e1000 as *mut (),
    })?;
    // SAFETY: Registration happens before the IRQ handler is installed,
    // so nothing else touches the struct yet.
    unsafe { (*e1000).dev_id = Some(dev_id) };

    let vector = pic::IRQ_VECTOR_BASE + info.interrupt_line;
    register_handler(vector, handle_irq, e1000 as *mut ())?;

    init_interrupts(&regs);
    pic::enable_irq(info.interrupt_line);

    set_link_up(&regs);
    tachyon_kernel::kinfo!(
        "e1000: link up, IRQ {} (vector {})",
        info.interrupt_line,
        vector
    );
    Ok(())
}

/// IDs this driver claims.
static ID_TABLE: [PciDeviceId; 1] = [PciDeviceId {
    vendor: VENDOR_INTEL,
    device: DEVICE_82540EM,
}];

/// Driver-table entry.
pub static DRIVER: PciDriver = PciDriver {
    name: "e1000",
    ids: &ID_TABLE,
    caps: DriverCaps::MEM.union(DriverCaps::DMA).union(DriverCaps::INTERRUPT),
    probe,
};
