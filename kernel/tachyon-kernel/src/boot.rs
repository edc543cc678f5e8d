//! Kernel bring-up.
//!
//! The boot loader drops us into [`early_init`] with identity-mapped low
//! memory and a valid stack. Bring-up order: console, GDT/IDT/PIC, the
//! time source, then the memory stack (paging, kvalloc, heap), then the
//! full logger. Device probing happens in between, driven by the boot
//! binary; [`run`] then unpacks the boot archive, applies the runtime
//! configuration, starts the scheduler and the network/web tasks, and
//! settles into being the main task.

extern crate alloc;

use alloc::boxed::Box;

use tachyon_core::addr::{PhysAddr, VirtAddr};
use tachyon_core::arena::Arena;
use tachyon_core::sync::SpinLock;

use crate::arch::x86_64::{gdt, idt, instructions, pic};
use crate::config::{
    ARCHIVE_BASE, ARCHIVE_MAX_LEN, CONFIG_FILE_PATH, DYN_MEM_BASE, DYN_MEM_LEN, KERNEL_HEAP_SIZE,
    LOW_MEM_BASE, LOW_MEM_LEN, PAGE_SIZE, WEB_PORT,
};
use crate::fs::archive;
use crate::fs::ramfs::RamFs;
use crate::mm::registry::AddrMapping;
use crate::mm::{heap, kvalloc, paging};
use crate::net::addr::Ipv4Addr;
use crate::net::device::{self, PacketView};
use crate::net::ethernet::NetProto;
use crate::net::send_buf::SendBuf;
use crate::net::{arp, ipv4};
use crate::{log, rtcfg, sched, time, web};

/// The root filesystem, populated from the boot archive.
pub static ROOT_FS: SpinLock<Option<RamFs<'static>>> = SpinLock::new(None);

/// Heap growth callback: hand whole pages from kvalloc to the heap.
fn heap_grow(min_bytes: usize) -> Option<(*mut u8, usize)> {
    let n = min_bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    kvalloc::alloc(n, PAGE_SIZE).map(|p| (p.as_ptr(), n))
}

/// First stage: console, then memory, then interrupts and time.
///
/// # Safety
///
/// Must be called exactly once, first thing after boot, with the boot
/// loader's identity mapping of low memory still active.
pub unsafe fn early_init() {
    log::init_early_serial();
    crate::kprintln!();
    crate::kprintln!("tachyon {}", env!("CARGO_PKG_VERSION"));
    crate::kprintln!();

    let low = AddrMapping::kernel(
        VirtAddr::new(LOW_MEM_BASE),
        PhysAddr::new(LOW_MEM_BASE),
        LOW_MEM_LEN,
    );
    let dynamic = AddrMapping::kernel(
        VirtAddr::new(DYN_MEM_BASE),
        PhysAddr::new(DYN_MEM_BASE),
        DYN_MEM_LEN,
    );
    // SAFETY: Both regions are ours per the boot protocol; called once.
    let (dyn_base, dyn_len) =
        unsafe { paging::init(low, dynamic) }.expect("failed to build kernel address space");

    // SAFETY: The remaining dynamic region is mapped and unused; once.
    unsafe { kvalloc::init(dyn_base, dyn_len) }.expect("failed to initialize kvalloc");

    // SAFETY: Interrupts are still disabled; each is called once.
    unsafe {
        gdt::init();
        idt::init();
        pic::init();
    }
    time::init();

    let heap_region = kvalloc::alloc(KERNEL_HEAP_SIZE, PAGE_SIZE).expect("no memory for the heap");
    // SAFETY: Fresh kvalloc region, page-aligned, mapped.
    unsafe { heap::init(heap_region.as_ptr(), KERNEL_HEAP_SIZE) };
    heap::set_grow_fn(heap_grow);

    log::init_logger();
    log::add_sink(log::vga_sink());

    instructions::enable_interrupts();
    crate::kinfo!("boot: early init complete");
}

/// Maps the boot archive and extracts it into a fresh RAM filesystem.
fn load_root_fs() {
    let mut fs = match RamFs::new(&kvalloc::KERNEL_ALLOC) {
        Ok(fs) => fs,
        Err(e) => {
            crate::kerr!("boot: cannot create root filesystem: {}", e);
            return;
        }
    };

    // The loader deposits the archive inside the identity-mapped low
    // region; read the header in place to learn its true size.
    // SAFETY: The low region is mapped; sizes are bounds-checked below.
    let header = unsafe { core::slice::from_raw_parts(ARCHIVE_BASE as *const u8, 24) };
    if &header[..8] != archive::ARCHIVE_MAGIC {
        crate::kwarn!("boot: no archive at {:#x}, starting with an empty fs", ARCHIVE_BASE);
        *ROOT_FS.lock() = Some(fs);
        return;
    }
    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&header[16..24]);
    let size = i64::from_le_bytes(size_bytes);
    if size < 24 || size as usize > ARCHIVE_MAX_LEN {
        crate::kerr!("boot: archive size {} out of bounds", size);
        *ROOT_FS.lock() = Some(fs);
        return;
    }

    // SAFETY: Checked length within the mapped, loader-owned region.
    let data = unsafe { core::slice::from_raw_parts(ARCHIVE_BASE as *const u8, size as usize) };
    match archive::extract(data, &mut fs) {
        Ok(()) => crate::kinfo!("boot: archive extracted ({} bytes)", size),
        Err(e) => crate::kerr!("boot: archive extraction failed: {}", e),
    }
    *ROOT_FS.lock() = Some(fs);
}

/// Applies the runtime config: device address, connected route, default
/// route. Returns the local address for the web task.
fn configure_network() -> Option<Ipv4Addr> {
    let cfg = {
        let mut fs = ROOT_FS.lock();
        let fs = fs.as_mut()?;
        match rtcfg::load(fs, CONFIG_FILE_PATH) {
            Ok(cfg) => cfg,
            Err(e) => {
                crate::kerr!("boot: cannot read {}: {}", CONFIG_FILE_PATH, e);
                return None;
            }
        }
    };

    let Some(dev) = device::first_device() else {
        crate::kwarn!("boot: no network device probed");
        return None;
    };
    let (local_ip, mask) = match (cfg.local_ip, cfg.local_ip_mask) {
        (Some(ip), Some(mask)) => (ip, mask),
        _ => {
            crate::kerr!("boot: config is missing local_ip");
            return None;
        }
    };

    if let Err(e) = device::set_ip(dev, local_ip) {
        crate::kerr!("boot: cannot assign {}: {}", local_ip, e);
        return None;
    }

    // Connected route for the local network.
    let _ = ipv4::route_add(ipv4::RouteEntry {
        dest: local_ip.mask_with(mask),
        mask,
        gateway: Ipv4Addr::UNSPECIFIED,
        interface: local_ip,
    });
    if let Some(gw) = cfg.default_gateway_ip {
        let _ = ipv4::route_add(ipv4::RouteEntry {
            dest: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            gateway: gw,
            interface: local_ip,
        });
    }

    // Ask for the gateway's (or host's) hardware address up front so the
    // first reply does not stall on an empty ARP table.
    if let Some(target) = cfg.default_gateway_ip.or(cfg.host_ip) {
        let mut backing = [0u8; 256];
        if let Err(e) = arp::send_request(target, dev, SendBuf::new(Arena::new(&mut backing))) {
            crate::kwarn!("boot: ARP probe for {} failed: {}", target, e);
        }
    }

    Some(local_ip)
}

/// The receive task: drains the input queue and dispatches by protocol.
fn rx_task(_ctx: *mut ()) {
    let mut scratch = [0u8; 0x1000];
    loop {
        while let Some(pkt) = device::get_input() {
            let view: PacketView<'_> = pkt.view();
            let sb = SendBuf::new(Arena::new(&mut scratch));
            let result = match view.proto {
                NetProto::Arp => arp::handle_packet(&view, sb),
                NetProto::Ipv4 => ipv4::handle_packet(&view, sb),
            };
            if let Err(e) = result {
                crate::kwarn!("net: inbound packet handling failed: {}", e);
            }
        }
        sched::sleep_ms(5);
    }
}

/// Second stage: filesystem, configuration, scheduler, tasks. Never
/// returns — the calling flow becomes the scheduler's main task.
pub fn run() -> ! {
    load_root_fs();
    let local_ip = configure_network();

    sched::init();
    if let Err(e) = sched::create_task(rx_task, core::ptr::null_mut()) {
        crate::kerr!("boot: cannot start receive task: {}", e);
    }

    if let Some(addr) = local_ip {
        let ctx = Box::leak(Box::new(web::WebContext {
            addr,
            port: WEB_PORT,
        }));
        if let Err(e) = sched::create_task(web::task, ctx as *mut web::WebContext as *mut ()) {
            crate::kerr!("boot: cannot start web task: {}", e);
        }
    }

    crate::kinfo!("boot: entering main task");
    loop {
        // The main task is the fallback when nothing else is ready; it
        // must never complete.
        sched::sleep_ms(1000);
    }
}

// ---------------------------------------------------------------------------
// Panic
// ---------------------------------------------------------------------------

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    instructions::disable_interrupts();
    crate::kfatal!("kernel panic: {}", info);
    instructions::hlt_loop();
}
