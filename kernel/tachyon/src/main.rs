//! Boot binary.
//!
//! The boot loader copies the kernel's PT_LOAD segments into place, zeroes
//! BSS, sets up a stack and jumps to `_start` with low memory identity
//! mapped. From there: early kernel init, PCI probe (which binds the NIC
//! driver), then the kernel's main loop.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_entry {
    core::arch::global_asm!(
        ".global _start",
        "_start:",
        // The boot loader's stack is valid; align it and go.
        "    and rsp, -16",
        "    call kernel_main",
        "2:  hlt",
        "    jmp 2b",
    );

    #[unsafe(no_mangle)]
    extern "C" fn kernel_main() -> ! {
        // SAFETY: Called exactly once, straight from _start.
        unsafe { tachyon_kernel::boot::early_init() };

        if let Err(e) = tachyon_drivers::pci::probe_all() {
            tachyon_kernel::kerr!("pci: probe failed: {}", e);
        }

        tachyon_kernel::boot::run()
    }
}

/// Host builds only exist so `cargo test`/`cargo check` can cover the
/// workspace; the kernel proper never runs here.
#[cfg(not(target_os = "none"))]
fn main() {
    println!("tachyon is a kernel image; boot it, don't run it");
}
