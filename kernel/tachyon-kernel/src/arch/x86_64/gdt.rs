//! Global descriptor table.
//!
//! Long mode ignores segmentation apart from the code segment's L bit, so
//! the kernel installs the minimal flat table: null, 64-bit code, data.
//! Reloading the selectors needs a far return for CS; that lives in a tiny
//! assembly shim.

/// Kernel code selector (GDT entry 1).
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector (GDT entry 2).
pub const KERNEL_DS: u16 = 0x10;

/// 64-bit code segment: present, ring 0, executable, L bit.
const CODE_DESCRIPTOR: u64 = 0x00209A00_00000000;
/// Data segment: present, ring 0, writable.
const DATA_DESCRIPTOR: u64 = 0x00009200_00000000;

static GDT: [u64; 3] = [0, CODE_DESCRIPTOR, DATA_DESCRIPTOR];

/// GDTR / IDTR operand layout.
#[repr(C, packed)]
pub struct DescriptorTablePointer {
    /// Table limit (size - 1).
    pub limit: u16,
    /// Table base address.
    pub base: u64,
}

core::arch::global_asm!(
    ".global __gdt_reload_segments",
    "__gdt_reload_segments:",
    // Data selectors first, then CS via far return.
    "    mov ax, 0x10",
    "    mov ds, ax",
    "    mov es, ax",
    "    mov ss, ax",
    "    xor ax, ax",
    "    mov fs, ax",
    "    mov gs, ax",
    "    push 0x08",
    "    lea rax, [rip + 2f]",
    "    push rax",
    "    retfq",
    "2:",
    "    ret",
);

unsafe extern "C" {
    fn __gdt_reload_segments();
}

/// Loads the kernel GDT and reloads all segment registers.
///
/// # Safety
///
/// Must run with interrupts disabled; changing CS mid-interrupt would be
/// fatal.
pub unsafe fn init() {
    let ptr = DescriptorTablePointer {
        limit: (core::mem::size_of_val(&GDT) - 1) as u16,
        base: GDT.as_ptr() as u64,
    };
    // SAFETY: The table is static and the shim reloads matching selectors.
    unsafe {
        core::arch::asm!("lgdt [{}]", in(reg) &ptr, options(nostack, preserves_flags));
        __gdt_reload_segments();
    }
    crate::kdebug!("gdt: loaded, cs={:#x} ds={:#x}", KERNEL_CS, KERNEL_DS);
}
