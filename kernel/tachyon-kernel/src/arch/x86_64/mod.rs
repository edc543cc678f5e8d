//! x86_64 support: port I/O, privileged instructions, segmentation,
//! interrupt descriptor table and trap dispatch, legacy PIC.

pub mod gdt;
pub mod idt;
pub mod instructions;
pub mod pic;
pub mod port;
pub mod trap;

pub use port::Port;
