//! Legacy 8259 PIC pair.
//!
//! Remapped so IRQ 0..15 arrive as vectors 32..47, with every line masked
//! until a driver asks for it. This kernel has no APIC path; the PIC is
//! the interrupt controller.

use super::port::Port;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// ICW1: initialisation, ICW4 follows.
const ICW1_INIT: u8 = 0x11;
/// ICW4: 8086 mode.
const ICW4_8086: u8 = 0x01;
/// End-of-interrupt command.
const EOI: u8 = 0x20;

/// First vector of the remapped IRQ range.
pub const IRQ_VECTOR_BASE: u8 = 32;
/// One past the last remapped IRQ vector.
pub const IRQ_VECTOR_END: u8 = 48;

#[inline]
fn io_wait() {
    // POST diagnostic port; a write is a cheap bus delay.
    // SAFETY: Writing 0 to port 0x80 has no effect.
    unsafe { Port::<u8>::new(0x80).write(0) };
}

/// Remaps the PIC pair to vectors 32..47 and masks every line.
///
/// # Safety
///
/// Must run with interrupts disabled, once.
pub unsafe fn init() {
    let pic1_cmd = Port::<u8>::new(PIC1_CMD);
    let pic1_data = Port::<u8>::new(PIC1_DATA);
    let pic2_cmd = Port::<u8>::new(PIC2_CMD);
    let pic2_data = Port::<u8>::new(PIC2_DATA);

    // SAFETY: The standard 8259 initialisation sequence.
    unsafe {
        pic1_cmd.write(ICW1_INIT);
        io_wait();
        pic2_cmd.write(ICW1_INIT);
        io_wait();

        // ICW2: vector offsets.
        pic1_data.write(IRQ_VECTOR_BASE);
        io_wait();
        pic2_data.write(IRQ_VECTOR_BASE + 8);
        io_wait();

        // ICW3: slave on IRQ2 / cascade identity.
        pic1_data.write(4);
        io_wait();
        pic2_data.write(2);
        io_wait();

        pic1_data.write(ICW4_8086);
        io_wait();
        pic2_data.write(ICW4_8086);
        io_wait();

        // Mask everything; drivers unmask their line explicitly.
        pic1_data.write(0xFF);
        pic2_data.write(0xFF);
    }
    crate::kdebug!("pic: remapped to vectors {}..{}", IRQ_VECTOR_BASE, IRQ_VECTOR_END);
}

/// Unmasks one IRQ line (0..15).
pub fn enable_irq(irq: u8) {
    assert!(irq < 16);
    let (port, bit) = if irq < 8 {
        (Port::<u8>::new(PIC1_DATA), irq)
    } else {
        (Port::<u8>::new(PIC2_DATA), irq - 8)
    };
    // SAFETY: Read-modify-write of the interrupt mask register.
    unsafe {
        let mask = port.read();
        port.write(mask & !(1 << bit));
    }
    // An IRQ above 7 additionally needs the cascade line on the master.
    if irq >= 8 {
        let master = Port::<u8>::new(PIC1_DATA);
        // SAFETY: As above.
        unsafe {
            let mask = master.read();
            master.write(mask & !(1 << 2));
        }
    }
}

/// Masks one IRQ line (0..15).
pub fn disable_irq(irq: u8) {
    assert!(irq < 16);
    let (port, bit) = if irq < 8 {
        (Port::<u8>::new(PIC1_DATA), irq)
    } else {
        (Port::<u8>::new(PIC2_DATA), irq - 8)
    };
    // SAFETY: Read-modify-write of the interrupt mask register.
    unsafe {
        let mask = port.read();
        port.write(mask | (1 << bit));
    }
}

/// Acknowledges an IRQ (0..15) on the PIC(s) that delivered it.
pub fn end_of_interrupt(irq: u8) {
    assert!(irq < 16);
    // SAFETY: EOI writes are the documented acknowledge protocol.
    unsafe {
        if irq >= 8 {
            Port::<u8>::new(PIC2_CMD).write(EOI);
        }
        Port::<u8>::new(PIC1_CMD).write(EOI);
    }
}
