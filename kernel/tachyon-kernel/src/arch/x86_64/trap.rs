//! Trap-frame capture and interrupt dispatch.
//!
//! Every installed vector points at a small assembly stub that normalises
//! the stack (pushing a zero error code where the CPU does not supply one),
//! pushes the vector number and all general-purpose registers, and calls
//! [`trap_dispatch`] with a pointer to the resulting [`TrapFrame`].
//!
//! The dispatcher consults a per-vector handler table filled in through
//! [`register_handler`]. CPU exceptions without a handler dump the frame
//! and halt; remapped IRQs acknowledge the PIC before returning; vector
//! 0x80 is the syscall gate.

use core::sync::atomic::{AtomicPtr, Ordering};

use tachyon_core::error::{Errno, KResult};

use super::pic;

/// Vector used by the `int 0x80` syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Registers and interrupt context captured by the ISR stubs.
///
/// Field order mirrors the push sequence in `__trap_common`; the last five
/// fields are the CPU-pushed interrupt frame.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Interrupt vector, pushed by the stub.
    pub vector: u64,
    /// CPU error code, or 0 for vectors without one.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Dumps the frame to the kernel log.
    pub fn log(&self) {
        crate::kprintln!("rax: {:#018x}  rbx: {:#018x}", self.rax, self.rbx);
        crate::kprintln!("rcx: {:#018x}  rdx: {:#018x}", self.rcx, self.rdx);
        crate::kprintln!("rsi: {:#018x}  rdi: {:#018x}", self.rsi, self.rdi);
        crate::kprintln!("rbp: {:#018x}  r8:  {:#018x}", self.rbp, self.r8);
        crate::kprintln!("r9:  {:#018x}  r10: {:#018x}", self.r9, self.r10);
        crate::kprintln!("r11: {:#018x}  r12: {:#018x}", self.r11, self.r12);
        crate::kprintln!("r13: {:#018x}  r14: {:#018x}", self.r13, self.r14);
        crate::kprintln!("r15: {:#018x}  vec: {:#x}", self.r15, self.vector);
        crate::kprintln!("err: {:#x}  rip: {:#018x}", self.error_code, self.rip);
        crate::kprintln!("cs:  {:#x}  rflags: {:#x}", self.cs, self.rflags);
        crate::kprintln!("rsp: {:#018x}  ss: {:#x}", self.rsp, self.ss);
    }
}

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

/// A registered interrupt handler: the frame plus the private pointer that
/// was supplied at registration.
pub type TrapHandler = fn(&mut TrapFrame, *mut ());

const NUM_VECTORS: usize = 256;

const NULL_PTR: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static HANDLER_FNS: [AtomicPtr<()>; NUM_VECTORS] = [NULL_PTR; NUM_VECTORS];
static HANDLER_CTXS: [AtomicPtr<()>; NUM_VECTORS] = [NULL_PTR; NUM_VECTORS];

/// Installs `handler` for `vector`, passing `ctx` on every invocation.
///
/// Fails with `EEXIST` if the vector already has a handler.
pub fn register_handler(vector: u8, handler: TrapHandler, ctx: *mut ()) -> KResult<()> {
    let idx = vector as usize;
    // Context first so a concurrent dispatch never sees a handler without
    // its context.
    HANDLER_CTXS[idx].store(ctx, Ordering::Release);
    HANDLER_FNS[idx]
        .compare_exchange(
            core::ptr::null_mut(),
            handler as *mut (),
            Ordering::Release,
            Ordering::Relaxed,
        )
        .map_err(|_| Errno::Eexist)?;
    Ok(())
}

fn lookup_handler(vector: u8) -> Option<(TrapHandler, *mut ())> {
    let idx = vector as usize;
    let f = HANDLER_FNS[idx].load(Ordering::Acquire);
    if f.is_null() {
        return None;
    }
    let ctx = HANDLER_CTXS[idx].load(Ordering::Acquire);
    // SAFETY: Only valid `TrapHandler` pointers are stored in HANDLER_FNS.
    Some((unsafe { core::mem::transmute::<*mut (), TrapHandler>(f) }, ctx))
}

/// C-level dispatcher invoked by `__trap_common`.
#[unsafe(no_mangle)]
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    let vector = frame.vector as u8;

    if vector == SYSCALL_VECTOR {
        crate::syscall::handle(frame);
        return;
    }

    match lookup_handler(vector) {
        Some((handler, ctx)) => handler(frame, ctx),
        None => {
            if vector < 32 {
                crate::kfatal!("unhandled CPU exception, vector {}", vector);
                frame.log();
                super::instructions::hlt_loop();
            }
            if (pic::IRQ_VECTOR_BASE..pic::IRQ_VECTOR_END).contains(&vector) {
                crate::kwarn!("spurious IRQ on vector {}", vector);
            }
        }
    }

    if (pic::IRQ_VECTOR_BASE..pic::IRQ_VECTOR_END).contains(&vector) {
        pic::end_of_interrupt(vector - pic::IRQ_VECTOR_BASE);
    }
}

// ---------------------------------------------------------------------------
// Assembly stubs
// ---------------------------------------------------------------------------

core::arch::global_asm!(
    ".global __trap_common",
    "__trap_common:",
    "    push rax",
    "    push rbx",
    "    push rcx",
    "    push rdx",
    "    push rsi",
    "    push rdi",
    "    push rbp",
    "    push r8",
    "    push r9",
    "    push r10",
    "    push r11",
    "    push r12",
    "    push r13",
    "    push r14",
    "    push r15",
    "    mov rdi, rsp",
    "    cld",
    "    call trap_dispatch",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop r11",
    "    pop r10",
    "    pop r9",
    "    pop r8",
    "    pop rbp",
    "    pop rdi",
    "    pop rsi",
    "    pop rdx",
    "    pop rcx",
    "    pop rbx",
    "    pop rax",
    // Drop vector and error code.
    "    add rsp, 16",
    "    iretq",
);

/// Emits a stub for a vector where the CPU pushes no error code.
macro_rules! trap_stub {
    ($name:ident, $vec:literal) => {
        core::arch::global_asm!(concat!(
            ".global ",
            stringify!($name),
            "\n",
            stringify!($name),
            ":\n",
            "    push 0\n",
            "    push ",
            stringify!($vec),
            "\n",
            "    jmp __trap_common\n",
        ));
        unsafe extern "C" {
            pub fn $name();
        }
    };
}

/// Emits a stub for a vector where the CPU pushes an error code.
macro_rules! trap_stub_err {
    ($name:ident, $vec:literal) => {
        core::arch::global_asm!(concat!(
            ".global ",
            stringify!($name),
            "\n",
            stringify!($name),
            ":\n",
            "    push ",
            stringify!($vec),
            "\n",
            "    jmp __trap_common\n",
        ));
        unsafe extern "C" {
            pub fn $name();
        }
    };
}

// CPU exceptions 0..31. Vectors 8, 10-14, 17, 21 carry an error code.
trap_stub!(__trap_stub_0, 0);
trap_stub!(__trap_stub_1, 1);
trap_stub!(__trap_stub_2, 2);
trap_stub!(__trap_stub_3, 3);
trap_stub!(__trap_stub_4, 4);
trap_stub!(__trap_stub_5, 5);
trap_stub!(__trap_stub_6, 6);
trap_stub!(__trap_stub_7, 7);
trap_stub_err!(__trap_stub_8, 8);
trap_stub!(__trap_stub_9, 9);
trap_stub_err!(__trap_stub_10, 10);
trap_stub_err!(__trap_stub_11, 11);
trap_stub_err!(__trap_stub_12, 12);
trap_stub_err!(__trap_stub_13, 13);
trap_stub_err!(__trap_stub_14, 14);
trap_stub!(__trap_stub_15, 15);
trap_stub!(__trap_stub_16, 16);
trap_stub_err!(__trap_stub_17, 17);
trap_stub!(__trap_stub_18, 18);
trap_stub!(__trap_stub_19, 19);
trap_stub!(__trap_stub_20, 20);
trap_stub_err!(__trap_stub_21, 21);
trap_stub!(__trap_stub_22, 22);
trap_stub!(__trap_stub_23, 23);
trap_stub!(__trap_stub_24, 24);
trap_stub!(__trap_stub_25, 25);
trap_stub!(__trap_stub_26, 26);
trap_stub!(__trap_stub_27, 27);
trap_stub!(__trap_stub_28, 28);
trap_stub!(__trap_stub_29, 29);
trap_stub!(__trap_stub_30, 30);
trap_stub!(__trap_stub_31, 31);
// Remapped external IRQs 32..47.
trap_stub!(__trap_stub_32, 32);
trap_stub!(__trap_stub_33, 33);
trap_stub!(__trap_stub_34, 34);
trap_stub!(__trap_stub_35, 35);
trap_stub!(__trap_stub_36, 36);
trap_stub!(__trap_stub_37, 37);
trap_stub!(__trap_stub_38, 38);
trap_stub!(__trap_stub_39, 39);
trap_stub!(__trap_stub_40, 40);
trap_stub!(__trap_stub_41, 41);
trap_stub!(__trap_stub_42, 42);
trap_stub!(__trap_stub_43, 43);
trap_stub!(__trap_stub_44, 44);
trap_stub!(__trap_stub_45, 45);
trap_stub!(__trap_stub_46, 46);
trap_stub!(__trap_stub_47, 47);
// Syscall gate.
trap_stub!(__trap_stub_128, 128);

/// Installed stubs: `(vector, entry point)`.
pub static STUBS: [(u8, unsafe extern "C" fn()); 49] = [
    (0, __trap_stub_0),
    (1, __trap_stub_1),
    (2, __trap_stub_2),
    (3, __trap_stub_3),
    (4, __trap_stub_4),
    (5, __trap_stub_5),
    (6, __trap_stub_6),
    (7, __trap_stub_7),
    (8, __trap_stub_8),
    (9, __trap_stub_9),
    (10, __trap_stub_10),
    (11, __trap_stub_11),
    (12, __trap_stub_12),
    (13, __trap_stub_13),
    (14, __trap_stub_14),
    (15, __trap_stub_15),
    (16, __trap_stub_16),
    (17, __trap_stub_17),
    (18, __trap_stub_18),
    (19, __trap_stub_19),
    (20, __trap_stub_20),
    (21, __trap_stub_21),
    (22, __trap_stub_22),
    (23, __trap_stub_23),
    (24, __trap_stub_24),
    (25, __trap_stub_25),
    (26, __trap_stub_26),
    (27, __trap_stub_27),
    (28, __trap_stub_28),
    (29, __trap_stub_29),
    (30, __trap_stub_30),
    (31, __trap_stub_31),
    (32, __trap_stub_32),
    (33, __trap_stub_33),
    (34, __trap_stub_34),
    (35, __trap_stub_35),
    (36, __trap_stub_36),
    (37, __trap_stub_37),
    (38, __trap_stub_38),
    (39, __trap_stub_39),
    (40, __trap_stub_40),
    (41, __trap_stub_41),
    (42, __trap_stub_42),
    (43, __trap_stub_43),
    (44, __trap_stub_44),
    (45, __trap_stub_45),
    (46, __trap_stub_46),
    (47, __trap_stub_47),
    (SYSCALL_VECTOR, __trap_stub_128),
];
