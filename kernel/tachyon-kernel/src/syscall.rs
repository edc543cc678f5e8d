//! Syscall dispatch (`int 0x80`).
//!
//! rax selects the call (0 = read, 1 = write), rdi/rsi/rdx carry fd,
//! buffer and length. The return value goes back in rax: non-negative for
//! bytes processed, negative errno otherwise. Only console I/O exists:
//! writes to fd 1 and 2 reach the kernel log, reads return nothing.

use tachyon_core::error::Errno;

use crate::arch::x86_64::trap::TrapFrame;

const SYS_READ: u64 = 0;
const SYS_WRITE: u64 = 1;

const STDIN_FD: u64 = 0;
const STDOUT_FD: u64 = 1;
const STDERR_FD: u64 = 2;

fn err(errno: Errno) -> u64 {
    (-(errno.code() as i64)) as u64
}

/// Handles one trap through the syscall gate, writing the result into the
/// frame's rax.
pub fn handle(frame: &mut TrapFrame) {
    let (number, fd, buf, len) = (frame.rax, frame.rdi, frame.rsi, frame.rdx);

    frame.rax = match number {
        SYS_READ => {
            if fd == STDIN_FD {
                0 // No input device; read returns end-of-file.
            } else {
                err(Errno::Einval)
            }
        }
        SYS_WRITE => {
            if fd != STDOUT_FD && fd != STDERR_FD {
                err(Errno::Einval)
            } else {
                // SAFETY: User memory is identity-mapped; a hostile length
                // would fault into the page-fault path rather than corrupt
                // kernel state.
                let bytes = unsafe { core::slice::from_raw_parts(buf as *const u8, len as usize) };
                match core::str::from_utf8(bytes) {
                    Ok(s) => {
                        crate::kprint!("{}", s);
                        len
                    }
                    Err(_) => err(Errno::Einval),
                }
            }
        }
        _ => err(Errno::Einval),
    };
}
