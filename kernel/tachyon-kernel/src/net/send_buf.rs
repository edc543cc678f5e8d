//! Prepend-oriented packet assembly.
//!
//! A [`SendBuf`] collects the parts of an outbound packet as each protocol
//! layer adds its header in front of the payload. "Prepend" allocates a
//! fresh part from the buffer's arena and hands it back for the caller to
//! fill; the logical packet is the concatenation of the parts in reverse
//! allocation order. [`assemble`](SendBuf::assemble) flattens them in that
//! order and nothing outside this module needs to know about the shape.

use tachyon_core::arena::Arena;
use tachyon_core::bytes::ByteBuf;
use tachyon_core::error::{Errno, KResult};

/// Maximum number of parts (protocol layers) in one packet.
pub const SEND_BUF_MAX_PARTS: usize = 8;

/// A packet under assembly.
pub struct SendBuf<'a> {
    arena: Arena<'a>,
    parts: [Option<ByteBuf<'a>>; SEND_BUF_MAX_PARTS],
    n_used: usize,
}

impl<'a> SendBuf<'a> {
    /// Creates an empty send buffer drawing part storage from `arena`.
    pub fn new(arena: Arena<'a>) -> Self {
        Self {
            arena,
            parts: [const { None }; SEND_BUF_MAX_PARTS],
            n_used: 0,
        }
    }

    /// Adds a part of capacity `cap` *in front of* everything already in
    /// the buffer and returns it for filling.
    ///
    /// Fails with `ENOBUFS` when all part slots are taken and `ENOMEM` when
    /// the arena is exhausted.
    pub fn prepend(&mut self, cap: usize) -> KResult<&mut ByteBuf<'a>> {
        if self.n_used == SEND_BUF_MAX_PARTS {
            return Err(Errno::Enobufs);
        }
        let part = ByteBuf::from_arena(&self.arena, cap).ok_or(Errno::Enomem)?;
        self.parts[self.n_used] = Some(part);
        self.n_used += 1;
        Ok(self.parts[self.n_used - 1].as_mut().unwrap())
    }

    /// Total length of the assembled packet.
    pub fn total_len(&self) -> usize {
        self.parts[..self.n_used]
            .iter()
            .map(|p| p.as_ref().map_or(0, ByteBuf::len))
            .sum()
    }

    /// Appends the packet content to `dst`: parts in reverse allocation
    /// order, which is wire order. Fails with `ENOMEM` if `dst` is too
    /// small.
    pub fn assemble(&self, dst: &mut ByteBuf<'_>) -> KResult<()> {
        let before = dst.len();
        for part in self.parts[..self.n_used].iter().rev() {
            let part = part.as_ref().unwrap();
            if dst.append(part.as_slice()) != part.len() {
                return Err(Errno::Enomem);
            }
        }
        debug_assert_eq!(dst.len() - before, self.total_len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_assemble_in_reverse_order() {
        let mut backing = [0u8; 256];
        let mut sb = SendBuf::new(Arena::new(&mut backing));

        // Payload first, headers prepended afterwards — wire order is the
        // reverse of allocation order.
        sb.prepend(4).unwrap().append(b"data");
        sb.prepend(3).unwrap().append(b"ip:");
        sb.prepend(4).unwrap().append(b"eth:");

        assert_eq!(sb.total_len(), 11);

        let mut out_backing = [0u8; 32];
        let mut out = ByteBuf::new(&mut out_backing);
        sb.assemble(&mut out).unwrap();
        assert_eq!(out.as_slice(), b"eth:ip:data");
    }

    #[test]
    fn part_slots_are_bounded() {
        let mut backing = [0u8; 256];
        let mut sb = SendBuf::new(Arena::new(&mut backing));
        for _ in 0..SEND_BUF_MAX_PARTS {
            sb.prepend(1).unwrap();
        }
        assert_eq!(sb.prepend(1).unwrap_err(), Errno::Enobufs);
    }

    #[test]
    fn arena_exhaustion_is_enomem() {
        let mut backing = [0u8; 16];
        let mut sb = SendBuf::new(Arena::new(&mut backing));
        assert_eq!(sb.prepend(64).unwrap_err(), Errno::Enomem);
    }

    #[test]
    fn assemble_into_small_buffer_fails() {
        let mut backing = [0u8; 64];
        let mut sb = SendBuf::new(Arena::new(&mut backing));
        sb.prepend(10).unwrap().append(b"0123456789");

        let mut out_backing = [0u8; 4];
        let mut out = ByteBuf::new(&mut out_backing);
        assert_eq!(sb.assemble(&mut out).unwrap_err(), Errno::Enomem);
    }

    #[test]
    fn partially_filled_parts_keep_their_length() {
        let mut backing = [0u8; 64];
        let mut sb = SendBuf::new(Arena::new(&mut backing));
        let part = sb.prepend(16).unwrap();
        part.append(b"abc");
        assert_eq!(sb.total_len(), 3);
    }
}
