//! Byte buffer with append semantics.
//!
//! Read-only views are plain `&[u8]` and fixed read/write regions are
//! `&mut [u8]`; [`ByteBuf`] is the third tier — a region with a fill level
//! (`len <= cap`) that supports appending. Conversions toward the weaker
//! tiers are free ([`ByteBuf::as_slice`]); going the other way means
//! providing fresh backing memory.

use crate::arena::Arena;

/// An append-only byte buffer over borrowed backing memory.
#[derive(Debug)]
pub struct ByteBuf<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> ByteBuf<'a> {
    /// Wraps `buf` as an empty buffer with capacity `buf.len()`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// Allocates a buffer of capacity `cap` from `arena`.
    pub fn from_arena(arena: &Arena<'a>, cap: usize) -> Option<Self> {
        Some(Self::new(arena.alloc_bytes(cap, 1)?))
    }

    /// Appends as much of `src` as fits. Returns the number of bytes
    /// actually copied.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Appends `n` copies of `value` (or as many as fit). Returns the
    /// number of bytes written.
    pub fn append_repeat(&mut self, n: usize, value: u8) -> usize {
        let n = n.min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].fill(value);
        self.len += n;
        n
    }

    /// The filled prefix.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The filled prefix, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    /// Current fill level.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity.
    pub fn cap(&self) -> usize {
        self.buf.len()
    }

    /// Unused capacity.
    pub fn spare(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Resets the fill level to zero. The capacity is unchanged.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_tracks_len() {
        let mut backing = [0u8; 8];
        let mut buf = ByteBuf::new(&mut backing);
        assert_eq!(buf.append(b"abc"), 3);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.as_slice(), b"abc");
    }

    #[test]
    fn append_truncates_at_capacity() {
        let mut backing = [0u8; 4];
        let mut buf = ByteBuf::new(&mut backing);
        assert_eq!(buf.append(b"abcdef"), 4);
        assert_eq!(buf.as_slice(), b"abcd");
        assert_eq!(buf.append(b"x"), 0);
    }

    #[test]
    fn append_repeat_fills() {
        let mut backing = [0u8; 8];
        let mut buf = ByteBuf::new(&mut backing);
        assert_eq!(buf.append_repeat(5, 0xB0), 5);
        assert_eq!(buf.as_slice(), &[0xB0; 5]);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut backing = [0u8; 8];
        let mut buf = ByteBuf::new(&mut backing);
        buf.append(b"abcd");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.cap(), 8);
        assert_eq!(buf.append(b"efgh"), 4);
        assert_eq!(buf.as_slice(), b"efgh");
    }

    #[test]
    fn from_arena_allocates_capacity() {
        let mut backing = [0u8; 64];
        let arena = Arena::new(&mut backing);
        let buf = ByteBuf::from_arena(&arena, 16).unwrap();
        assert_eq!(buf.cap(), 16);
        assert!(buf.is_empty());
    }
}
