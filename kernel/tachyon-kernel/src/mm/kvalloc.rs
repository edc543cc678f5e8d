//! Kernel virtual-address allocator.
//!
//! A thin wrapper around a [`Buddy`] managing the kernel's dynamic virtual
//! range. Subsystems whose allocations outlive a single function get their
//! memory here; callers are expected to allocate rarely and manage the
//! memory internally. Sizes round up to whole pages and alignment beyond
//! page size is not supported.

use core::ptr::NonNull;

use tachyon_core::alloc::RegionAlloc;
use tachyon_core::arena::Arena;
use tachyon_core::error::KResult;

use super::buddy::Buddy;
use crate::config::PAGE_SIZE;

/// A page-granular allocator over a virtual-address region.
pub struct KvAlloc<'a> {
    buddy: Buddy<'a>,
}

/// Buddy order for an allocation of `n` bytes.
fn order_for(n: usize) -> usize {
    let pages = n.div_ceil(PAGE_SIZE).max(1);
    pages.next_power_of_two().trailing_zeros() as usize
}

impl<'a> KvAlloc<'a> {
    /// Creates the allocator over `len` bytes of mapped virtual memory at
    /// `base`. Buddy bookkeeping comes from `arena`.
    ///
    /// # Safety
    ///
    /// The region must be mapped, writable and reserved for this allocator.
    pub unsafe fn new(base: *mut u8, len: usize, arena: &Arena<'a>) -> KResult<Self> {
        // SAFETY: Forwarded caller contract.
        let buddy = unsafe { Buddy::new(base, len, arena)? };
        Ok(Self { buddy })
    }

    /// Allocates `n` bytes (rounded up to pages), aligned to `align`.
    /// Returns `None` when no large-enough block is free.
    pub fn alloc(&mut self, n: usize, align: usize) -> Option<NonNull<u8>> {
        // Buddy blocks are naturally page-aligned; stronger alignment is
        // not implemented.
        assert!(align <= PAGE_SIZE);
        if n == 0 {
            return None;
        }
        self.buddy.alloc(order_for(n))
    }

    /// Frees an allocation of `n` bytes (the size passed to `alloc`).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc(n, _)` on this allocator and must not
    /// be used afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, n: usize) {
        // SAFETY: Forwarded caller contract; the order matches alloc's.
        unsafe { self.buddy.free(ptr, order_for(n)) };
    }

    /// Bytes currently free.
    pub fn free_bytes(&self) -> usize {
        self.buddy.free_bytes()
    }
}

// ---------------------------------------------------------------------------
// Kernel-global instance
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod global {
    use tachyon_core::sync::SpinLock;

    use super::*;

    /// Backing store for the buddy's bookkeeping (availability bitmap).
    /// Static because kvalloc must come up before any dynamic allocator.
    const BACKING_LEN: usize = 0x8000;
    static mut BACKING: [u8; BACKING_LEN] = [0; BACKING_LEN];

    static KVALLOC: SpinLock<Option<KvAlloc<'static>>> = SpinLock::new(None);

    /// Initializes the global allocator over the given virtual region.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, with a mapped region owned by kvalloc.
    pub unsafe fn init(base: *mut u8, len: usize) -> KResult<()> {
        // SAFETY: Single-call contract makes this the only borrow.
        let backing = unsafe { &mut *core::ptr::addr_of_mut!(BACKING) };
        let arena = Arena::new(backing);
        // SAFETY: Forwarded caller contract.
        let alloc = unsafe { KvAlloc::new(base, len, &arena)? };

        let mut global = KVALLOC.lock();
        assert!(global.is_none(), "kvalloc already initialized");
        *global = Some(alloc);
        Ok(())
    }

    /// Allocates from the global allocator. See [`KvAlloc::alloc`].
    pub fn alloc(n: usize, align: usize) -> Option<NonNull<u8>> {
        KVALLOC.lock().as_mut().expect("kvalloc not initialized").alloc(n, align)
    }

    /// Frees to the global allocator.
    ///
    /// # Safety
    ///
    /// Same contract as [`KvAlloc::free`].
    pub unsafe fn free(ptr: NonNull<u8>, n: usize) {
        // SAFETY: Forwarded caller contract.
        unsafe {
            KVALLOC
                .lock()
                .as_mut()
                .expect("kvalloc not initialized")
                .free(ptr, n)
        };
    }

    /// [`RegionAlloc`] facade over the global allocator, for subsystems
    /// that take an allocator handle (the RAM filesystem).
    pub struct KernelAlloc;

    impl RegionAlloc for KernelAlloc {
        fn alloc(&self, n: usize, align: usize) -> Option<NonNull<u8>> {
            alloc(n, align)
        }

        unsafe fn free(&self, ptr: NonNull<u8>, n: usize, _align: usize) {
            // SAFETY: Forwarded trait contract.
            unsafe { free(ptr, n) };
        }
    }

    /// The lone instance of [`KernelAlloc`].
    pub static KERNEL_ALLOC: KernelAlloc = KernelAlloc;
}

#[cfg(target_os = "none")]
pub use global::{alloc, free, init, KernelAlloc, KERNEL_ALLOC};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_rounding() {
        assert_eq!(order_for(1), 0);
        assert_eq!(order_for(PAGE_SIZE), 0);
        assert_eq!(order_for(PAGE_SIZE + 1), 1);
        assert_eq!(order_for(3 * PAGE_SIZE), 2);
        assert_eq!(order_for(4 * PAGE_SIZE), 2);
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let mut mem = vec![0u8; 17 * PAGE_SIZE];
        let mut scratch = vec![0u8; 1024];
        let arena = Arena::new(&mut scratch);
        let mut kv = unsafe { KvAlloc::new(mem.as_mut_ptr(), mem.len(), &arena).unwrap() };

        let total = kv.free_bytes();
        let a = kv.alloc(100, 8).unwrap();
        assert_eq!(a.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(kv.free_bytes(), total - PAGE_SIZE);

        let b = kv.alloc(3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(kv.free_bytes(), total - PAGE_SIZE - 4 * PAGE_SIZE);

        unsafe {
            kv.free(a, 100);
            kv.free(b, 3 * PAGE_SIZE);
        }
        assert_eq!(kv.free_bytes(), total);
    }

    #[test]
    fn zero_sized_alloc_is_none() {
        let mut mem = vec![0u8; 5 * PAGE_SIZE];
        let mut scratch = vec![0u8; 1024];
        let arena = Arena::new(&mut scratch);
        let mut kv = unsafe { KvAlloc::new(mem.as_mut_ptr(), mem.len(), &arena).unwrap() };
        assert!(kv.alloc(0, 1).is_none());
    }
}
