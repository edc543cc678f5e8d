//! Kernel heap: a linked-list allocator behind `GlobalAlloc`.
//!
//! First-fit over an address-sorted free list with immediate coalescing.
//! The heap exists so the `alloc` crate works for the handful of places
//! that want collections (driver registration, the logger's sink list);
//! the spec-level data structures manage their own memory and never touch
//! it. When the heap runs dry it asks kvalloc for more pages through a
//! growth callback.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use tachyon_core::sync::SpinLock;

/// Smallest block we track; must hold a `FreeBlock` header.
const MIN_BLOCK_SIZE: usize = 32;

/// Minimum block alignment.
const BLOCK_ALIGN: usize = 16;

/// Header written into the first bytes of every free block.
#[repr(C)]
struct FreeBlock {
    /// Total size of the block, header included.
    size: usize,
    /// Next free block in address order, or null.
    next: *mut FreeBlock,
}

struct HeapInner {
    head: *mut FreeBlock,
    grow_fn: Option<fn(usize) -> Option<(*mut u8, usize)>>,
}

// SAFETY: Only touched under the SpinLock.
unsafe impl Send for HeapInner {}

/// A first-fit linked-list heap suitable as `#[global_allocator]`.
pub struct KernelHeap {
    inner: SpinLock<HeapInner>,
}

impl KernelHeap {
    /// An empty heap; feed it with [`init`](Self::init) before use.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(HeapInner {
                head: ptr::null_mut(),
                grow_fn: None,
            }),
        }
    }

    /// Donates the region `start..start + size` to the heap.
    ///
    /// # Safety
    ///
    /// The region must be mapped, writable, 16-byte aligned and unused.
    pub unsafe fn init(&self, start: *mut u8, size: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.head.is_null(), "heap already initialized");
        debug_assert!(size >= MIN_BLOCK_SIZE);

        let block = start as *mut FreeBlock;
        // SAFETY: The region is owned and writable per contract.
        unsafe {
            (*block).size = size;
            (*block).next = ptr::null_mut();
        }
        inner.head = block;
    }

    /// Registers the callback used to grow the heap on exhaustion.
    pub fn set_grow_fn(&self, f: fn(usize) -> Option<(*mut u8, usize)>) {
        self.inner.lock().grow_fn = Some(f);
    }

    /// Inserts `block` into the free list in address order, merging with
    /// adjacent neighbors.
    fn insert_and_coalesce(inner: &mut HeapInner, block: *mut FreeBlock) {
        let addr = block as usize;
        // SAFETY: `block` is a valid free-block header throughout.
        let size = unsafe { (*block).size };

        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut cur = inner.head;
        while !cur.is_null() && (cur as usize) < addr {
            prev = cur;
            // SAFETY: Free-list nodes are live headers.
            cur = unsafe { (*cur).next };
        }

        // Merge into the predecessor when contiguous.
        if !prev.is_null() {
            // SAFETY: `prev` is a live header.
            let prev_end = prev as usize + unsafe { (*prev).size };
            if prev_end == addr {
                // SAFETY: As above, plus `cur` when contiguous.
                unsafe {
                    (*prev).size += size;
                    let merged_end = prev as usize + (*prev).size;
                    if !cur.is_null() && merged_end == cur as usize {
                        (*prev).size += (*cur).size;
                        (*prev).next = (*cur).next;
                    }
                }
                return;
            }
        }

        // Merge the successor into `block` when contiguous.
        // SAFETY: `block` and `cur` are valid headers.
        unsafe {
            if !cur.is_null() && addr + size == cur as usize {
                (*block).size += (*cur).size;
                (*block).next = (*cur).next;
            } else {
                (*block).next = cur;
            }
        }

        if prev.is_null() {
            inner.head = block;
        } else {
            // SAFETY: `prev` is a live header.
            unsafe { (*prev).next = block };
        }
    }

    /// First-fit search; unlinks and returns `(alloc_start, size)`.
    fn take_first_fit(inner: &mut HeapInner, size: usize, align: usize) -> Option<usize> {
        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut cur = inner.head;

        while !cur.is_null() {
            let block_addr = cur as usize;
            // SAFETY: Free-list nodes are live headers.
            let block_size = unsafe { (*cur).size };

            let alloc_start = (block_addr + align - 1) & !(align - 1);
            let alloc_end = alloc_start.checked_add(size)?;

            if alloc_end <= block_addr + block_size {
                // SAFETY: As above.
                let next = unsafe { (*cur).next };
                if prev.is_null() {
                    inner.head = next;
                } else {
                    // SAFETY: As above.
                    unsafe { (*prev).next = next };
                }

                // Return alignment padding and the tail remainder.
                let front = alloc_start - block_addr;
                if front >= MIN_BLOCK_SIZE {
                    let f = block_addr as *mut FreeBlock;
                    // SAFETY: The padding lies inside the unlinked block.
                    unsafe {
                        (*f).size = front;
                        (*f).next = ptr::null_mut();
                    }
                    Self::insert_and_coalesce(inner, f);
                }
                let tail_start = (alloc_end + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1);
                let block_end = block_addr + block_size;
                if block_end > tail_start && block_end - tail_start >= MIN_BLOCK_SIZE {
                    let t = tail_start as *mut FreeBlock;
                    // SAFETY: The tail lies inside the unlinked block.
                    unsafe {
                        (*t).size = block_end - tail_start;
                        (*t).next = ptr::null_mut();
                    }
                    Self::insert_and_coalesce(inner, t);
                }

                return Some(alloc_start);
            }

            prev = cur;
            cur = next_of(cur);
        }
        None
    }
}

#[inline]
fn next_of(block: *mut FreeBlock) -> *mut FreeBlock {
    // SAFETY: Callers only pass live free-list nodes.
    unsafe { (*block).next }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: All state is behind the SpinLock.
unsafe impl Sync for KernelHeap {}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(MIN_BLOCK_SIZE);
        let align = layout.align().max(BLOCK_ALIGN);

        let mut inner = self.inner.lock();
        if let Some(addr) = Self::take_first_fit(&mut inner, size, align) {
            return addr as *mut u8;
        }

        // Grow and retry once.
        let Some(grow) = inner.grow_fn else {
            return ptr::null_mut();
        };
        drop(inner);

        let min_grow = size.max(64 * 1024);
        let Some((region, region_size)) = grow(min_grow) else {
            return ptr::null_mut();
        };
        let mut inner = self.inner.lock();
        let block = region as *mut FreeBlock;
        // SAFETY: The grow callback hands us fresh, mapped memory.
        unsafe {
            (*block).size = region_size;
            (*block).next = ptr::null_mut();
        }
        Self::insert_and_coalesce(&mut inner, block);

        match Self::take_first_fit(&mut inner, size, align) {
            Some(addr) => addr as *mut u8,
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr_: *mut u8, layout: Layout) {
        let size = layout.size().max(MIN_BLOCK_SIZE);
        let mut inner = self.inner.lock();
        let block = ptr_ as *mut FreeBlock;
        // SAFETY: The block came from `alloc` with this layout.
        unsafe {
            (*block).size = size;
            (*block).next = ptr::null_mut();
        }
        Self::insert_and_coalesce(&mut inner, block);
    }
}

#[cfg_attr(target_os = "none", global_allocator)]
static HEAP: KernelHeap = KernelHeap::new();

/// Donates the initial region to the global heap.
///
/// # Safety
///
/// See [`KernelHeap::init`].
pub unsafe fn init(start: *mut u8, size: usize) {
    // SAFETY: Forwarded caller contract.
    unsafe { HEAP.init(start, size) };
}

/// Registers the global heap's growth callback.
pub fn set_grow_fn(f: fn(usize) -> Option<(*mut u8, usize)>) {
    HEAP.set_grow_fn(f);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_heap<F: FnOnce(&KernelHeap)>(size: usize, f: F) {
        let layout = Layout::from_size_align(size, BLOCK_ALIGN).unwrap();
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        let heap = KernelHeap::new();
        unsafe { heap.init(buf, size) };
        f(&heap);
        unsafe { std::alloc::dealloc(buf, layout) };
    }

    #[test]
    fn alloc_dealloc_cycle() {
        with_heap(4096, |heap| {
            let layout = Layout::from_size_align(64, 16).unwrap();
            for _ in 0..50 {
                let p = unsafe { heap.alloc(layout) };
                assert!(!p.is_null());
                unsafe { heap.dealloc(p, layout) };
            }
        });
    }

    #[test]
    fn alignment_is_respected() {
        with_heap(4096, |heap| {
            let layout = Layout::from_size_align(64, 256).unwrap();
            let p = unsafe { heap.alloc(layout) };
            assert!(!p.is_null());
            assert_eq!(p as usize % 256, 0);
            unsafe { heap.dealloc(p, layout) };
        });
    }

    #[test]
    fn exhaustion_returns_null() {
        with_heap(128, |heap| {
            let layout = Layout::from_size_align(64, 16).unwrap();
            let a = unsafe { heap.alloc(layout) };
            let b = unsafe { heap.alloc(layout) };
            assert!(!a.is_null() && !b.is_null());
            assert!(unsafe { heap.alloc(layout) }.is_null());
            unsafe {
                heap.dealloc(a, layout);
                heap.dealloc(b, layout);
            }
        });
    }

    #[test]
    fn coalescing_reassembles_region() {
        with_heap(4096, |heap| {
            let layout = Layout::from_size_align(64, 16).unwrap();
            let a = unsafe { heap.alloc(layout) };
            let b = unsafe { heap.alloc(layout) };
            let c = unsafe { heap.alloc(layout) };
            unsafe {
                heap.dealloc(b, layout);
                heap.dealloc(a, layout);
                heap.dealloc(c, layout);
            }
            // After coalescing, nearly the whole heap is one block again.
            let big = Layout::from_size_align(4000, 16).unwrap();
            let p = unsafe { heap.alloc(big) };
            assert!(!p.is_null());
            unsafe { heap.dealloc(p, big) };
        });
    }

    #[test]
    fn grow_callback_fires_on_exhaustion() {
        use std::sync::atomic::{AtomicBool, Ordering};
        static CALLED: AtomicBool = AtomicBool::new(false);

        fn grow(_min: usize) -> Option<(*mut u8, usize)> {
            CALLED.store(true, Ordering::SeqCst);
            None
        }

        CALLED.store(false, Ordering::SeqCst);
        with_heap(64, |heap| {
            heap.set_grow_fn(grow);
            let layout = Layout::from_size_align(128, 16).unwrap();
            assert!(unsafe { heap.alloc(layout) }.is_null());
            assert!(CALLED.load(Ordering::SeqCst));
        });
    }
}
