//! In-RAM filesystem.
//!
//! Nodes live in a fixed [`Pool`]; a directory's children form a singly
//! linked list in insertion order, and file data sits in buffers obtained
//! from a [`RegionAlloc`] that double in capacity when a write outgrows
//! them. All paths are absolute; lookups walk the tree with exact,
//! case-sensitive name matches.

use core::ptr::{self, NonNull};

use tachyon_core::alloc::RegionAlloc;
use tachyon_core::arena::Arena;
use tachyon_core::bytes::ByteBuf;
use tachyon_core::error::{Errno, KResult};
use tachyon_core::pool::Pool;

use super::path::{PathName, PATH_NAME_MAX_LEN};

/// Capacity of the node pool.
pub const RAM_FS_MAX_NODES: usize = 256;

/// Initial data capacity of a freshly created file.
pub const RAM_FS_DEFAULT_FILE_CAP: usize = 4096;

/// Scratch space for path parsing, including recursive directory creation.
const SCRATCH_LEN: usize = 4 * PATH_NAME_MAX_LEN;

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
}

/// A raw allocation: pointer, fill level, capacity.
#[derive(Clone, Copy)]
struct RawBuf {
    ptr: *mut u8,
    len: usize,
    cap: usize,
}

impl RawBuf {
    const EMPTY: Self = Self {
        ptr: ptr::null_mut(),
        len: 0,
        cap: 0,
    };
}

#[repr(C)]
struct Node {
    kind: NodeKind,
    /// Name bytes; owned by the filesystem's allocator.
    name: RawBuf,
    first_child: *mut Node,
    next_sibling: *mut Node,
    /// File content; unused for directories.
    data: RawBuf,
}

impl Node {
    /// The node's name.
    fn name(&self) -> &str {
        if self.name.ptr.is_null() {
            return "";
        }
        // SAFETY: The name buffer was copied from a valid `str` and is
        // owned by the filesystem.
        unsafe {
            core::str::from_utf8_unchecked(core::slice::from_raw_parts(self.name.ptr, self.name.len))
        }
    }
}

/// Handle to a node of a [`RamFs`]. Only valid with the filesystem that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef(NonNull<Node>);

/// The filesystem.
pub struct RamFs<'a> {
    alloc: &'a dyn RegionAlloc,
    node_pool: Pool,
    node_mem: NonNull<u8>,
    scratch: NonNull<u8>,
    root: *mut Node,
}

// SAFETY: All interior pointers are owned by the filesystem and access is
// serialised by the lock of whoever holds it.
unsafe impl Send for RamFs<'_> {}

impl<'a> RamFs<'a> {
    /// Creates an empty filesystem (just the root directory) drawing its
    /// memory from `alloc`.
    pub fn new(alloc: &'a dyn RegionAlloc) -> KResult<Self> {
        let node_mem_len = RAM_FS_MAX_NODES * core::mem::size_of::<Node>();
        let node_mem = alloc
            .alloc(node_mem_len, core::mem::align_of::<Node>())
            .ok_or(Errno::Enomem)?;
        // SAFETY: The region was just allocated for the pool's exclusive
        // use.
        let mut node_pool =
            unsafe { Pool::new(node_mem.as_ptr(), node_mem_len, core::mem::size_of::<Node>()) };

        let scratch = alloc.alloc(SCRATCH_LEN, 1).ok_or(Errno::Enomem)?;

        // The root exists from the start; creation works against it.
        let root = node_pool.alloc().ok_or(Errno::Enomem)?.as_ptr() as *mut Node;
        // SAFETY: `root` is a zeroed pool block; all fields are written.
        unsafe {
            ptr::addr_of_mut!((*root).kind).write(NodeKind::Dir);
            ptr::addr_of_mut!((*root).name).write(RawBuf::EMPTY);
            ptr::addr_of_mut!((*root).first_child).write(ptr::null_mut());
            ptr::addr_of_mut!((*root).next_sibling).write(ptr::null_mut());
            ptr::addr_of_mut!((*root).data).write(RawBuf::EMPTY);
        }

        Ok(Self {
            alloc,
            node_pool,
            node_mem,
            scratch,
            root,
        })
    }

    /// Fresh arena over the scratch region. One live arena per public
    /// operation; `&mut self` on the mutating entry points enforces that.
    fn scratch_arena(&self) -> Arena<'a> {
        // SAFETY: The scratch region is owned by this filesystem and only
        // one arena exists at a time (see above).
        let slice = unsafe { core::slice::from_raw_parts_mut(self.scratch.as_ptr(), SCRATCH_LEN) };
        Arena::new(slice)
    }

    /// Walks the tree for `path`. `None` when any component is missing or
    /// a file shows up mid-path.
    fn lookup(&self, path: &PathName<'_>) -> Option<*mut Node> {
        let mut curr = self.root;
        for component in path.components() {
            // SAFETY: Tree nodes are live pool blocks.
            let node = unsafe { &*curr };
            if node.kind != NodeKind::Dir {
                // A file cannot have children.
                return None;
            }
            let mut child = node.first_child;
            loop {
                if child.is_null() {
                    return None;
                }
                // SAFETY: As above.
                if unsafe { (*child).name() } == component {
                    break;
                }
                // SAFETY: As above.
                child = unsafe { (*child).next_sibling };
            }
            curr = child;
        }
        Some(curr)
    }

    /// Allocates and initialises a node (no linkage yet).
    fn alloc_node(&mut self, name: &str, kind: NodeKind) -> KResult<*mut Node> {
        let node = self.node_pool.alloc().ok_or(Errno::Enomem)?.as_ptr() as *mut Node;

        let name_buf = if name.is_empty() {
            RawBuf::EMPTY
        } else {
            let ptr = self.alloc.alloc(name.len(), 1).ok_or(Errno::Enomem)?;
            // SAFETY: Fresh allocation of exactly `name.len()` bytes.
            unsafe {
                ptr::copy_nonoverlapping(name.as_ptr(), ptr.as_ptr(), name.len());
            }
            RawBuf {
                ptr: ptr.as_ptr(),
                len: name.len(),
                cap: name.len(),
            }
        };

        // SAFETY: `node` is a zeroed pool block; all fields are written.
        unsafe {
            ptr::addr_of_mut!((*node).kind).write(kind);
            ptr::addr_of_mut!((*node).name).write(name_buf);
            ptr::addr_of_mut!((*node).first_child).write(ptr::null_mut());
            ptr::addr_of_mut!((*node).next_sibling).write(ptr::null_mut());
            ptr::addr_of_mut!((*node).data).write(RawBuf::EMPTY);
        }
        Ok(node)
    }

    /// Shared create path. Recursion (for `recursive` creation of missing
    /// parents) reuses the same arena so parsed paths stay alive.
    fn create_common(
        &mut self,
        path_str: &str,
        kind: NodeKind,
        recursive: bool,
        arena: &Arena<'a>,
    ) -> KResult<*mut Node> {
        let path = PathName::parse(path_str, arena)?;
        if path.is_root() {
            // The root is created with the filesystem.
            return Err(Errno::Eexist);
        }
        let name = path.file_name().unwrap();

        let parent_path = PathName::parse(path.parent_str(), arena)?;
        let parent = match self.lookup(&parent_path) {
            Some(p) => p,
            None => {
                if !recursive {
                    return Err(Errno::Enoent);
                }
                self.create_common(parent_path.as_str(), NodeKind::Dir, true, arena)?
            }
        };

        // SAFETY: `parent` is a live node.
        if unsafe { (*parent).kind } != NodeKind::Dir {
            return Err(Errno::Enotdir);
        }

        // Names within one directory are unique.
        // SAFETY: Child-list nodes are live.
        unsafe {
            let mut child = (*parent).first_child;
            while !child.is_null() {
                if (*child).name() == name {
                    return Err(Errno::Eexist);
                }
                child = (*child).next_sibling;
            }
        }

        let node = self.alloc_node(name, kind)?;

        // Append at the end so directory listings keep insertion order.
        // SAFETY: As above.
        unsafe {
            if (*parent).first_child.is_null() {
                (*parent).first_child = node;
            } else {
                let mut tail = (*parent).first_child;
                while !(*tail).next_sibling.is_null() {
                    tail = (*tail).next_sibling;
                }
                (*tail).next_sibling = node;
            }
        }
        Ok(node)
    }

    /// Creates a directory. With `recursive`, missing intermediate
    /// directories are created too.
    pub fn create_dir(&mut self, path: &str, recursive: bool) -> KResult<NodeRef> {
        let arena = self.scratch_arena();
        let node = self.create_common(path, NodeKind::Dir, recursive, &arena)?;
        Ok(NodeRef(NonNull::new(node).unwrap()))
    }

    /// Creates a file, preallocating its default data capacity.
    pub fn create_file(&mut self, path: &str, recursive: bool) -> KResult<NodeRef> {
        let arena = self.scratch_arena();
        let node = self.create_common(path, NodeKind::File, recursive, &arena)?;

        let data = self
            .alloc
            .alloc(RAM_FS_DEFAULT_FILE_CAP, 1)
            .ok_or(Errno::Enomem)?;
        // SAFETY: `node` is live; the buffer is fresh.
        unsafe {
            (*node).data = RawBuf {
                ptr: data.as_ptr(),
                len: 0,
                cap: RAM_FS_DEFAULT_FILE_CAP,
            };
        }
        Ok(NodeRef(NonNull::new(node).unwrap()))
    }

    /// Opens an existing node by path.
    pub fn open(&mut self, path: &str) -> KResult<NodeRef> {
        let arena = self.scratch_arena();
        let path = PathName::parse(path, &arena)?;
        let node = self.lookup(&path).ok_or(Errno::Enoent)?;
        Ok(NodeRef(NonNull::new(node).unwrap()))
    }

    /// Reads from `offset`, appending at most `min(dst spare capacity,
    /// remaining bytes)` to `dst`. Returns the number of bytes read.
    pub fn read(&self, node: NodeRef, dst: &mut ByteBuf<'_>, offset: usize) -> KResult<usize> {
        // SAFETY: NodeRef handles come from this filesystem.
        let node = unsafe { node.0.as_ref() };
        if node.kind != NodeKind::File {
            return Err(Errno::Einval);
        }
        if offset > node.data.len {
            return Err(Errno::Einval);
        }
        if offset == node.data.len {
            return Ok(0);
        }

        let avail = node.data.len - offset;
        let n = avail.min(dst.spare());
        // SAFETY: `offset + n <= data.len`, within the owned buffer.
        let src = unsafe { core::slice::from_raw_parts(node.data.ptr.add(offset), n) };
        dst.append(src);
        Ok(n)
    }

    /// Writes `src` at `offset`, growing the data buffer by doubling when
    /// needed. `offset` may be at most the current size (writing at the
    /// size appends). Returns the number of bytes written.
    pub fn write(&mut self, node: NodeRef, src: &[u8], offset: usize) -> KResult<usize> {
        // SAFETY: NodeRef handles come from this filesystem.
        let node = unsafe { &mut *node.0.as_ptr() };
        if node.kind != NodeKind::File {
            return Err(Errno::Einval);
        }
        // Files are preallocated at creation.
        debug_assert!(!node.data.ptr.is_null() && node.data.cap != 0);
        if offset > node.data.len {
            return Err(Errno::Einval);
        }

        let end = offset + src.len();
        if end > node.data.cap {
            let mut new_cap = node.data.cap.max(1);
            while new_cap < end {
                new_cap *= 2;
            }
            let new_ptr = self.alloc.alloc(new_cap, 1).ok_or(Errno::Enomem)?;
            // SAFETY: Fresh buffer of `new_cap >= len`; old buffer is the
            // node's own allocation.
            unsafe {
                ptr::copy_nonoverlapping(node.data.ptr, new_ptr.as_ptr(), node.data.len);
                self.alloc
                    .free(NonNull::new_unchecked(node.data.ptr), node.data.cap, 1);
            }
            node.data.ptr = new_ptr.as_ptr();
            node.data.cap = new_cap;
        }

        // SAFETY: `end <= cap` after the growth above.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), node.data.ptr.add(offset), src.len());
        }
        node.data.len = node.data.len.max(end);
        Ok(src.len())
    }

    /// The node's kind.
    pub fn kind(&self, node: NodeRef) -> NodeKind {
        // SAFETY: NodeRef handles come from this filesystem.
        unsafe { node.0.as_ref().kind }
    }

    /// Current size of a file's content.
    pub fn size(&self, node: NodeRef) -> usize {
        // SAFETY: NodeRef handles come from this filesystem.
        unsafe { node.0.as_ref().data.len }
    }
}

impl Drop for RamFs<'_> {
    fn drop(&mut self) {
        /// Frees the name/data buffers of `node` and its descendants.
        /// Children recurse (depth = tree depth); siblings iterate.
        fn release(fs: &RamFs<'_>, mut node: *mut Node) {
            while !node.is_null() {
                // SAFETY: Tree nodes are live until the pool memory goes.
                unsafe {
                    release(fs, (*node).first_child);
                    if !(*node).name.ptr.is_null() {
                        fs.alloc
                            .free(NonNull::new_unchecked((*node).name.ptr), (*node).name.cap, 1);
                    }
                    if !(*node).data.ptr.is_null() {
                        fs.alloc
                            .free(NonNull::new_unchecked((*node).data.ptr), (*node).data.cap, 1);
                    }
                    node = (*node).next_sibling;
                }
            }
        }

        release(self, self.root);
        // SAFETY: Both regions were allocated in `new` with these sizes.
        unsafe {
            self.alloc.free(self.scratch, SCRATCH_LEN, 1);
            self.alloc.free(
                self.node_mem,
                RAM_FS_MAX_NODES * core::mem::size_of::<Node>(),
                core::mem::align_of::<Node>(),
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// [`RegionAlloc`] over the host allocator, for tests.
    pub(crate) struct TestAlloc;

    impl RegionAlloc for TestAlloc {
        fn alloc(&self, n: usize, align: usize) -> Option<NonNull<u8>> {
            let layout = core::alloc::Layout::from_size_align(n.max(1), align.max(1)).ok()?;
            // SAFETY: Non-zero layout.
            NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
        }

        unsafe fn free(&self, ptr: NonNull<u8>, n: usize, align: usize) {
            let layout = core::alloc::Layout::from_size_align(n.max(1), align.max(1)).unwrap();
            // SAFETY: Allocated above with the same layout.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    pub(crate) static TEST_ALLOC: TestAlloc = TestAlloc;

    #[test]
    fn create_write_open_read() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        let file = fs.create_file("/a/b.txt", true).unwrap();
        assert_eq!(fs.write(file, b"hello", 0).unwrap(), 5);

        let again = fs.open("/a/b.txt").unwrap();
        let mut backing = [0u8; 32];
        let mut buf = ByteBuf::new(&mut backing);
        assert_eq!(fs.read(again, &mut buf, 0).unwrap(), 5);
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn open_root_and_missing() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        let root = fs.open("/").unwrap();
        assert_eq!(fs.kind(root), NodeKind::Dir);
        assert_eq!(fs.open("/nope").unwrap_err(), Errno::Enoent);
    }

    #[test]
    fn create_root_fails_with_eexist() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        assert_eq!(fs.create_dir("/", true).unwrap_err(), Errno::Eexist);
    }

    #[test]
    fn duplicate_name_fails() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        fs.create_dir("/etc", false).unwrap();
        assert_eq!(fs.create_dir("/etc", false).unwrap_err(), Errno::Eexist);
        fs.create_file("/etc/motd", false).unwrap();
        assert_eq!(
            fs.create_file("/etc/motd", false).unwrap_err(),
            Errno::Eexist
        );
    }

    #[test]
    fn missing_parent_needs_recursive() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        assert_eq!(
            fs.create_file("/deep/down/file", false).unwrap_err(),
            Errno::Enoent
        );
        fs.create_file("/deep/down/file", true).unwrap();
        let deep = fs.open("/deep").unwrap();
        assert_eq!(fs.kind(deep), NodeKind::Dir);
        let deep_down = fs.open("/deep/down").unwrap();
        assert_eq!(fs.kind(deep_down), NodeKind::Dir);
    }

    #[test]
    fn create_under_file_is_enotdir() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        fs.create_file("/plain", false).unwrap();
        assert_eq!(
            fs.create_file("/plain/child", false).unwrap_err(),
            Errno::Enotdir
        );
    }

    #[test]
    fn read_write_offsets() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        let f = fs.create_file("/f", false).unwrap();
        fs.write(f, b"abcdef", 0).unwrap();
        // Overwrite in the middle.
        fs.write(f, b"XY", 2).unwrap();
        assert_eq!(fs.size(f), 6);

        let mut backing = [0u8; 16];
        let mut buf = ByteBuf::new(&mut backing);
        fs.read(f, &mut buf, 0).unwrap();
        assert_eq!(buf.as_slice(), b"abXYef");

        // Offset past the end is invalid; offset at the end appends.
        assert_eq!(fs.write(f, b"!", 7).unwrap_err(), Errno::Einval);
        fs.write(f, b"!", 6).unwrap();
        assert_eq!(fs.size(f), 7);
        assert_eq!(fs.read(f, &mut ByteBuf::new(&mut [0u8; 1]), 7).unwrap(), 0);
    }

    #[test]
    fn write_grows_capacity_by_doubling() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        let f = fs.create_file("/big", false).unwrap();
        let chunk = vec![0x5Au8; RAM_FS_DEFAULT_FILE_CAP + 1];
        assert_eq!(fs.write(f, &chunk, 0).unwrap(), chunk.len());
        assert_eq!(fs.size(f), chunk.len());

        let mut backing = vec![0u8; chunk.len()];
        let mut buf = ByteBuf::new(&mut backing);
        assert_eq!(fs.read(f, &mut buf, 0).unwrap(), chunk.len());
        assert_eq!(buf.as_slice(), &chunk[..]);
    }

    #[test]
    fn read_from_directory_is_einval() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        let d = fs.create_dir("/dir", false).unwrap();
        let mut backing = [0u8; 4];
        assert_eq!(
            fs.read(d, &mut ByteBuf::new(&mut backing), 0).unwrap_err(),
            Errno::Einval
        );
        assert_eq!(fs.write(d, b"x", 0).unwrap_err(), Errno::Einval);
    }

    #[test]
    fn file_as_intermediate_component_fails_lookup() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        fs.create_file("/leaf", false).unwrap();
        assert_eq!(fs.open("/leaf/below").unwrap_err(), Errno::Enoent);
    }

    #[test]
    fn node_pool_exhaustion_is_enomem() {
        let mut fs = RamFs::new(&TEST_ALLOC).unwrap();
        let mut made = 0usize;
        let mut path_buf = String::new();
        let err = loop {
            path_buf.clear();
            path_buf.push_str("/n");
            path_buf.push_str(&made.to_string());
            match fs.create_dir(&path_buf, false) {
                Ok(_) => made += 1,
                Err(e) => break e,
            }
        };
        assert_eq!(err, Errno::Enomem);
        // Root occupies one pool slot.
        assert_eq!(made, RAM_FS_MAX_NODES - 1);
    }
}
