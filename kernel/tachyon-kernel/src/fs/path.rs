//! Path-name parsing.
//!
//! Only absolute paths exist in this kernel. Parsing validates the input,
//! collapses repeated separators, drops a trailing one, and keeps a
//! normalised copy in caller-provided arena memory; components are string
//! slices into that copy, produced lazily by [`PathName::components`]. The
//! root path `/` has zero components. `.` and `..` are ordinary names at
//! this layer — resolving them is a lookup concern, not a parsing one.

use tachyon_core::arena::Arena;
use tachyon_core::error::{Errno, KResult};

/// Longest accepted path, in bytes.
pub const PATH_NAME_MAX_LEN: usize = 4096;

/// A parsed, normalised path.
#[derive(Debug, Clone, Copy)]
pub struct PathName<'a> {
    /// Normalised form: `/` or `/a/b/c` (no duplicate or trailing
    /// separators).
    src: &'a str,
    is_absolute: bool,
}

impl<'a> PathName<'a> {
    /// Parses `path`, storing the normalised copy in `arena`.
    ///
    /// Empty paths, paths with NUL bytes and relative paths are `EINVAL`;
    /// anything longer than [`PATH_NAME_MAX_LEN`] is `ENAMETOOLONG`.
    pub fn parse(path: &str, arena: &Arena<'a>) -> KResult<Self> {
        if path.is_empty() {
            return Err(Errno::Einval);
        }
        if path.len() > PATH_NAME_MAX_LEN {
            return Err(Errno::Enametoolong);
        }
        if path.contains('\0') {
            return Err(Errno::Einval);
        }
        if !path.starts_with('/') {
            // Relative paths are not supported.
            return Err(Errno::Einval);
        }

        // Build the normalised copy: a leading slash, components joined by
        // single slashes.
        let buf = arena.alloc_bytes(path.len(), 1).ok_or(Errno::Enomem)?;
        let mut len = 0;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            buf[len] = b'/';
            len += 1;
            buf[len..len + component.len()].copy_from_slice(component.as_bytes());
            len += component.len();
        }
        if len == 0 {
            buf[0] = b'/';
            len = 1;
        }

        // SAFETY: The buffer is assembled from slices of a valid `str` and
        // single-byte ASCII separators.
        let src = unsafe { core::str::from_utf8_unchecked(&buf[..len]) };
        Ok(Self {
            src,
            is_absolute: true,
        })
    }

    /// The components, in order. Empty for the root path.
    pub fn components(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        let src = self.src;
        src.split('/').filter(|c| !c.is_empty())
    }

    /// Number of components.
    pub fn component_count(&self) -> usize {
        self.components().count()
    }

    /// `true` for the root path `/`.
    pub fn is_root(&self) -> bool {
        self.src == "/"
    }

    /// `true` for absolute paths (always, currently).
    pub fn is_absolute(&self) -> bool {
        self.is_absolute
    }

    /// The final component, or `None` for the root.
    pub fn file_name(&self) -> Option<&'a str> {
        self.components().last()
    }

    /// The normalised textual form.
    pub fn as_str(&self) -> &'a str {
        self.src
    }

    /// The normalised parent path: `/a/b` for `/a/b/c`, `/` for `/a` and
    /// for `/` itself.
    pub fn parent_str(&self) -> &'a str {
        match self.src.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &self.src[..idx],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_arena<F: FnOnce(&Arena<'_>)>(f: F) {
        let mut backing = vec![0u8; 2 * PATH_NAME_MAX_LEN];
        let arena = Arena::new(&mut backing);
        f(&arena);
    }

    #[test]
    fn root_has_no_components() {
        with_arena(|arena| {
            let p = PathName::parse("/", arena).unwrap();
            assert!(p.is_absolute());
            assert!(p.is_root());
            assert_eq!(p.component_count(), 0);
            assert_eq!(p.as_str(), "/");
            assert!(p.file_name().is_none());
        });
    }

    #[test]
    fn trailing_slash_is_ignored() {
        with_arena(|arena| {
            let p = PathName::parse("/foo/bar/", arena).unwrap();
            let parts: Vec<_> = p.components().collect();
            assert_eq!(parts, ["foo", "bar"]);
        });
    }

    #[test]
    fn duplicate_slashes_collapse() {
        with_arena(|arena| {
            let p = PathName::parse("/foo//bar", arena).unwrap();
            let parts: Vec<_> = p.components().collect();
            assert_eq!(parts, ["foo", "bar"]);
            assert_eq!(p.as_str(), "/foo/bar");
        });
    }

    #[test]
    fn empty_path_is_einval() {
        with_arena(|arena| {
            assert_eq!(PathName::parse("", arena).unwrap_err(), Errno::Einval);
        });
    }

    #[test]
    fn relative_path_is_einval() {
        with_arena(|arena| {
            assert_eq!(PathName::parse("foo/bar", arena).unwrap_err(), Errno::Einval);
        });
    }

    #[test]
    fn nul_byte_is_einval() {
        with_arena(|arena| {
            assert_eq!(PathName::parse("/fo\0o", arena).unwrap_err(), Errno::Einval);
        });
    }

    #[test]
    fn overlong_path_is_enametoolong() {
        // 2049 repetitions of "/a" exceed the limit by two bytes.
        let long: String = "/a".repeat(2049);
        let mut backing = vec![0u8; 8 * PATH_NAME_MAX_LEN];
        let arena = Arena::new(&mut backing);
        assert_eq!(
            PathName::parse(&long, &arena).unwrap_err(),
            Errno::Enametoolong
        );
    }

    #[test]
    fn serialise_reparse_round_trip() {
        with_arena(|arena| {
            for input in ["/", "/a", "/a/b/c", "/x//y/", "/usr/share//fonts/"] {
                let first = PathName::parse(input, arena).unwrap();
                let second = PathName::parse(first.as_str(), arena).unwrap();
                let a: Vec<_> = first.components().collect();
                let b: Vec<_> = second.components().collect();
                assert_eq!(a, b, "round trip of {input}");
                assert_eq!(first.as_str(), second.as_str());
            }
        });
    }

    #[test]
    fn parent_and_file_name() {
        with_arena(|arena| {
            let p = PathName::parse("/a/b/c.txt", arena).unwrap();
            assert_eq!(p.file_name(), Some("c.txt"));
            assert_eq!(p.parent_str(), "/a/b");

            let q = PathName::parse("/top", arena).unwrap();
            assert_eq!(q.parent_str(), "/");
        });
    }

    #[test]
    fn dot_components_are_not_special() {
        with_arena(|arena| {
            let p = PathName::parse("/a/./../b", arena).unwrap();
            let parts: Vec<_> = p.components().collect();
            assert_eq!(parts, ["a", ".", "..", "b"]);
        });
    }
}
