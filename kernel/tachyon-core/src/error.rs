//! Kernel error codes and the result alias used throughout the tree.
//!
//! Errors are a small errno subset carried as a plain enum. Fallible
//! operations return [`KResult`] and propagate with `?`; the numeric values
//! are what the syscall layer hands to user space (negated).

use core::fmt;

/// Numeric kernel error code (errno subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// No such file or directory.
    Enoent = 2,
    /// I/O error.
    Eio = 5,
    /// Resource temporarily unavailable.
    Eagain = 11,
    /// Out of memory.
    Enomem = 12,
    /// Entry already exists.
    Eexist = 17,
    /// No such device.
    Enodev = 19,
    /// Not a directory.
    Enotdir = 20,
    /// Invalid argument.
    Einval = 22,
    /// File name too long.
    Enametoolong = 36,
    /// No buffer space available.
    Enobufs = 105,
    /// No route to host.
    Ehostunreach = 113,
}

impl Errno {
    /// Returns the numeric errno value.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Returns the conventional symbolic name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Enoent => "ENOENT",
            Self::Eio => "EIO",
            Self::Eagain => "EAGAIN",
            Self::Enomem => "ENOMEM",
            Self::Eexist => "EEXIST",
            Self::Enodev => "ENODEV",
            Self::Enotdir => "ENOTDIR",
            Self::Einval => "EINVAL",
            Self::Enametoolong => "ENAMETOOLONG",
            Self::Enobufs => "ENOBUFS",
            Self::Ehostunreach => "EHOSTUNREACH",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Result alias carrying an [`Errno`] on failure.
pub type KResult<T> = Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_codes() {
        // The syscall ABI pins these three values.
        assert_eq!(Errno::Eio.code(), 5);
        assert_eq!(Errno::Enomem.code(), 12);
        assert_eq!(Errno::Einval.code(), 22);
    }

    #[test]
    fn display_includes_name_and_code() {
        let s = format!("{}", Errno::Ehostunreach);
        assert!(s.contains("EHOSTUNREACH"));
        assert!(s.contains("113"));
    }
}
