//! Error taxonomy shared by every broker component.
//!
//! A flat kind enum rather than kernel-style numeric codes; handlers translate a
//! [`VfsError`] to the wire-level reply code at the dispatcher boundary
//! (see [`crate::transport`]).

use std::fmt;

/// Result alias used throughout the broker.
pub type Result<T> = std::result::Result<T, VfsError>;

/// Broker-wide error kinds (§7).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VfsError {
    /// Name/path/descriptor absent.
    NotFound,
    /// Bad flag combination, negative `SEEK_SET` offset, rename prefix violation, write to
    /// a directory, walk flags requesting both create variants, …
    InvalidArgument,
    /// Requested open mode not allowed by the permission bits carried on the descriptor.
    PermissionDenied,
    /// Mount root over root, or unmount of a mount still in use.
    Busy,
    /// An exclusive-create or a non-displaced rename target found a name already taken.
    ///
    /// Not in the distilled taxonomy of §7 verbatim, but required to report `L_EXCLUSIVE`
    /// conflicts distinctly from `InvalidArgument` — see DESIGN.md "Open questions resolved".
    AlreadyExists,
    /// Signed offset arithmetic would wrap.
    Overflow,
    /// Node or record allocation failed.
    OutOfMemory,
    /// Pinged with no matching `fs_name`, or an unexpected follow-up method arrived.
    Unsupported,
    /// The owning file-system server reported a failure.
    IoError,
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            VfsError::NotFound => "no such file or directory",
            VfsError::InvalidArgument => "invalid argument",
            VfsError::PermissionDenied => "permission denied",
            VfsError::Busy => "resource busy",
            VfsError::AlreadyExists => "file exists",
            VfsError::Overflow => "value too large",
            VfsError::OutOfMemory => "out of memory",
            VfsError::Unsupported => "operation not supported",
            VfsError::IoError => "I/O error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for VfsError {}
