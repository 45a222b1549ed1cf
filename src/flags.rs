//! Resolver flags (`L_*`) and the public walk-request flags (`WALK_*`) that map onto them.

use crate::error::{Result, VfsError};

/// Minimal bitflags-style macro, kept local so the broker does not pull in the `bitflags`
/// crate for two small, fixed sets of flags.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(
                $(#[$field_meta:meta])*
                const $field:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
        pub struct $name($ty);

        impl $name {
            $(
                $(#[$field_meta])*
                pub const $field: Self = Self($value);
            )*

            /// The empty flag set.
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Whether `self` contains every bit set in `other`.
            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Raw bit representation.
            pub const fn bits(&self) -> $ty {
                self.0
            }

            /// Build a flag set from raw bits.
            pub const fn from_bits_truncate(bits: $ty) -> Self {
                Self(bits)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }
    };
}

bitflags_like! {
    /// Internal flags passed to the FS-server lookup protocol.
    pub struct LookupFlags: u32 {
        /// Create the terminal name if it is absent.
        const CREATE = 1 << 0;
        /// Combined with `CREATE`, fail if the terminal name already exists.
        const EXCLUSIVE = 1 << 1;
        /// The terminal name must resolve to a regular file.
        const FILE = 1 << 2;
        /// The terminal name must resolve to a directory.
        const DIRECTORY = 1 << 3;
        /// Resolve to the mount-point node itself rather than the mounted root.
        const MP = 1 << 4;
        /// Atomically unlink the terminal name on a successful resolve.
        const UNLINK = 1 << 5;
        /// Never substitute a mounted root for a mount-point triplet.
        const DISABLE_MOUNTS = 1 << 6;
    }
}

bitflags_like! {
    /// Flags accepted on the public `VFS_IN_WALK` surface.
    pub struct WalkFlags: u32 {
        const MAY_CREATE = 1 << 0;
        const MUST_CREATE = 1 << 1;
        const REGULAR = 1 << 2;
        const DIRECTORY = 1 << 3;
    }
}

bitflags_like! {
    /// Permission bits carried on a descriptor from the moment it is created by `walk`
    /// (inherited from the parent fd, or full `READ | WRITE | APPEND` when `parentfd = -1`)
    /// and requested again, as a subset, by `VFS_IN_OPEN` (§4.F `open2`, GLOSSARY
    /// "Permission bits").
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
    }
}

/// Expand and validate public [`WalkFlags`] into internal [`LookupFlags`].
///
/// `MAY_CREATE`/`MUST_CREATE` are mutually exclusive; `REGULAR`/`DIRECTORY` are mutually
/// exclusive; requesting either create variant requires one of the kind flags.
pub fn walk_to_lookup(flags: WalkFlags) -> Result<LookupFlags> {
    let may_create = flags.contains(WalkFlags::MAY_CREATE);
    let must_create = flags.contains(WalkFlags::MUST_CREATE);
    if may_create && must_create {
        return Err(VfsError::InvalidArgument);
    }

    let wants_file = flags.contains(WalkFlags::REGULAR);
    let wants_dir = flags.contains(WalkFlags::DIRECTORY);
    if wants_file && wants_dir {
        return Err(VfsError::InvalidArgument);
    }

    if (may_create || must_create) && !(wants_file || wants_dir) {
        return Err(VfsError::InvalidArgument);
    }

    let mut out = LookupFlags::empty();
    if may_create {
        out |= LookupFlags::CREATE;
    }
    if must_create {
        out |= LookupFlags::CREATE | LookupFlags::EXCLUSIVE;
    }
    if wants_file {
        out |= LookupFlags::FILE;
    }
    if wants_dir {
        out |= LookupFlags::DIRECTORY;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn may_create_and_must_create_conflict() {
        let flags = WalkFlags::MAY_CREATE | WalkFlags::MUST_CREATE | WalkFlags::REGULAR;
        assert_eq!(walk_to_lookup(flags), Err(VfsError::InvalidArgument));
    }

    #[test]
    fn file_and_directory_conflict() {
        let flags = WalkFlags::REGULAR | WalkFlags::DIRECTORY;
        assert_eq!(walk_to_lookup(flags), Err(VfsError::InvalidArgument));
    }

    #[test]
    fn create_without_kind_is_invalid() {
        let flags = WalkFlags::MAY_CREATE;
        assert_eq!(walk_to_lookup(flags), Err(VfsError::InvalidArgument));
    }

    #[test]
    fn must_create_regular_expands_to_create_exclusive_file() {
        let flags = WalkFlags::MUST_CREATE | WalkFlags::REGULAR;
        let lookup = walk_to_lookup(flags).unwrap();
        assert!(lookup.contains(LookupFlags::CREATE));
        assert!(lookup.contains(LookupFlags::EXCLUSIVE));
        assert!(lookup.contains(LookupFlags::FILE));
        assert!(!lookup.contains(LookupFlags::DIRECTORY));
    }

    #[test]
    fn plain_walk_has_no_create_bits() {
        let lookup = walk_to_lookup(WalkFlags::empty()).unwrap();
        assert_eq!(lookup, LookupFlags::empty());
    }
}
