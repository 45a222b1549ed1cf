//! Identity of every object referenced through the broker: the [`Triplet`].

use std::fmt;

/// Opaque handle identifying a registered file-system server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsHandle(pub u32);

/// Backing device served by a file-system server (one server may host several).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u32);

/// Object index within a `(fs_handle, service_id)` device, assigned by the owning server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Index(pub u64);

/// Primary key of every cached object: `(fs_handle, service_id, index)`.
///
/// `fs_handle` identifies the file-system *server*, `service_id` the backing device
/// (the same server may host several), `index` the object within it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Triplet {
    pub fs_handle: FsHandle,
    pub service_id: ServiceId,
    pub index: Index,
}

impl Triplet {
    pub fn new(fs_handle: FsHandle, service_id: ServiceId, index: Index) -> Self {
        Self { fs_handle, service_id, index }
    }
}

impl fmt::Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.fs_handle.0, self.service_id.0, self.index.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triplets_with_same_fields_are_equal() {
        let a = Triplet::new(FsHandle(1), ServiceId(2), Index(3));
        let b = Triplet::new(FsHandle(1), ServiceId(2), Index(3));
        assert_eq!(a, b);
    }

    #[test]
    fn triplets_differing_in_index_are_distinct() {
        let a = Triplet::new(FsHandle(1), ServiceId(2), Index(3));
        let b = Triplet::new(FsHandle(1), ServiceId(2), Index(4));
        assert_ne!(a, b);
    }
}
