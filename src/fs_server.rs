//! The `VFS_OUT_*` contract a file-system server answers.
//!
//! File-system servers (ext4, FAT, tmpfs, …) are out of scope for this repository — they
//! are back-end actors reached only through this trait. The shape mirrors the teacher's
//! own `Vfs` trait (one async method per backend operation), renamed to the broker's
//! `VFS_OUT_*` vocabulary and carrying `(service_id, index)` rather than an opaque UID,
//! per §3/§6.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::flags::LookupFlags;
use crate::triplet::{FsHandle, Index, ServiceId};

/// Kind of a cached object, as reported by its owning server.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeType {
    Regular,
    Directory,
    Symlink,
}

/// Authoritative size/type pair a server reports for an object.
#[derive(Debug, Copy, Clone)]
pub struct NodeAttr {
    pub node_type: NodeType,
    pub size: u64,
}

/// Answer to `VFS_OUT_LOOKUP`, `VFS_OUT_MOUNTED`: the resolved index plus its attributes.
#[derive(Debug, Copy, Clone)]
pub struct LookupAnswer {
    pub index: Index,
    pub attr: NodeAttr,
}

/// Answer to `VFS_OUT_WRITE`.
#[derive(Debug, Copy, Clone)]
pub struct WriteAnswer {
    pub written: u32,
    pub new_size: u64,
}

/// Capability bits a server advertises to the registry (§4.G).
#[derive(Debug, Copy, Clone, Default)]
pub struct Capabilities {
    /// The server allows concurrent readers and writers on the same object without the
    /// broker serializing through the node's `contents_rwlock` in write mode.
    pub concurrent_read_write: bool,
    /// A write never changes the file's size as observed by a concurrent reader (e.g. the
    /// server pre-allocates or the write always lands within the current size).
    pub write_retains_size: bool,
}

/// One back-end file-system server, addressed by the broker as a client of `VFS_OUT_*`.
#[async_trait]
pub trait FsServer: Send + Sync {
    /// The handle this server was registered under.
    fn fs_handle(&self) -> FsHandle;

    /// Capability bits used by the read/write handler to pick a lock mode (§4.F).
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// `VFS_OUT_LOOKUP` — resolve one path component inside a directory, applying
    /// create/exclusive/unlink/directory semantics atomically in the server's namespace.
    async fn lookup(
        &self,
        service_id: ServiceId,
        parent: Index,
        name: &str,
        flags: LookupFlags,
    ) -> Result<LookupAnswer>;

    /// `VFS_OUT_OPEN_NODE`.
    async fn open_node(&self, service_id: ServiceId, index: Index) -> Result<()>;

    /// `VFS_OUT_READ`. Returns the bytes actually transferred.
    async fn read(
        &self,
        service_id: ServiceId,
        index: Index,
        pos: u64,
        max: u32,
    ) -> Result<Vec<u8>>;

    /// `VFS_OUT_WRITE`.
    async fn write(
        &self,
        service_id: ServiceId,
        index: Index,
        pos: u64,
        data: &[u8],
    ) -> Result<WriteAnswer>;

    /// `VFS_OUT_TRUNCATE`.
    async fn truncate(&self, service_id: ServiceId, index: Index, size: u64) -> Result<()>;

    /// `VFS_OUT_SYNC`.
    async fn sync(&self, service_id: ServiceId, index: Index) -> Result<()>;

    /// `VFS_OUT_DESTROY` — fired on refcount reaching zero for an unlinked node.
    async fn destroy(&self, service_id: ServiceId, index: Index) -> Result<()>;

    /// `VFS_OUT_STAT`.
    async fn stat(&self, service_id: ServiceId, index: Index) -> Result<NodeAttr>;

    /// `VFS_OUT_LINK` — link `source` at `name` inside `parent`.
    async fn link(
        &self,
        service_id: ServiceId,
        parent: Index,
        name: &str,
        source: Index,
    ) -> Result<()>;

    /// `VFS_OUT_MOUNTED` — this server is being mounted as the global root.
    async fn mounted(&self, service_id: ServiceId, opts: &str) -> Result<LookupAnswer>;

    /// `VFS_OUT_MOUNT` — a child file system is being grafted onto `mount_point`. The
    /// child's exchange is cloned onto this call so the mount-point's own server can reach
    /// it directly; the answer carries the child's mounted-root index/attr, exactly as the
    /// child would have answered its own `VFS_OUT_MOUNTED` — the broker never calls that on
    /// the child itself for a non-root mount.
    async fn mount(
        &self,
        service_id: ServiceId,
        mount_point: Index,
        child_fs: FsHandle,
        child_service: ServiceId,
        child: &Arc<dyn FsServer>,
        opts: &str,
    ) -> Result<LookupAnswer>;

    /// `VFS_OUT_UNMOUNTED` — this server's root is being unmounted.
    async fn unmounted(&self, service_id: ServiceId) -> Result<()>;

    /// `VFS_OUT_UNMOUNT` — a child file system mounted at `mount_point` is going away.
    async fn unmount(&self, service_id: ServiceId, mount_point: Index) -> Result<()>;
}
