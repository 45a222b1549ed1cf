//! Per-client file-descriptor table (§4.D): a sparse fd → open-file map, one instance per
//! connected client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::error::{Result, VfsError};
use crate::flags::OpenFlags;
use crate::node::Node;

/// Mutable, per-file state guarded by [`File`]'s own mutex (lock hierarchy position 3,
/// `file->lock`): current seek position and the open-mode bits once `open2` has run.
/// `opened = None` is the `Created` state from §4.F's state machine; only `open2` sets it.
pub(crate) struct FileState {
    pub(crate) pos: u64,
    pub(crate) opened: Option<OpenFlags>,
}

/// One open file. Distinct descriptors created via `dup` share the same `File` (and so the
/// same position and open-mode bits), matching the HelenOS semantics this is modeled on.
pub struct File {
    pub node: Arc<Node>,
    /// Bits inherited at `walk` time from the parent fd (or full `READ|WRITE|APPEND` when
    /// walked from `parentfd = -1`); `open2` may only request a subset of these.
    pub permissions: OpenFlags,
    state: Mutex<FileState>,
    refcount: AtomicU64,
}

impl File {
    fn new(node: Arc<Node>, permissions: OpenFlags) -> Self {
        Self {
            node,
            permissions,
            state: Mutex::new(FileState { pos: 0, opened: None }),
            refcount: AtomicU64::new(1),
        }
    }

    pub async fn position(&self) -> u64 {
        self.state.lock().await.pos
    }

    pub async fn set_position(&self, pos: u64) {
        self.state.lock().await.pos = pos;
    }

    pub async fn opened_mode(&self) -> Option<OpenFlags> {
        self.state.lock().await.opened
    }

    /// `open2`: intersect the caller's requested mode with `permissions`, rejecting with
    /// [`VfsError::PermissionDenied`] on anything outside it. Re-opening an already-`Open`
    /// file only updates the mode bits (idempotent, per §9 "Per-file open state").
    pub async fn open2(&self, requested: OpenFlags) -> Result<()> {
        if requested.bits() & !self.permissions.bits() != 0 {
            return Err(VfsError::PermissionDenied);
        }
        let mut state = self.state.lock().await;
        state.opened = Some(requested);
        Ok(())
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Reset back to the `Created` state, used by `open2` to undo a failed
    /// `VFS_OUT_OPEN_NODE` call.
    pub(crate) async fn clear_opened(&self) {
        self.state.lock().await.opened = None;
    }

    /// Hold the per-file mutex (lock hierarchy position 3) across a whole read/write/seek/
    /// truncate/sync/fstat operation, as §5 requires.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().await
    }
}

/// Sparse fd table for one connected client. Slots are reused greedily (lowest free index
/// first), matching the conventional POSIX `open()` allocation rule the spec calls for.
pub struct FileTable {
    slots: Mutex<Vec<Option<Arc<File>>>>,
    populated: Notify,
}

impl FileTable {
    pub fn new() -> Self {
        Self { slots: Mutex::new(Vec::new()), populated: Notify::new() }
    }

    /// `fd_alloc`: create a new `File` behind `node` with the given inherited permission
    /// bits, and install it at the lowest free descriptor, growing the table if every slot
    /// is occupied.
    pub async fn fd_alloc(&self, node: Arc<Node>, permissions: OpenFlags) -> u32 {
        let file = Arc::new(File::new(node, permissions));
        self.install(file).await
    }

    async fn install(&self, file: Arc<File>) -> u32 {
        let fd = {
            let mut slots = self.slots.lock().await;
            if let Some(free) = slots.iter().position(|slot| slot.is_none()) {
                slots[free] = Some(file);
                free as u32
            } else {
                slots.push(Some(file));
                (slots.len() - 1) as u32
            }
        };
        self.populated.notify_waiters();
        fd
    }

    /// `file_get`: resolve a descriptor to its open file, or [`VfsError::NotFound`] if the
    /// slot is empty or out of range.
    pub async fn file_get(&self, fd: u32) -> Result<Arc<File>> {
        let slots = self.slots.lock().await;
        slots.get(fd as usize).and_then(|slot| slot.clone()).ok_or(VfsError::NotFound)
    }

    /// `fd_free`: drop one reference to the descriptor's file, clearing the slot. Returns
    /// the file so the caller can decide whether to release the underlying node (the last
    /// reference dropping is the caller's cue to call `node_put`).
    pub async fn fd_free(&self, fd: u32) -> Result<Arc<File>> {
        let mut slots = self.slots.lock().await;
        let slot = slots.get_mut(fd as usize).ok_or(VfsError::NotFound)?;
        let file = slot.take().ok_or(VfsError::NotFound)?;
        file.refcount.fetch_sub(1, Ordering::AcqRel);
        Ok(file)
    }

    /// Install `file` directly into a specific slot, growing the table if needed. Used by
    /// `dup(oldfd, newfd)` after the target slot has been vacated with `fd_free`.
    pub async fn fd_assign_at(&self, fd: u32, file: Arc<File>) {
        file.refcount.fetch_add(1, Ordering::AcqRel);
        {
            let mut slots = self.slots.lock().await;
            let idx = fd as usize;
            if slots.len() <= idx {
                slots.resize(idx + 1, None);
            }
            slots[idx] = Some(file);
        }
        self.populated.notify_waiters();
    }

    /// `VFS_IN_WAIT_HANDLE`: block until some descriptor is populated, then return the
    /// lowest one. Used by the program loader to wait for a handle the broker has not yet
    /// assigned (HelenOS `vfs_wait_handle_internal`).
    pub async fn wait_handle(&self) -> u32 {
        loop {
            {
                let slots = self.slots.lock().await;
                if let Some(fd) = slots.iter().position(|slot| slot.is_some()) {
                    return fd as u32;
                }
            }
            self.populated.notified().await;
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_server::{LookupAnswer, NodeAttr, NodeType};
    use crate::node::NodeCache;
    use crate::triplet::{FsHandle, Index, ServiceId, Triplet};

    async fn dummy_node(nodes: &NodeCache) -> Arc<Node> {
        let triplet = Triplet::new(FsHandle(1), ServiceId(1), Index(1));
        nodes
            .node_get(triplet, LookupAnswer { index: Index(1), attr: NodeAttr { node_type: NodeType::Regular, size: 0 } })
            .await
    }

    const READ_ONLY: OpenFlags = OpenFlags::READ;
    const READ_WRITE: OpenFlags = OpenFlags::from_bits_truncate(OpenFlags::READ.bits() | OpenFlags::WRITE.bits());

    #[tokio::test]
    async fn alloc_reuses_lowest_freed_slot() {
        let nodes = NodeCache::new();
        let table = FileTable::new();
        let node = dummy_node(&nodes).await;

        let fd0 = table.fd_alloc(node.clone(), READ_ONLY).await;
        let fd1 = table.fd_alloc(node.clone(), READ_ONLY).await;
        assert_eq!((fd0, fd1), (0, 1));

        table.fd_free(fd0).await.unwrap();
        let fd2 = table.fd_alloc(node.clone(), READ_ONLY).await;
        assert_eq!(fd2, 0);
    }

    #[tokio::test]
    async fn dup_shares_underlying_file_and_position() {
        let nodes = NodeCache::new();
        let table = FileTable::new();
        let node = dummy_node(&nodes).await;

        let fd0 = table.fd_alloc(node, READ_ONLY).await;
        let file = table.file_get(fd0).await.unwrap();
        file.set_position(42).await;

        table.fd_assign_at(1, file.clone()).await;
        let dup_file = table.file_get(1).await.unwrap();
        assert_eq!(dup_file.position().await, 42);
        assert_eq!(dup_file.refcount(), 2);
    }

    #[tokio::test]
    async fn file_get_on_empty_slot_is_not_found() {
        let table = FileTable::new();
        assert_eq!(table.file_get(0).await.err(), Some(VfsError::NotFound));
    }

    #[tokio::test]
    async fn wait_handle_wakes_once_a_descriptor_is_allocated() {
        use std::sync::Arc as StdArc;
        let table = StdArc::new(FileTable::new());
        let waiter_table = table.clone();
        let waiter = tokio::spawn(async move { waiter_table.wait_handle().await });

        tokio::task::yield_now().await;

        let nodes = NodeCache::new();
        let node = dummy_node(&nodes).await;
        let fd = table.fd_alloc(node, READ_ONLY).await;

        assert_eq!(waiter.await.unwrap(), fd);
    }

    #[tokio::test]
    async fn open2_rejects_mode_outside_inherited_permissions() {
        let nodes = NodeCache::new();
        let table = FileTable::new();
        let node = dummy_node(&nodes).await;
        let fd = table.fd_alloc(node, READ_ONLY).await;
        let file = table.file_get(fd).await.unwrap();
        assert_eq!(file.open2(OpenFlags::WRITE).await, Err(VfsError::PermissionDenied));
        assert!(file.open2(OpenFlags::READ).await.is_ok());
    }

    #[tokio::test]
    async fn reopen_is_idempotent_and_only_updates_mode() {
        let nodes = NodeCache::new();
        let table = FileTable::new();
        let node = dummy_node(&nodes).await;
        let fd = table.fd_alloc(node, READ_WRITE).await;
        let file = table.file_get(fd).await.unwrap();
        file.open2(OpenFlags::READ).await.unwrap();
        file.open2(READ_WRITE).await.unwrap();
        assert_eq!(file.opened_mode().await, Some(READ_WRITE));
    }
}
