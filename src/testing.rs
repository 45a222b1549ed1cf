//! A tiny, in-memory [`FsServer`] used by the broker's own test suite and by the
//! `tmpfs_demo` example.
//!
//! Grounded on the teacher's `examples/in_memory/filesystem.rs` and
//! `examples/shadow_fs/fs/state.rs`: a `Mutex`-guarded table of entries addressed by a
//! small integer id, with a separate children map per directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Result, VfsError};
use crate::flags::LookupFlags;
use crate::fs_server::{Capabilities, FsServer, LookupAnswer, NodeAttr, NodeType, WriteAnswer};
use crate::triplet::{FsHandle, Index, ServiceId};

const ROOT_INDEX: u64 = 1;

struct Entry {
    node_type: NodeType,
    data: Vec<u8>,
    children: HashMap<String, u64>,
    parent: Option<u64>,
}

impl Entry {
    fn directory(parent: Option<u64>) -> Self {
        Self { node_type: NodeType::Directory, data: Vec::new(), children: HashMap::new(), parent }
    }

    fn regular(parent: Option<u64>) -> Self {
        Self { node_type: NodeType::Regular, data: Vec::new(), children: HashMap::new(), parent }
    }

    fn attr(&self) -> NodeAttr {
        NodeAttr { node_type: self.node_type, size: self.data.len() as u64 }
    }
}

struct State {
    next_index: u64,
    entries: HashMap<u64, Entry>,
}

impl State {
    fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(ROOT_INDEX, Entry::directory(None));
        Self { next_index: ROOT_INDEX + 1, entries }
    }
}

/// In-memory reference file-system server, good enough to drive every broker handler in
/// tests without touching the host disk.
pub struct MemFs {
    fs_handle: FsHandle,
    state: Mutex<State>,
    destroy_calls: AtomicU64,
}

impl MemFs {
    pub fn new(fs_handle: FsHandle) -> Self {
        Self { fs_handle, state: Mutex::new(State::new()), destroy_calls: AtomicU64::new(0) }
    }

    pub fn destroy_calls(&self) -> u64 {
        self.destroy_calls.load(Ordering::Acquire)
    }

    pub fn root_index() -> Index {
        Index(ROOT_INDEX)
    }
}

#[async_trait]
impl FsServer for MemFs {
    fn fs_handle(&self) -> FsHandle {
        self.fs_handle
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn lookup(
        &self,
        _service_id: ServiceId,
        parent: Index,
        name: &str,
        flags: LookupFlags,
    ) -> Result<LookupAnswer> {
        let mut state = self.state.lock().await;

        if name == "." || name.is_empty() {
            let entry = state.entries.get(&parent.0).ok_or(VfsError::NotFound)?;
            return Ok(LookupAnswer { index: parent, attr: entry.attr() });
        }
        if name == ".." {
            let parent_of_parent = state.entries.get(&parent.0).ok_or(VfsError::NotFound)?.parent;
            let target = parent_of_parent.unwrap_or(parent.0);
            let entry = state.entries.get(&target).ok_or(VfsError::NotFound)?;
            return Ok(LookupAnswer { index: Index(target), attr: entry.attr() });
        }

        let parent_entry = state.entries.get(&parent.0).ok_or(VfsError::NotFound)?;
        if parent_entry.node_type != NodeType::Directory {
            return Err(VfsError::InvalidArgument);
        }
        let existing = parent_entry.children.get(name).copied();

        match existing {
            Some(child_index) => {
                if flags.contains(LookupFlags::CREATE) && flags.contains(LookupFlags::EXCLUSIVE) {
                    return Err(VfsError::AlreadyExists);
                }
                let child_type = state.entries.get(&child_index).ok_or(VfsError::NotFound)?.node_type;
                if flags.contains(LookupFlags::FILE) && child_type != NodeType::Regular {
                    return Err(VfsError::InvalidArgument);
                }
                if flags.contains(LookupFlags::DIRECTORY) && child_type != NodeType::Directory {
                    return Err(VfsError::InvalidArgument);
                }
                if flags.contains(LookupFlags::UNLINK) {
                    state.entries.get_mut(&parent.0).unwrap().children.remove(name);
                }
                let entry = state.entries.get(&child_index).unwrap();
                Ok(LookupAnswer { index: Index(child_index), attr: entry.attr() })
            }
            None => {
                if flags.contains(LookupFlags::UNLINK) {
                    return Err(VfsError::NotFound);
                }
                if !flags.contains(LookupFlags::CREATE) {
                    return Err(VfsError::NotFound);
                }
                let new_index = state.next_index;
                state.next_index += 1;
                let new_entry = if flags.contains(LookupFlags::DIRECTORY) {
                    Entry::directory(Some(parent.0))
                } else {
                    Entry::regular(Some(parent.0))
                };
                let attr = new_entry.attr();
                state.entries.insert(new_index, new_entry);
                state.entries.get_mut(&parent.0).unwrap().children.insert(name.to_owned(), new_index);
                Ok(LookupAnswer { index: Index(new_index), attr })
            }
        }
    }

    async fn open_node(&self, _service_id: ServiceId, index: Index) -> Result<()> {
        let state = self.state.lock().await;
        if state.entries.contains_key(&index.0) {
            Ok(())
        } else {
            Err(VfsError::NotFound)
        }
    }

    async fn read(&self, _service_id: ServiceId, index: Index, pos: u64, max: u32) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        let entry = state.entries.get(&index.0).ok_or(VfsError::NotFound)?;
        let pos = pos as usize;
        if pos >= entry.data.len() {
            return Ok(Vec::new());
        }
        let end = (pos + max as usize).min(entry.data.len());
        Ok(entry.data[pos..end].to_vec())
    }

    async fn write(
        &self,
        _service_id: ServiceId,
        index: Index,
        pos: u64,
        data: &[u8],
    ) -> Result<WriteAnswer> {
        let mut state = self.state.lock().await;
        let entry = state.entries.get_mut(&index.0).ok_or(VfsError::NotFound)?;
        let pos = pos as usize;
        if entry.data.len() < pos {
            entry.data.resize(pos, 0);
        }
        let end = pos + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[pos..end].copy_from_slice(data);
        Ok(WriteAnswer { written: data.len() as u32, new_size: entry.data.len() as u64 })
    }

    async fn truncate(&self, _service_id: ServiceId, index: Index, size: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state.entries.get_mut(&index.0).ok_or(VfsError::NotFound)?;
        entry.data.resize(size as usize, 0);
        Ok(())
    }

    async fn sync(&self, _service_id: ServiceId, _index: Index) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self, _service_id: ServiceId, index: Index) -> Result<()> {
        let mut state = self.state.lock().await;
        state.entries.remove(&index.0);
        self.destroy_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn stat(&self, _service_id: ServiceId, index: Index) -> Result<NodeAttr> {
        let state = self.state.lock().await;
        state.entries.get(&index.0).map(Entry::attr).ok_or(VfsError::NotFound)
    }

    async fn link(
        &self,
        _service_id: ServiceId,
        parent: Index,
        name: &str,
        source: Index,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.entries.contains_key(&source.0) {
            return Err(VfsError::NotFound);
        }
        let parent_entry = state.entries.get_mut(&parent.0).ok_or(VfsError::NotFound)?;
        parent_entry.children.insert(name.to_owned(), source.0);
        Ok(())
    }

    async fn mounted(&self, _service_id: ServiceId, _opts: &str) -> Result<LookupAnswer> {
        let state = self.state.lock().await;
        let entry = state.entries.get(&ROOT_INDEX).ok_or(VfsError::NotFound)?;
        Ok(LookupAnswer { index: Index(ROOT_INDEX), attr: entry.attr() })
    }

    async fn mount(
        &self,
        _service_id: ServiceId,
        _mount_point: Index,
        _child_fs: FsHandle,
        child_service: ServiceId,
        child: &Arc<dyn FsServer>,
        opts: &str,
    ) -> Result<LookupAnswer> {
        child.mounted(child_service, opts).await
    }

    async fn unmounted(&self, _service_id: ServiceId) -> Result<()> {
        Ok(())
    }

    async fn unmount(&self, _service_id: ServiceId, _mount_point: Index) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_lookup_round_trips() {
        let fs = MemFs::new(FsHandle(1));
        let created = fs
            .lookup(ServiceId(0), MemFs::root_index(), "a.txt", LookupFlags::CREATE | LookupFlags::FILE)
            .await
            .unwrap();
        let found = fs.lookup(ServiceId(0), MemFs::root_index(), "a.txt", LookupFlags::empty()).await.unwrap();
        assert_eq!(created.index, found.index);
    }

    #[tokio::test]
    async fn exclusive_create_conflicts_on_existing_name() {
        let fs = MemFs::new(FsHandle(1));
        fs.lookup(ServiceId(0), MemFs::root_index(), "a.txt", LookupFlags::CREATE | LookupFlags::FILE)
            .await
            .unwrap();
        let err = fs
            .lookup(
                ServiceId(0),
                MemFs::root_index(),
                "a.txt",
                LookupFlags::CREATE | LookupFlags::EXCLUSIVE | LookupFlags::FILE,
            )
            .await
            .unwrap_err();
        assert_eq!(err, VfsError::AlreadyExists);
    }

    #[tokio::test]
    async fn unlink_removes_name_but_destroy_is_separate() {
        let fs = MemFs::new(FsHandle(1));
        let created = fs
            .lookup(ServiceId(0), MemFs::root_index(), "a.txt", LookupFlags::CREATE | LookupFlags::FILE)
            .await
            .unwrap();
        fs.lookup(ServiceId(0), MemFs::root_index(), "a.txt", LookupFlags::UNLINK).await.unwrap();
        assert!(fs
            .lookup(ServiceId(0), MemFs::root_index(), "a.txt", LookupFlags::empty())
            .await
            .is_err());
        // The object itself is still reachable by index until destroy() is called.
        assert!(fs.stat(ServiceId(0), created.index).await.is_ok());
        fs.destroy(ServiceId(0), created.index).await.unwrap();
        assert_eq!(fs.destroy_calls(), 1);
    }
}
