//! The broker (§4.F, §5): owns every shared table and implements one method per
//! `VFS_IN_*` request, taking locks in the order §5 prescribes.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::config::BrokerConfig;
use crate::error::{Result, VfsError};
use crate::file_table::{File, FileTable};
use crate::flags::{walk_to_lookup, LookupFlags, OpenFlags, WalkFlags};
use crate::fs_server::{NodeAttr, NodeType};
use crate::mount_table::{MountEntry, MountTable};
use crate::node::{Node, NodeCache};
use crate::registry::FsRegistry;
use crate::resolver::Resolver;
use crate::triplet::Triplet;

/// `SEEK_*` whence values for `VFS_IN_SEEK`.
#[derive(Debug, Copy, Clone)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// One row of the mtab snapshot, mirrored alongside the mount table under its own lock
/// (hierarchy position 5, orthogonal to everything above it).
#[derive(Debug, Clone)]
pub struct MtabRow {
    pub mount_point_path: String,
    pub options: String,
    pub fs_name: String,
    pub instance: u32,
    pub service_id: crate::triplet::ServiceId,
}

/// The broker process's global state: namespace lock, mount table, node cache, and
/// FS-server registry. One instance serves every connected client; each client brings its
/// own [`FileTable`].
pub struct Broker {
    pub namespace_rwlock: RwLock<()>,
    pub mounts: MountTable,
    pub nodes: NodeCache,
    pub registry: FsRegistry,
    mtab_rows: Mutex<Vec<MtabRow>>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            namespace_rwlock: RwLock::new(()),
            mounts: MountTable::new(),
            nodes: NodeCache::new(),
            registry: FsRegistry::new(),
            mtab_rows: Mutex::new(Vec::new()),
            config,
        }
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.mounts, &self.nodes, &self.registry)
    }

    /// §6 size limits: reject an over-length path/opts/fs_name before it reaches a
    /// resolver or registry lookup, rather than relying on the backend to notice.
    fn check_len(len: usize, max: usize) -> Result<()> {
        if len > max {
            Err(VfsError::InvalidArgument)
        } else {
            Ok(())
        }
    }

    async fn root_node(&self) -> Result<Arc<Node>> {
        let root_entry = self.mounts.root().await.ok_or(VfsError::NotFound)?;
        self.nodes.peek(root_entry.mounted_root).await.ok_or(VfsError::NotFound)
    }

    async fn push_mtab_row(&self, row: MtabRow) {
        self.mtab_rows.lock().await.push(row);
    }

    async fn pop_mtab_row(&self, mount_point_path: &str) {
        let mut rows = self.mtab_rows.lock().await;
        rows.retain(|row| row.mount_point_path != mount_point_path);
    }

    /// `VFS_IN_MOUNT`. `blocking` corresponds to `IPC_FLAG_BLOCKING` (§4.F step 2).
    pub async fn mount(
        &self,
        service_id: crate::triplet::ServiceId,
        instance: u32,
        blocking: bool,
        mp: &str,
        opts: &str,
        fs_name: &str,
    ) -> Result<()> {
        Self::check_len(mp.len(), self.config.max_path_len)?;
        Self::check_len(opts.len(), self.config.max_mntopts_len)?;
        Self::check_len(fs_name.len(), self.config.fs_name_maxlen)?;

        let child_entry = loop {
            match self.registry.name_to_handle(instance, fs_name).await {
                Some(entry) => break entry,
                None if blocking => self.registry.wait_for_registration().await,
                None => return Err(VfsError::NotFound),
            }
        };

        let _guard = self.namespace_rwlock.write().await;

        if !self.mounts.has_root().await {
            if mp != "/" {
                return Err(VfsError::NotFound);
            }
            let answer = child_entry.server.mounted(service_id, opts).await?;
            let root_triplet = Triplet::new(child_entry.fs_handle, service_id, answer.index);
            self.nodes.node_get(root_triplet, answer).await;
            self.mounts
                .mount_add(MountEntry {
                    mount_point: None,
                    mounted_root: root_triplet,
                    mount_point_path: mp.to_owned(),
                    options: opts.to_owned(),
                    fs_name: fs_name.to_owned(),
                    instance,
                    service_id,
                })
                .await?;
            self.push_mtab_row(MtabRow {
                mount_point_path: mp.to_owned(),
                options: opts.to_owned(),
                fs_name: fs_name.to_owned(),
                instance,
                service_id,
            })
            .await;
            return Ok(());
        }

        if mp == "/" {
            return Err(VfsError::Busy);
        }

        let root = self.root_node().await?;
        let resolved = self.resolver().lookup(&root, mp, LookupFlags::DIRECTORY).await?;
        let mp_node = resolved.node;
        let mp_triplet = mp_node.triplet;

        let outcome: Result<Triplet> = async {
            let mp_entry = self.registry.by_handle(mp_triplet.fs_handle).await.ok_or(VfsError::NotFound)?;
            let answer = mp_entry
                .server
                .mount(mp_triplet.service_id, mp_triplet.index, child_entry.fs_handle, service_id, &child_entry.server, opts)
                .await?;
            let child_root_triplet = Triplet::new(child_entry.fs_handle, service_id, answer.index);

            self.nodes.node_get(child_root_triplet, answer).await;
            Ok(child_root_triplet)
        }
        .await;

        match outcome {
            Ok(child_root_triplet) => {
                self.mounts
                    .mount_add(MountEntry {
                        mount_point: Some(mp_triplet),
                        mounted_root: child_root_triplet,
                        mount_point_path: mp.to_owned(),
                        options: opts.to_owned(),
                        fs_name: fs_name.to_owned(),
                        instance,
                        service_id,
                    })
                    .await?;
                self.push_mtab_row(MtabRow {
                    mount_point_path: mp.to_owned(),
                    options: opts.to_owned(),
                    fs_name: fs_name.to_owned(),
                    instance,
                    service_id,
                })
                .await;
                Ok(())
            }
            Err(err) => {
                self.nodes.node_put(&mp_node, &self.registry).await?;
                Err(err)
            }
        }
    }

    /// `VFS_IN_UNMOUNT`.
    pub async fn unmount(&self, mp: &str) -> Result<()> {
        let _guard = self.namespace_rwlock.write().await;
        if !self.mounts.has_root().await {
            return Err(VfsError::NotFound);
        }

        let root = self.root_node().await?;
        let mounted = self.resolver().lookup(&root, mp, LookupFlags::empty()).await?;
        let mounted_triplet = mounted.node.triplet;

        if self.nodes.refcount_sum(mounted_triplet.fs_handle, mounted_triplet.service_id).await != 2 {
            self.nodes.node_put(&mounted.node, &self.registry).await?;
            return Err(VfsError::Busy);
        }

        if mp == "/" {
            let entry = self.registry.by_handle(mounted_triplet.fs_handle).await.ok_or(VfsError::NotFound)?;
            entry.server.unmounted(mounted_triplet.service_id).await?;
            self.mounts.mount_remove(None).await;
        } else {
            let mp_resolved = self.resolver().lookup(&root, mp, LookupFlags::MP).await?;
            let mp_triplet = mp_resolved.node.triplet;
            let entry = self.registry.by_handle(mp_triplet.fs_handle).await.ok_or(VfsError::NotFound)?;
            entry.server.unmount(mp_triplet.service_id, mp_triplet.index).await?;
            self.mounts.mount_remove(Some(mp_triplet)).await;
            // One release for this resolve's own reference, one for the mount table's hold
            // installed back in `mount()`.
            self.nodes.node_forget(&mp_resolved.node).await;
            self.nodes.node_forget(&mp_resolved.node).await;
        }

        self.pop_mtab_row(mp).await;
        self.nodes.node_forget(&mounted.node).await;
        self.nodes.node_forget(&mounted.node).await;
        Ok(())
    }

    /// `VFS_IN_WALK`. `parent` is `None` for `parentfd = -1`.
    pub async fn walk(&self, files: &FileTable, parent: Option<&Arc<File>>, flags: WalkFlags, path: &str) -> Result<u32> {
        Self::check_len(path.len(), self.config.max_path_len)?;
        let lookup_flags = walk_to_lookup(flags)?;
        let _guard = self.namespace_rwlock.read().await;

        let base = match parent {
            Some(file) => file.node.clone(),
            None => self.root_node().await?,
        };

        let result = self.resolver().lookup(&base, path, lookup_flags).await?;
        if result.trailing_slash && result.node.node_type != NodeType::Directory {
            self.nodes.node_put(&result.node, &self.registry).await?;
            return Err(VfsError::InvalidArgument);
        }

        let permissions = match parent {
            Some(file) => file.permissions,
            None => OpenFlags::READ | OpenFlags::WRITE | OpenFlags::APPEND,
        };
        Ok(files.fd_alloc(result.node, permissions).await)
    }

    /// `VFS_IN_OPEN` (`open2`).
    pub async fn open2(&self, file: &Arc<File>, requested: OpenFlags) -> Result<()> {
        if requested.contains(OpenFlags::WRITE) && file.node.node_type == NodeType::Directory {
            return Err(VfsError::InvalidArgument);
        }
        let was_open = file.opened_mode().await.is_some();
        file.open2(requested).await?;
        if was_open {
            return Ok(());
        }

        let entry = self.registry.by_handle(file.node.triplet.fs_handle).await.ok_or(VfsError::NotFound)?;
        match entry.server.open_node(file.node.triplet.service_id, file.node.triplet.index).await {
            Ok(()) => Ok(()),
            Err(err) => {
                file.clear_opened().await;
                Err(err)
            }
        }
    }

    /// `VFS_IN_READ`.
    pub async fn read(&self, file: &Arc<File>, max: u32) -> Result<Vec<u8>> {
        let is_directory = file.node.node_type == NodeType::Directory;
        let _ns_guard = if is_directory { Some(self.namespace_rwlock.read().await) } else { None };

        let mut state = file.lock().await;
        let opened = state.opened.ok_or(VfsError::InvalidArgument)?;
        if !opened.contains(OpenFlags::READ) {
            return Err(VfsError::InvalidArgument);
        }

        let _contents_guard = file.node.contents_rwlock.read().await;

        let entry = self.registry.by_handle(file.node.triplet.fs_handle).await.ok_or(VfsError::NotFound)?;
        let pos = state.pos;
        let data = entry.server.read(file.node.triplet.service_id, file.node.triplet.index, pos, max).await?;
        state.pos = pos + data.len() as u64;
        Ok(data)
    }

    /// `VFS_IN_WRITE`.
    pub async fn write(&self, file: &Arc<File>, data: &[u8]) -> Result<u32> {
        let mut state = file.lock().await;
        let opened = state.opened.ok_or(VfsError::InvalidArgument)?;
        if !opened.contains(OpenFlags::WRITE) {
            return Err(VfsError::InvalidArgument);
        }
        if file.node.node_type == NodeType::Directory {
            return Err(VfsError::InvalidArgument);
        }

        let entry = self.registry.by_handle(file.node.triplet.fs_handle).await.ok_or(VfsError::NotFound)?;
        let caps = entry.capabilities;
        let concurrent_safe = caps.concurrent_read_write && caps.write_retains_size;
        let append = opened.contains(OpenFlags::APPEND);

        let (pos, answer) = if concurrent_safe {
            let _contents_guard = file.node.contents_rwlock.read().await;
            if append {
                state.pos = file.node.size();
            }
            let pos = state.pos;
            let answer = entry.server.write(file.node.triplet.service_id, file.node.triplet.index, pos, data).await?;
            (pos, answer)
        } else {
            let _contents_guard = file.node.contents_rwlock.write().await;
            if append {
                state.pos = file.node.size();
            }
            let pos = state.pos;
            let answer = entry.server.write(file.node.triplet.service_id, file.node.triplet.index, pos, data).await?;
            file.node.set_size(answer.new_size);
            (pos, answer)
        };

        state.pos = pos + answer.written as u64;
        Ok(answer.written)
    }

    /// `VFS_IN_SEEK`.
    pub async fn seek(&self, file: &Arc<File>, offset: i64, whence: SeekWhence) -> Result<u64> {
        let mut state = file.lock().await;
        let new_pos = match whence {
            SeekWhence::Set => {
                if offset < 0 {
                    return Err(VfsError::InvalidArgument);
                }
                offset as u64
            }
            SeekWhence::Cur => checked_offset(state.pos, offset, false)?,
            SeekWhence::End => {
                let size = {
                    let _g = file.node.contents_rwlock.read().await;
                    file.node.size()
                };
                checked_offset(size, offset, true)?
            }
        };
        state.pos = new_pos;
        Ok(new_pos)
    }

    /// `VFS_IN_TRUNCATE`.
    pub async fn truncate(&self, file: &Arc<File>, size: u64) -> Result<()> {
        let _state = file.lock().await;
        let entry = self.registry.by_handle(file.node.triplet.fs_handle).await.ok_or(VfsError::NotFound)?;
        let _contents_guard = file.node.contents_rwlock.write().await;
        entry.server.truncate(file.node.triplet.service_id, file.node.triplet.index, size).await?;
        file.node.set_size(size);
        Ok(())
    }

    /// `VFS_IN_FSTAT`.
    pub async fn fstat(&self, file: &Arc<File>) -> Result<NodeAttr> {
        let _state = file.lock().await;
        let entry = self.registry.by_handle(file.node.triplet.fs_handle).await.ok_or(VfsError::NotFound)?;
        entry.server.stat(file.node.triplet.service_id, file.node.triplet.index).await
    }

    /// `VFS_IN_UNLINK` (`unlink2`). `expect` is the file behind `expectfd`, if provided.
    pub async fn unlink2(&self, base: &Arc<Node>, expect: Option<&Arc<File>>, directory: bool, path: &str) -> Result<()> {
        Self::check_len(path.len(), self.config.max_path_len)?;
        let _guard = self.namespace_rwlock.write().await;
        let resolver = self.resolver();

        if let Some(expect_file) = expect {
            let probe = resolver.lookup(base, path, LookupFlags::empty()).await?;
            let matches = probe.node.triplet == expect_file.node.triplet;
            self.nodes.node_put(&probe.node, &self.registry).await?;
            if !matches {
                return Err(VfsError::NotFound);
            }
        }

        let mut flags = LookupFlags::UNLINK;
        if directory {
            flags |= LookupFlags::DIRECTORY;
        }
        let result = resolver.lookup(base, path, flags).await?;
        result.node.mark_unlinked();
        self.nodes.node_put(&result.node, &self.registry).await
    }

    /// `VFS_IN_RENAME`. Follows §9's shared-prefix algorithm: resolve down to the directory
    /// shared by both names, then to each name's own immediate parent (which may coincide
    /// with the shared prefix, or with each other), so the final `VFS_OUT_LINK` call always
    /// gets a real parent index and a single leaf name — never a multi-component path.
    pub async fn rename(&self, base: &Arc<Node>, old: &str, new: &str) -> Result<()> {
        Self::check_len(old.len(), self.config.max_path_len)?;
        Self::check_len(new.len(), self.config.max_path_len)?;
        if old != new && (is_proper_prefix(old, new) || is_proper_prefix(new, old)) {
            return Err(VfsError::InvalidArgument);
        }

        let shared_len = shared_prefix_len(old, new);
        let (old_parent_rel, old_leaf) = split_leaf(&old[shared_len..]);
        let (new_parent_rel, new_leaf) = split_leaf(&new[shared_len..]);

        let _guard = self.namespace_rwlock.write().await;
        let resolver = self.resolver();

        let mut owned: Vec<Arc<Node>> = Vec::new();

        let prefix_node = if shared_len == 0 {
            base.clone()
        } else {
            match resolver.lookup(base, &old[..shared_len], LookupFlags::DIRECTORY | LookupFlags::DISABLE_MOUNTS).await {
                Ok(result) => {
                    owned.push(result.node.clone());
                    result.node
                }
                Err(err) => return Err(err),
            }
        };

        let old_parent = match old_parent_rel {
            None => prefix_node.clone(),
            Some(rel) => match resolver.lookup(&prefix_node, rel, LookupFlags::DIRECTORY | LookupFlags::DISABLE_MOUNTS).await {
                Ok(result) => {
                    owned.push(result.node.clone());
                    result.node
                }
                Err(err) => {
                    self.release_rename_refs(owned).await;
                    return Err(err);
                }
            },
        };
        let new_parent = match new_parent_rel {
            None => prefix_node.clone(),
            Some(rel) => match resolver.lookup(&prefix_node, rel, LookupFlags::DIRECTORY | LookupFlags::DISABLE_MOUNTS).await {
                Ok(result) => {
                    owned.push(result.node.clone());
                    result.node
                }
                Err(err) => {
                    self.release_rename_refs(owned).await;
                    return Err(err);
                }
            },
        };

        let old_entry = match self.registry.by_handle(old_parent.triplet.fs_handle).await {
            Some(entry) => entry,
            None => {
                self.release_rename_refs(owned).await;
                return Err(VfsError::NotFound);
            }
        };
        let new_entry = match self.registry.by_handle(new_parent.triplet.fs_handle).await {
            Some(entry) => entry,
            None => {
                self.release_rename_refs(owned).await;
                return Err(VfsError::NotFound);
            }
        };

        let mut orig: Option<Arc<Node>> = None;
        match resolver.lookup(&new_parent, new_leaf, LookupFlags::UNLINK | LookupFlags::DISABLE_MOUNTS).await {
            Ok(result) => orig = Some(result.node),
            Err(VfsError::NotFound) => {}
            Err(err) => {
                self.release_rename_refs(owned).await;
                return Err(err);
            }
        }

        let moved = match resolver.lookup(&old_parent, old_leaf, LookupFlags::UNLINK | LookupFlags::DISABLE_MOUNTS).await {
            Ok(result) => result.node,
            Err(err) => {
                if let Some(orig_node) = &orig {
                    let _ = new_entry
                        .server
                        .link(new_parent.triplet.service_id, new_parent.triplet.index, new_leaf, orig_node.triplet.index)
                        .await;
                }
                if let Some(orig_node) = orig {
                    owned.push(orig_node);
                }
                self.release_rename_refs(owned).await;
                return Err(err);
            }
        };

        if let Err(err) = new_entry
            .server
            .link(new_parent.triplet.service_id, new_parent.triplet.index, new_leaf, moved.triplet.index)
            .await
        {
            let _ = old_entry
                .server
                .link(old_parent.triplet.service_id, old_parent.triplet.index, old_leaf, moved.triplet.index)
                .await;
            if let Some(orig_node) = &orig {
                let _ = new_entry
                    .server
                    .link(new_parent.triplet.service_id, new_parent.triplet.index, new_leaf, orig_node.triplet.index)
                    .await;
            }
            owned.push(moved);
            if let Some(orig_node) = orig {
                owned.push(orig_node);
            }
            self.release_rename_refs(owned).await;
            return Err(err);
        }

        if let Some(orig_node) = orig {
            orig_node.mark_unlinked();
            owned.push(orig_node);
        }
        owned.push(moved);
        self.release_rename_refs(owned).await;
        Ok(())
    }

    /// Releases every reference accumulated by a `rename()` attempt, success or failure.
    async fn release_rename_refs(&self, owned: Vec<Arc<Node>>) {
        for node in owned {
            let _ = self.nodes.node_put(&node, &self.registry).await;
        }
    }

    /// `VFS_IN_DUP`.
    pub async fn dup(&self, files: &FileTable, old_fd: u32, new_fd: u32) -> Result<u32> {
        if old_fd == new_fd {
            return Ok(new_fd);
        }
        let old_file = files.file_get(old_fd).await?;
        let _ = files.fd_free(new_fd).await;
        files.fd_assign_at(new_fd, old_file).await;
        Ok(new_fd)
    }

    /// `VFS_IN_SYNC`.
    pub async fn sync(&self, file: &Arc<File>) -> Result<()> {
        let _state = file.lock().await;
        let entry = self.registry.by_handle(file.node.triplet.fs_handle).await.ok_or(VfsError::NotFound)?;
        entry.server.sync(file.node.triplet.service_id, file.node.triplet.index).await
    }

    /// `VFS_IN_GET_MTAB`: a consistent snapshot under `mtab_list_lock`.
    pub async fn get_mtab(&self) -> Vec<MtabRow> {
        self.mtab_rows.lock().await.clone()
    }

    /// `VFS_IN_WAIT_HANDLE`.
    pub async fn wait_handle(&self, files: &FileTable) -> u32 {
        files.wait_handle().await
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// Overflow-checked offset arithmetic for `seek` (§4.F). `clamp` selects `SEEK_END`'s more
/// forgiving behavior (clamp to `OFF64_MAX` rather than erroring when the base itself, a
/// reported file size, pushes the result past it).
fn checked_offset(base: u64, offset: i64, clamp: bool) -> Result<u64> {
    let result = base as i128 + offset as i128;
    if result < 0 {
        return Err(VfsError::Overflow);
    }
    if result > i64::MAX as i128 {
        return if clamp { Ok(i64::MAX as u64) } else { Err(VfsError::Overflow) };
    }
    Ok(result as u64)
}

fn is_proper_prefix(prefix: &str, path: &str) -> bool {
    path.len() > prefix.len() && path.starts_with(prefix) && path.as_bytes()[prefix.len()] == b'/'
}

/// Length of the greatest common path prefix of `a`/`b` that ends at a `/` boundary.
fn shared_prefix_len(a: &str, b: &str) -> usize {
    let mut last_slash = 0;
    for (i, (ca, cb)) in a.bytes().zip(b.bytes()).enumerate() {
        if ca != cb {
            break;
        }
        if ca == b'/' {
            last_slash = i + 1;
        }
    }
    last_slash
}

/// Splits a relative path into its parent (if any, with any leading `/` stripped) and its
/// terminal leaf name, e.g. `"d1/x"` -> `(Some("d1"), "x")`, `"x"` -> `(None, "x")`.
fn split_leaf(rel: &str) -> (Option<&str>, &str) {
    let rel = rel.strip_prefix('/').unwrap_or(rel);
    match rel.rfind('/') {
        Some(idx) => (Some(&rel[..idx]), &rel[idx + 1..]),
        None => (None, rel),
    }
}
