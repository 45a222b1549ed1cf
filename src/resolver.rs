//! Path resolver (§4.C): walks a path component by component across mount points,
//! substituting a mounted root for its mount-point triplet and consulting the reverse
//! index when a walk crosses `..` out of a mounted file system.

use std::sync::Arc;

use crate::error::{Result, VfsError};
use crate::flags::LookupFlags;
use crate::fs_server::LookupAnswer;
use crate::mount_table::MountTable;
use crate::node::{Node, NodeCache};
use crate::registry::FsRegistry;
use crate::triplet::Triplet;

/// Outcome of a successful resolve: the final node plus whether a trailing `/` was present
/// (handlers reject that on a non-directory terminal, §4.C edge cases).
pub struct ResolveResult {
    pub node: Arc<Node>,
    pub trailing_slash: bool,
}

/// Shared services the resolver needs on every call. Borrowed, not owned, since the
/// resolver itself holds no state of its own (§4.C: "the resolver is stateless").
pub struct Resolver<'a> {
    pub mounts: &'a MountTable,
    pub nodes: &'a NodeCache,
    pub registry: &'a FsRegistry,
}

impl<'a> Resolver<'a> {
    pub fn new(mounts: &'a MountTable, nodes: &'a NodeCache, registry: &'a FsRegistry) -> Self {
        Self { mounts, nodes, registry }
    }

    /// `lookup(base, path, flags)`: resolve `path` relative to `base`, applying `flags` to
    /// the *terminal* component only — intermediate components always resolve as plain
    /// directory lookups regardless of what the caller asked for the last one.
    pub async fn lookup(
        &self,
        base: &Arc<Node>,
        path: &str,
        flags: LookupFlags,
    ) -> Result<ResolveResult> {
        let trailing_slash = path.len() > 1 && path.ends_with('/');
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            // Path was "", "/", or a run of slashes: resolves to `base` itself (an empty path
            // relative to a directory fd yields the directory itself). Still hand back an
            // owned reference, matching every other return from this function, so callers can
            // uniformly `node_put` what they get.
            let node = self.nodes.touch(base.triplet).await.ok_or(VfsError::NotFound)?;
            return Ok(ResolveResult { node, trailing_slash: true });
        }

        let mut current = base.clone();
        let last = components.len() - 1;

        for (i, name) in components.iter().enumerate() {
            let is_terminal = i == last;
            let component_flags = if is_terminal { flags } else { LookupFlags::empty() };

            current = self.step(&current, name, component_flags).await?;

            if !is_terminal && current.node_type != crate::fs_server::NodeType::Directory {
                return Err(VfsError::InvalidArgument);
            }
        }

        Ok(ResolveResult { node: current, trailing_slash })
    }

    /// Resolve a single path component from `current`, substituting a mounted root for the
    /// mount-point triplet unless the caller asked for `DISABLE_MOUNTS`/`MP`, and crossing
    /// back out through the reverse index on `..`.
    async fn step(&self, current: &Arc<Node>, name: &str, flags: LookupFlags) -> Result<Arc<Node>> {
        if name == ".." {
            if let Some(mount_point) = self.mounts.reverse_lookup(current.triplet).await {
                return self.node_at(mount_point).await;
            }
        }

        let entry = self
            .registry
            .by_handle(current.triplet.fs_handle)
            .await
            .ok_or(VfsError::NotFound)?;

        let answer: LookupAnswer = entry
            .server
            .lookup(current.triplet.service_id, current.triplet.index, name, flags)
            .await?;

        let resolved = Triplet::new(current.triplet.fs_handle, current.triplet.service_id, answer.index);
        let node = self.nodes.node_get(resolved, answer).await;

        if flags.contains(LookupFlags::DISABLE_MOUNTS) || flags.contains(LookupFlags::MP) {
            return Ok(node);
        }

        match self.mounts.mount_lookup(resolved).await {
            Some(mounted_root) => {
                let substituted = self.node_at(mounted_root).await;
                self.nodes.node_put(&node, self.registry).await?;
                substituted
            }
            None => Ok(node),
        }
    }

    /// Fetch (or fault in) the node cache entry for a triplet already known to exist,
    /// stat-ing it through its owning server on a cold cache. Always returns the node with
    /// one reference taken out on the caller's behalf.
    async fn node_at(&self, triplet: Triplet) -> Result<Arc<Node>> {
        if let Some(node) = self.nodes.touch(triplet).await {
            return Ok(node);
        }
        let entry = self.registry.by_handle(triplet.fs_handle).await.ok_or(VfsError::NotFound)?;
        let attr = entry.server.stat(triplet.service_id, triplet.index).await?;
        Ok(self.nodes.node_get(triplet, LookupAnswer { index: triplet.index, attr }).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::LookupFlags;
    use crate::fs_server::NodeAttr;
    use crate::mount_table::{MountEntry, MountTable};
    use crate::registry::{FsRegistry, FsServerEntry};
    use crate::testing::MemFs;
    use crate::triplet::{FsHandle, Index, ServiceId};

    async fn root_node(nodes: &NodeCache, fs_handle: FsHandle) -> Arc<Node> {
        let triplet = Triplet::new(fs_handle, ServiceId(0), MemFs::root_index());
        nodes
            .node_get(
                triplet,
                LookupAnswer { index: MemFs::root_index(), attr: NodeAttr { node_type: crate::fs_server::NodeType::Directory, size: 0 } },
            )
            .await
    }

    #[tokio::test]
    async fn intermediate_components_never_inherit_create_flags() {
        let mounts = MountTable::new();
        let nodes = NodeCache::new();
        let registry = FsRegistry::new();
        let fs = Arc::new(MemFs::new(FsHandle(1)));
        registry
            .register(FsServerEntry { fs_handle: FsHandle(1), instance: 0, fs_name: "mem".into(), capabilities: Default::default(), server: fs })
            .await;

        let root = root_node(&nodes, FsHandle(1)).await;
        let resolver = Resolver::new(&mounts, &nodes, &registry);

        // "dir" does not exist yet; CREATE only applies to the terminal component "file.txt",
        // so the missing intermediate directory must surface as NotFound.
        let result = resolver
            .lookup(&root, "dir/file.txt", LookupFlags::CREATE | LookupFlags::FILE)
            .await;
        assert_eq!(result.err(), Some(VfsError::NotFound));
    }

    #[tokio::test]
    async fn terminal_create_succeeds_once_intermediate_exists() {
        let mounts = MountTable::new();
        let nodes = NodeCache::new();
        let registry = FsRegistry::new();
        let fs = Arc::new(MemFs::new(FsHandle(1)));
        fs.lookup(ServiceId(0), MemFs::root_index(), "dir", LookupFlags::CREATE | LookupFlags::DIRECTORY)
            .await
            .unwrap();
        registry
            .register(FsServerEntry { fs_handle: FsHandle(1), instance: 0, fs_name: "mem".into(), capabilities: Default::default(), server: fs })
            .await;

        let root = root_node(&nodes, FsHandle(1)).await;
        let resolver = Resolver::new(&mounts, &nodes, &registry);

        let result = resolver
            .lookup(&root, "dir/file.txt", LookupFlags::CREATE | LookupFlags::FILE)
            .await
            .unwrap();
        assert_eq!(result.node.node_type, crate::fs_server::NodeType::Regular);
    }

    #[tokio::test]
    async fn crosses_mount_point_to_mounted_root() {
        let mounts = MountTable::new();
        let nodes = NodeCache::new();
        let registry = FsRegistry::new();

        let parent_fs = Arc::new(MemFs::new(FsHandle(1)));
        let child_fs = Arc::new(MemFs::new(FsHandle(2)));
        registry
            .register(FsServerEntry { fs_handle: FsHandle(1), instance: 0, fs_name: "parent".into(), capabilities: Default::default(), server: parent_fs.clone() })
            .await;
        registry
            .register(FsServerEntry { fs_handle: FsHandle(2), instance: 0, fs_name: "child".into(), capabilities: Default::default(), server: child_fs.clone() })
            .await;

        let root = root_node(&nodes, FsHandle(1)).await;

        let mp_answer = parent_fs
            .lookup(ServiceId(0), MemFs::root_index(), "mnt", LookupFlags::CREATE | LookupFlags::DIRECTORY)
            .await
            .unwrap();
        let mp_triplet = Triplet::new(FsHandle(1), ServiceId(0), mp_answer.index);
        let mounted_root_triplet = Triplet::new(FsHandle(2), ServiceId(0), MemFs::root_index());

        mounts
            .mount_add(MountEntry {
                mount_point: Some(mp_triplet),
                mounted_root: mounted_root_triplet,
                mount_point_path: "/mnt".into(),
                options: String::new(),
                fs_name: "child".into(),
                instance: 0,
                service_id: ServiceId(0),
            })
            .await
            .unwrap();

        let resolver = Resolver::new(&mounts, &nodes, &registry);
        let result = resolver.lookup(&root, "mnt", LookupFlags::empty()).await.unwrap();
        assert_eq!(result.node.triplet, mounted_root_triplet);
    }

    #[tokio::test]
    async fn disable_mounts_flag_returns_mount_point_itself() {
        let mounts = MountTable::new();
        let nodes = NodeCache::new();
        let registry = FsRegistry::new();

        let parent_fs = Arc::new(MemFs::new(FsHandle(1)));
        let child_fs = Arc::new(MemFs::new(FsHandle(2)));
        registry
            .register(FsServerEntry { fs_handle: FsHandle(1), instance: 0, fs_name: "parent".into(), capabilities: Default::default(), server: parent_fs.clone() })
            .await;
        registry
            .register(FsServerEntry { fs_handle: FsHandle(2), instance: 0, fs_name: "child".into(), capabilities: Default::default(), server: child_fs })
            .await;

        let root = root_node(&nodes, FsHandle(1)).await;
        let mp_answer = parent_fs
            .lookup(ServiceId(0), MemFs::root_index(), "mnt", LookupFlags::CREATE | LookupFlags::DIRECTORY)
            .await
            .unwrap();
        let mp_triplet = Triplet::new(FsHandle(1), ServiceId(0), mp_answer.index);

        mounts
            .mount_add(MountEntry {
                mount_point: Some(mp_triplet),
                mounted_root: Triplet::new(FsHandle(2), ServiceId(0), MemFs::root_index()),
                mount_point_path: "/mnt".into(),
                options: String::new(),
                fs_name: "child".into(),
                instance: 0,
                service_id: ServiceId(0),
            })
            .await
            .unwrap();

        let resolver = Resolver::new(&mounts, &nodes, &registry);
        let result = resolver.lookup(&root, "mnt", LookupFlags::DISABLE_MOUNTS).await.unwrap();
        assert_eq!(result.node.triplet, mp_triplet);
    }

    #[tokio::test]
    async fn empty_path_resolves_to_base_itself() {
        let mounts = MountTable::new();
        let nodes = NodeCache::new();
        let registry = FsRegistry::new();
        let fs = Arc::new(MemFs::new(FsHandle(1)));
        registry
            .register(FsServerEntry { fs_handle: FsHandle(1), instance: 0, fs_name: "mem".into(), capabilities: Default::default(), server: fs })
            .await;
        let root = root_node(&nodes, FsHandle(1)).await;
        let resolver = Resolver::new(&mounts, &nodes, &registry);
        let result = resolver.lookup(&root, "", LookupFlags::empty()).await.unwrap();
        assert_eq!(result.node.triplet, root.triplet);
    }
}
