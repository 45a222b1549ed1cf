//! Mount table (§4.B): the mapping of mount-point triplets to mounted-root triplets, plus
//! the reverse index the resolver needs to ascend past a mount point at `..`.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::error::{Result, VfsError};
use crate::triplet::{FsHandle, ServiceId, Triplet};

/// One row of the mount table. The root mount has `mount_point = None` and is reachable
/// only through [`MountTable::root`].
#[derive(Clone)]
pub struct MountEntry {
    pub mount_point: Option<Triplet>,
    pub mounted_root: Triplet,
    pub mount_point_path: String,
    pub options: String,
    pub fs_name: String,
    pub instance: u32,
    pub service_id: ServiceId,
}

struct Inner {
    root: Option<MountEntry>,
    by_mount_point: HashMap<Triplet, MountEntry>,
    by_mounted_root: HashMap<Triplet, Triplet>,
}

/// Single mutex-guarded mount table (§5 lock #2, `mount_table_lock`).
pub struct MountTable {
    inner: Mutex<Inner>,
}

impl MountTable {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { root: None, by_mount_point: HashMap::new(), by_mounted_root: HashMap::new() }) }
    }

    /// `mount_add`. Fails with [`VfsError::Busy`] if `mount_point` is already a
    /// mount-point, or if installing the root mount while one already exists.
    pub async fn mount_add(&self, entry: MountEntry) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match entry.mount_point {
            None => {
                if inner.root.is_some() {
                    return Err(VfsError::Busy);
                }
                inner.root = Some(entry);
            }
            Some(mp) => {
                if inner.by_mount_point.contains_key(&mp) {
                    return Err(VfsError::Busy);
                }
                inner.by_mounted_root.insert(entry.mounted_root, mp);
                inner.by_mount_point.insert(mp, entry);
            }
        }
        Ok(())
    }

    /// `mount_remove`. `mount_point = None` removes the root mount.
    pub async fn mount_remove(&self, mount_point: Option<Triplet>) -> Option<MountEntry> {
        let mut inner = self.inner.lock().await;
        match mount_point {
            None => inner.root.take(),
            Some(mp) => {
                let entry = inner.by_mount_point.remove(&mp)?;
                inner.by_mounted_root.remove(&entry.mounted_root);
                Some(entry)
            }
        }
    }

    /// `mount_lookup(triplet) -> Option<mounted-root triplet>`, consulted by the resolver
    /// after every path component.
    pub async fn mount_lookup(&self, triplet: Triplet) -> Option<Triplet> {
        let inner = self.inner.lock().await;
        inner.by_mount_point.get(&triplet).map(|entry| entry.mounted_root)
    }

    /// Reverse lookup used when ascending past a mount point at `..`: given a mounted-root
    /// triplet, return the mount-point triplet that hides it (in the parent file system).
    pub async fn reverse_lookup(&self, mounted_root: Triplet) -> Option<Triplet> {
        let inner = self.inner.lock().await;
        inner.by_mounted_root.get(&mounted_root).copied()
    }

    pub async fn root(&self) -> Option<MountEntry> {
        let inner = self.inner.lock().await;
        inner.root.clone()
    }

    pub async fn has_root(&self) -> bool {
        self.inner.lock().await.root.is_some()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triplet::Index;

    fn entry(mount_point: Option<Triplet>, mounted_root: Triplet) -> MountEntry {
        MountEntry {
            mount_point,
            mounted_root,
            mount_point_path: "/a".into(),
            options: String::new(),
            fs_name: "tmpfs".into(),
            instance: 0,
            service_id: mounted_root.service_id,
        }
    }

    #[tokio::test]
    async fn duplicate_mount_point_is_busy() {
        let table = MountTable::new();
        let mp = Triplet::new(FsHandle(1), ServiceId(1), Index(2));
        let mr1 = Triplet::new(FsHandle(2), ServiceId(1), Index(1));
        let mr2 = Triplet::new(FsHandle(3), ServiceId(1), Index(1));
        table.mount_add(entry(Some(mp), mr1)).await.unwrap();
        assert_eq!(table.mount_add(entry(Some(mp), mr2)).await, Err(VfsError::Busy));
    }

    #[tokio::test]
    async fn reverse_lookup_finds_mount_point_from_mounted_root() {
        let table = MountTable::new();
        let mp = Triplet::new(FsHandle(1), ServiceId(1), Index(2));
        let mr = Triplet::new(FsHandle(2), ServiceId(1), Index(1));
        table.mount_add(entry(Some(mp), mr)).await.unwrap();
        assert_eq!(table.reverse_lookup(mr).await, Some(mp));
        assert_eq!(table.mount_lookup(mp).await, Some(mr));
    }

    #[tokio::test]
    async fn root_mount_is_exclusive() {
        let table = MountTable::new();
        let mr = Triplet::new(FsHandle(1), ServiceId(1), Index(1));
        table.mount_add(entry(None, mr)).await.unwrap();
        assert_eq!(table.mount_add(entry(None, mr)).await, Err(VfsError::Busy));
    }
}
