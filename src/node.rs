//! Triplet & node cache (§4.A): the canonical in-memory handle for every referenced
//! file-system object, reference-counted and garbage-collected at zero.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use moka::future::Cache;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::fs_server::{LookupAnswer, NodeType};
use crate::registry::FsRegistry;
use crate::triplet::{FsHandle, ServiceId, Triplet};

/// One cached object. `size`/`unlinked` are mutated under the owning lock paths described
/// in §5; `refcount` and `unlinked` use atomics since they are touched from many call
/// sites that don't otherwise need a lock.
pub struct Node {
    pub triplet: Triplet,
    pub node_type: NodeType,
    size: AtomicU64,
    refcount: AtomicU64,
    unlinked: AtomicBool,
    /// Many-reader/one-writer guard on *this object's* bytes.
    pub contents_rwlock: RwLock<()>,
}

impl Node {
    fn new(triplet: Triplet, attr: crate::fs_server::NodeAttr) -> Self {
        Self {
            triplet,
            node_type: attr.node_type,
            size: AtomicU64::new(attr.size),
            refcount: AtomicU64::new(0),
            unlinked: AtomicBool::new(false),
            contents_rwlock: RwLock::new(()),
        }
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    /// Mark this node as unlinked; set by the resolver's `L_UNLINK` so eviction knows to
    /// issue `VFS_OUT_DESTROY` rather than freeing silently.
    pub fn mark_unlinked(&self) {
        self.unlinked.store(true, Ordering::Release);
    }
}

/// Reference-counted cache of live [`Node`]s, indexed by [`Triplet`].
///
/// Creation on a miss is the only path that may block on the owning FS server (to fetch
/// size/type); concurrent misses on the same triplet coalesce to a single outstanding
/// fetch via [`moka::future::Cache::get_with`].
pub struct NodeCache {
    cache: Cache<Triplet, Arc<Node>>,
}

impl NodeCache {
    pub fn new() -> Self {
        // No TTL/TTI or size bound: eviction is driven entirely by refcount reaching
        // zero, not by moka's own policy.
        Self { cache: Cache::builder().build() }
    }

    /// `node_get(lookup_result)`: increments refcount, creating the node on a miss using
    /// the attributes the caller already obtained via `VFS_OUT_LOOKUP`/`VFS_OUT_MOUNTED`.
    pub async fn node_get(&self, triplet: Triplet, answer: LookupAnswer) -> Arc<Node> {
        let node = self
            .cache
            .get_with(triplet, async move { Arc::new(Node::new(triplet, answer.attr)) })
            .await;
        node.refcount.fetch_add(1, Ordering::AcqRel);
        node
    }

    /// Look up a node already resident in the cache without touching its refcount. Used only
    /// for read-only peeks that do not hand the node to a caller expected to `node_put` it.
    pub async fn peek(&self, triplet: Triplet) -> Option<Arc<Node>> {
        self.cache.get(&triplet).await
    }

    /// Like [`Self::peek`] but takes out a reference on a hit, for callers that will
    /// eventually balance it with `node_put`/`node_forget`.
    pub async fn touch(&self, triplet: Triplet) -> Option<Arc<Node>> {
        let node = self.cache.get(&triplet).await?;
        node.refcount.fetch_add(1, Ordering::AcqRel);
        Some(node)
    }

    /// `node_put(node)`: decrements refcount, evicting (and destroying, if unlinked) at
    /// zero.
    pub async fn node_put(&self, node: &Arc<Node>, registry: &FsRegistry) -> Result<()> {
        let remaining = node.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.cache.invalidate(&node.triplet).await;
            if node.is_unlinked() {
                if let Some(entry) = registry.by_handle(node.triplet.fs_handle).await {
                    entry.server.destroy(node.triplet.service_id, node.triplet.index).await?;
                }
            }
        }
        Ok(())
    }

    /// `node_forget(node)`: decrements without an FS round-trip, used on unmount of an
    /// already-gone root — the server destroyed it itself, so no `VFS_OUT_DESTROY` fires.
    pub async fn node_forget(&self, node: &Arc<Node>) {
        let remaining = node.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.cache.invalidate(&node.triplet).await;
        }
    }

    /// `refcount_sum(fs_handle, service_id)`: used by unmount to detect busy mounts.
    pub async fn refcount_sum(&self, fs_handle: FsHandle, service_id: ServiceId) -> u64 {
        self.cache.run_pending_tasks().await;
        let mut sum = 0;
        for (triplet, node) in self.cache.iter() {
            if triplet.fs_handle == fs_handle && triplet.service_id == service_id {
                sum += node.refcount();
            }
        }
        sum
    }
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new()
    }
}
