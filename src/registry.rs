//! The FS-server registry (§4.G): a dynamic `(instance, fs_name)` → server map, with a
//! condition variable that wakes blocking `mount` calls when a new server registers.

use std::sync::Arc;

use tokio::sync::Notify;
use whirlwind::ShardMap;

use crate::fs_server::{Capabilities, FsServer};
use crate::triplet::FsHandle;

/// One registered file-system server and the capability bits it advertised.
pub struct FsServerEntry {
    pub fs_handle: FsHandle,
    pub instance: u32,
    pub fs_name: String,
    pub capabilities: Capabilities,
    pub server: Arc<dyn FsServer>,
}

/// Dynamic list of known file-system servers, keyed by `(instance, fs_name)`, with a
/// secondary index by `fs_handle` for the many call sites that only know a triplet.
pub struct FsRegistry {
    by_name: ShardMap<(u32, String), Arc<FsServerEntry>>,
    by_handle: ShardMap<FsHandle, Arc<FsServerEntry>>,
    registered: Notify,
}

impl FsRegistry {
    pub fn new() -> Self {
        Self { by_name: ShardMap::new(), by_handle: ShardMap::new(), registered: Notify::new() }
    }

    /// Register a server, waking any fibril blocked in `mount` waiting on its name.
    pub async fn register(&self, entry: FsServerEntry) {
        let entry = Arc::new(entry);
        let key = (entry.instance, entry.fs_name.clone());
        self.by_name.insert(key, entry.clone()).await;
        self.by_handle.insert(entry.fs_handle, entry).await;
        self.registered.notify_waiters();
    }

    /// `name_to_handle(instance, name)`. Returns `None` when absent.
    pub async fn name_to_handle(&self, instance: u32, name: &str) -> Option<Arc<FsServerEntry>> {
        self.by_name.get(&(instance, name.to_owned())).await.map(|entry| entry.clone())
    }

    /// Look up a registered server by the handle it was assigned at registration.
    pub async fn by_handle(&self, fs_handle: FsHandle) -> Option<Arc<FsServerEntry>> {
        self.by_handle.get(&fs_handle).await.map(|entry| entry.clone())
    }

    /// Wait until some server registers. The waiter holds no namespace reference; on wake
    /// it must re-validate by re-looking-up the server name, since another fibril could
    /// have raced it to the same name (§9).
    pub async fn wait_for_registration(&self) {
        self.registered.notified().await;
    }
}

impl Default for FsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemFs;
    use crate::triplet::ServiceId;

    #[tokio::test]
    async fn register_then_lookup_by_name() {
        let registry = FsRegistry::new();
        let fs = Arc::new(MemFs::new(FsHandle(1)));
        registry
            .register(FsServerEntry {
                fs_handle: FsHandle(1),
                instance: 0,
                fs_name: "tmpfs".into(),
                capabilities: Capabilities::default(),
                server: fs,
            })
            .await;

        let entry = registry.name_to_handle(0, "tmpfs").await.expect("registered");
        assert_eq!(entry.fs_handle, FsHandle(1));
        assert!(registry.name_to_handle(0, "ext4").await.is_none());
        assert!(registry.name_to_handle(1, "tmpfs").await.is_none());
        let _ = ServiceId(0);
    }

    #[tokio::test]
    async fn blocking_mount_wakes_on_registration() {
        let registry = Arc::new(FsRegistry::new());
        let waiter_registry = registry.clone();
        let waiter = tokio::spawn(async move {
            waiter_registry.wait_for_registration().await;
            waiter_registry.name_to_handle(0, "tmpfs").await.is_some()
        });

        // Give the waiter a chance to register interest before we notify.
        tokio::task::yield_now().await;

        let fs = Arc::new(MemFs::new(FsHandle(7)));
        registry
            .register(FsServerEntry {
                fs_handle: FsHandle(7),
                instance: 0,
                fs_name: "tmpfs".into(),
                capabilities: Capabilities::default(),
                server: fs,
            })
            .await;

        assert!(waiter.await.expect("waiter task"));
    }
}
