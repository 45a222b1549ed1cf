//! Request dispatcher (§4.E, §6): decodes one `VFS_IN_*` request into a call against
//! [`Broker`], moving bulk payloads through the client's [`ClientLink`] rather than the
//! request/reply envelope itself. One [`Dispatcher`] per connected client; it owns that
//! client's [`FileTable`] but shares the broker-wide [`Broker`].

use std::sync::Arc;

use tracing::{instrument, warn};

use crate::broker::{Broker, MtabRow, SeekWhence};
use crate::error::{Result, VfsError};
use crate::file_table::FileTable;
use crate::flags::{OpenFlags, WalkFlags};
use crate::fs_server::NodeAttr;
use crate::transport::ClientLink;
use crate::triplet::ServiceId;

/// One decoded `VFS_IN_*` request. Field names mirror §6's request table.
pub enum Request {
    Mount { service_id: ServiceId, instance: u32, blocking: bool, mp: String, opts: String, fs_name: String },
    Unmount { mp: String },
    Walk { parentfd: Option<u32>, flags: WalkFlags, path: String },
    Open { fd: u32, flags: OpenFlags },
    Read { fd: u32, max: u32 },
    Write { fd: u32 },
    Seek { fd: u32, offset: i64, whence: SeekWhence },
    Truncate { fd: u32, size: u64 },
    Fstat { fd: u32 },
    Unlink { parentfd: u32, expectfd: Option<u32>, directory: bool, path: String },
    Rename { basefd: u32, old: String, new: String },
    Dup { old_fd: u32, new_fd: u32 },
    Sync { fd: u32 },
    WaitHandle,
    Ping,
    GetMtab,
}

/// One reply. Every variant maps onto a §6 reply shape; `Err` carries the broker error kind
/// a transport layer would translate to a numeric code.
#[derive(Debug)]
pub enum Reply {
    Ok,
    Fd(u32),
    Written(u32),
    Pos(u64),
    Attr(NodeAttr),
    Mtab(Vec<MtabRow>),
    Err(VfsError),
}

/// Per-client dispatcher: the broker-wide state plus this connection's own descriptor
/// table and bulk-data link.
pub struct Dispatcher {
    broker: Arc<Broker>,
    files: FileTable,
    link: Arc<dyn ClientLink>,
}

impl Dispatcher {
    pub fn new(broker: Arc<Broker>, link: Arc<dyn ClientLink>) -> Self {
        Self { broker, files: FileTable::new(), link }
    }

    /// Handle exactly one request, returning exactly one reply — the dispatcher never
    /// emits more or fewer replies than requests, regardless of which handler path is
    /// taken (§4.E).
    #[instrument(skip(self, request), fields(kind = request_kind(&request)))]
    pub async fn dispatch(&self, request: Request) -> Reply {
        match self.handle(request).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "request failed");
                Reply::Err(err)
            }
        }
    }

    async fn handle(&self, request: Request) -> Result<Reply> {
        match request {
            Request::Mount { service_id, instance, blocking, mp, opts, fs_name } => {
                self.broker.mount(service_id, instance, blocking, &mp, &opts, &fs_name).await?;
                Ok(Reply::Ok)
            }
            Request::Unmount { mp } => {
                self.broker.unmount(&mp).await?;
                Ok(Reply::Ok)
            }
            Request::Walk { parentfd, flags, path } => {
                let parent = match parentfd {
                    Some(fd) => Some(self.files.file_get(fd).await?),
                    None => None,
                };
                let fd = self.broker.walk(&self.files, parent.as_ref(), flags, &path).await?;
                Ok(Reply::Fd(fd))
            }
            Request::Open { fd, flags } => {
                let file = self.files.file_get(fd).await?;
                self.broker.open2(&file, flags).await?;
                Ok(Reply::Ok)
            }
            Request::Read { fd, max } => {
                let file = self.files.file_get(fd).await?;
                let data = self.broker.read(&file, max).await?;
                self.link.data_write(&data).await?;
                Ok(Reply::Written(data.len() as u32))
            }
            Request::Write { fd } => {
                let file = self.files.file_get(fd).await?;
                let data = self.link.data_read(u32::MAX).await?;
                let written = self.broker.write(&file, &data).await?;
                Ok(Reply::Written(written))
            }
            Request::Seek { fd, offset, whence } => {
                let file = self.files.file_get(fd).await?;
                let pos = self.broker.seek(&file, offset, whence).await?;
                Ok(Reply::Pos(pos))
            }
            Request::Truncate { fd, size } => {
                let file = self.files.file_get(fd).await?;
                self.broker.truncate(&file, size).await?;
                Ok(Reply::Ok)
            }
            Request::Fstat { fd } => {
                let file = self.files.file_get(fd).await?;
                let attr = self.broker.fstat(&file).await?;
                Ok(Reply::Attr(attr))
            }
            Request::Unlink { parentfd, expectfd, directory, path } => {
                let base_file = self.files.file_get(parentfd).await?;
                let expect = match expectfd {
                    Some(fd) => Some(self.files.file_get(fd).await?),
                    None => None,
                };
                self.broker.unlink2(&base_file.node, expect.as_ref(), directory, &path).await?;
                Ok(Reply::Ok)
            }
            Request::Rename { basefd, old, new } => {
                let base_file = self.files.file_get(basefd).await?;
                self.broker.rename(&base_file.node, &old, &new).await?;
                Ok(Reply::Ok)
            }
            Request::Dup { old_fd, new_fd } => {
                let fd = self.broker.dup(&self.files, old_fd, new_fd).await?;
                Ok(Reply::Fd(fd))
            }
            Request::Sync { fd } => {
                let file = self.files.file_get(fd).await?;
                self.broker.sync(&file).await?;
                Ok(Reply::Ok)
            }
            Request::WaitHandle => {
                let fd = self.broker.wait_handle(&self.files).await;
                Ok(Reply::Fd(fd))
            }
            Request::Ping => {
                self.link.ping().await?;
                Ok(Reply::Ok)
            }
            Request::GetMtab => Ok(Reply::Mtab(self.broker.get_mtab().await)),
        }
    }
}

fn request_kind(request: &Request) -> &'static str {
    match request {
        Request::Mount { .. } => "mount",
        Request::Unmount { .. } => "unmount",
        Request::Walk { .. } => "walk",
        Request::Open { .. } => "open",
        Request::Read { .. } => "read",
        Request::Write { .. } => "write",
        Request::Seek { .. } => "seek",
        Request::Truncate { .. } => "truncate",
        Request::Fstat { .. } => "fstat",
        Request::Unlink { .. } => "unlink",
        Request::Rename { .. } => "rename",
        Request::Dup { .. } => "dup",
        Request::Sync { .. } => "sync",
        Request::WaitHandle => "wait_handle",
        Request::Ping => "ping",
        Request::GetMtab => "get_mtab",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FsServerEntry;
    use crate::testing::MemFs;
    use crate::transport::channel::ChannelLink;
    use crate::triplet::FsHandle;
    use tokio::sync::mpsc;

    fn dispatcher() -> (Dispatcher, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (_in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        let link = Arc::new(ChannelLink::new(in_rx, out_tx.clone()));
        let broker = Arc::new(Broker::new());
        (Dispatcher::new(broker, link), out_tx, out_rx)
    }

    async fn register_tmpfs(dispatcher: &Dispatcher) {
        let fs = Arc::new(MemFs::new(FsHandle(1)));
        dispatcher
            .broker
            .registry
            .register(FsServerEntry {
                fs_handle: FsHandle(1),
                instance: 0,
                fs_name: "tmpfs".into(),
                capabilities: Default::default(),
                server: fs,
            })
            .await;
    }

    #[tokio::test]
    async fn mount_then_walk_then_fstat_round_trip() {
        let (dispatcher, _out_tx, _out_rx) = dispatcher();
        register_tmpfs(&dispatcher).await;

        let mount_reply = dispatcher
            .dispatch(Request::Mount {
                service_id: ServiceId(0),
                instance: 0,
                blocking: false,
                mp: "/".into(),
                opts: String::new(),
                fs_name: "tmpfs".into(),
            })
            .await;
        assert!(matches!(mount_reply, Reply::Ok));

        let walk_reply = dispatcher.dispatch(Request::Walk { parentfd: None, flags: WalkFlags::empty(), path: "/".into() }).await;
        let fd = match walk_reply {
            Reply::Fd(fd) => fd,
            other => panic!("expected Fd, got {other:?}"),
        };

        let fstat_reply = dispatcher.dispatch(Request::Fstat { fd }).await;
        assert!(matches!(fstat_reply, Reply::Attr(_)));
    }

    #[tokio::test]
    async fn unknown_fd_is_not_found() {
        let (dispatcher, _out_tx, _out_rx) = dispatcher();
        let reply = dispatcher.dispatch(Request::Fstat { fd: 99 }).await;
        assert!(matches!(reply, Reply::Err(VfsError::NotFound)));
    }
}
