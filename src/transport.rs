//! Transport abstraction (§4.E): the broker is agnostic to the kernel IPC substrate it
//! runs on, so every request handler is written against [`ClientLink`] rather than a
//! concrete socket. Grounded on the teacher's three-task pipeline
//! (`read_task`/`vfs_task`/`stream_writer`), collapsed here into a single trait a
//! transport implementation answers.

use async_trait::async_trait;

use crate::error::Result;

/// One client's bulk in/out sub-channels, used by `read`/`write` to move payload bytes
/// without copying them through the request/reply envelope (§4.E "bulk transfer").
#[async_trait]
pub trait ClientLink: Send + Sync {
    /// Pull up to `max` bytes the client has queued for a `VFS_IN_WRITE`.
    async fn data_read(&self, max: u32) -> Result<Vec<u8>>;

    /// Push bytes back to the client in response to a `VFS_IN_READ`.
    async fn data_write(&self, data: &[u8]) -> Result<()>;

    /// Liveness probe used by `get_mtab`'s streaming reply (§4.F) to detect a client that
    /// has gone away mid-stream.
    async fn ping(&self) -> Result<()>;
}

/// In-process [`ClientLink`] backed by channels, used by the broker's own test suite and by
/// `vfsbrokerd` when driving a loopback connection. Mirrors the teacher's
/// `mpsc`-channel-backed senders in `message_types.rs`.
pub mod channel {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::sync::Mutex;

    pub struct ChannelLink {
        data_in: Mutex<mpsc::Receiver<Vec<u8>>>,
        data_out: mpsc::Sender<Vec<u8>>,
    }

    impl ChannelLink {
        pub fn new(data_in: mpsc::Receiver<Vec<u8>>, data_out: mpsc::Sender<Vec<u8>>) -> Self {
            Self { data_in: Mutex::new(data_in), data_out }
        }
    }

    #[async_trait]
    impl ClientLink for ChannelLink {
        async fn data_read(&self, max: u32) -> Result<Vec<u8>> {
            let mut rx = self.data_in.lock().await;
            match rx.recv().await {
                Some(mut chunk) => {
                    chunk.truncate(max as usize);
                    Ok(chunk)
                }
                None => Ok(Vec::new()),
            }
        }

        async fn data_write(&self, data: &[u8]) -> Result<()> {
            self.data_out
                .send(data.to_vec())
                .await
                .map_err(|_| crate::error::VfsError::IoError)
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }
}
