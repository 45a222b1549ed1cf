//! Drives a [`Broker`] against the in-memory [`MemFs`] reference backend, end to end:
//! register a server, mount it at `/`, create and write a file, then read it back.
//!
//! Run with `cargo run --example tmpfs_demo`.

use std::sync::Arc;

use vfs_broker::broker::Broker;
use vfs_broker::file_table::FileTable;
use vfs_broker::flags::{OpenFlags, WalkFlags};
use vfs_broker::registry::FsServerEntry;
use vfs_broker::testing::MemFs;
use vfs_broker::triplet::{FsHandle, ServiceId};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let broker = Broker::new();
    let tmpfs = Arc::new(MemFs::new(FsHandle(1)));
    broker
        .registry
        .register(FsServerEntry {
            fs_handle: FsHandle(1),
            instance: 0,
            fs_name: "tmpfs".to_owned(),
            capabilities: Default::default(),
            server: tmpfs,
        })
        .await;

    broker.mount(ServiceId(1), 0, false, "/", "", "tmpfs").await.expect("mount root");

    let files = FileTable::new();
    let fd = broker
        .walk(&files, None, WalkFlags::MUST_CREATE | WalkFlags::REGULAR, "/hello.txt")
        .await
        .expect("create file");
    let file = files.file_get(fd).await.expect("fd is live");
    broker.open2(&file, OpenFlags::READ | OpenFlags::WRITE).await.expect("open");

    broker.write(&file, b"hello, vfs broker").await.expect("write");
    broker.seek(&file, 0, vfs_broker::broker::SeekWhence::Set).await.expect("seek");
    let data = broker.read(&file, 64).await.expect("read");

    println!("read back: {}", String::from_utf8_lossy(&data));
}
