/*!
 * End-to-end read pipeline tests against the in-memory driver
 */

use std::sync::Arc;

use irodsfs::client::memory::{Fault, MemoryClient, MemoryServer};
use irodsfs::client::Account;
use irodsfs::conn::{ConnKind, ConnPool};
use irodsfs::fd::FdRegistry;
use irodsfs::rpc::Rpc;
use irodsfs::{FsConfig, Vfs};

fn mount_vfs(server: &MemoryServer, cfg: FsConfig) -> Vfs {
    server.mkdir_all("/tempZone/home/rods");
    let client = Arc::new(MemoryClient::new(server.clone()));
    Vfs::new(client, Account::new("memory", "tempZone", "rods"), cfg)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

#[test]
fn test_sequential_read_with_prefetch() {
    let server = MemoryServer::new();
    let cfg = FsConfig {
        block_size: 65536,
        preload_num_blocks: 3,
        preload_num_threads: 3,
        ..Default::default()
    };
    let vfs = mount_vfs(&server, cfg);

    let content = patterned(200_000);
    server.add_file("/tempZone/home/rods/big.bin", &content);
    server.reset_counts();

    let fh = vfs.open("/tempZone/home/rods/big.bin", libc::O_RDONLY).unwrap();
    let data = vfs.read(fh, 0, 200_000).unwrap();
    assert_eq!(data, content);

    // four data blocks plus at most three speculative end-of-file probes
    let counts = server.counts();
    assert!(
        counts.reads <= 7,
        "expected at most 7 read RPCs, saw {}",
        counts.reads
    );

    vfs.release(fh).unwrap();
    assert_eq!(server.open_descriptor_count(), 0);
}

#[test]
fn test_unaligned_read_services_one_block() {
    let server = MemoryServer::new();
    let cfg = FsConfig {
        block_size: 65536,
        preload: false,
        ..Default::default()
    };
    let vfs = mount_vfs(&server, cfg);

    let content = patterned(300);
    server.add_file("/tempZone/home/rods/small.bin", &content);
    server.reset_counts();

    let fh = vfs.open("/tempZone/home/rods/small.bin", libc::O_RDONLY).unwrap();
    let data = vfs.read(fh, 100, 200).unwrap();
    assert_eq!(data, &content[100..300]);
    assert_eq!(server.counts().reads, 1);
    vfs.release(fh).unwrap();
}

#[test]
fn test_backward_seek_rereads_byte_equal() {
    let server = MemoryServer::new();
    let cfg = FsConfig {
        block_size: 65536,
        ..Default::default()
    };
    let vfs = mount_vfs(&server, cfg);

    let content = patterned(131_072);
    server.add_file("/tempZone/home/rods/two.bin", &content);

    let fh = vfs.open("/tempZone/home/rods/two.bin", libc::O_RDONLY).unwrap();
    let first = vfs.read(fh, 0, 65_536).unwrap();

    let seeks_before = server.counts().seeks;
    let second = vfs.read(fh, 0, 65_536).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, &content[..65_536]);
    // the re-read goes back to the server, repositioning the descriptor
    assert!(server.counts().seeks > seeks_before);
    vfs.release(fh).unwrap();
}

#[test]
fn test_failed_prefetch_falls_back_to_synchronous_read() {
    let server = MemoryServer::new();
    let cfg = FsConfig {
        block_size: 4096,
        ..Default::default()
    };
    let vfs = mount_vfs(&server, cfg);

    let content = patterned(12_288);
    server.add_file("/tempZone/home/rods/flaky.bin", &content);
    // every prefetch descriptor is secondary; only the main one reads
    server.set_fault(Fault::FailSecondaryReads);

    let fh = vfs.open("/tempZone/home/rods/flaky.bin", libc::O_RDONLY).unwrap();
    let data = vfs.read(fh, 0, 12_288).unwrap();
    assert_eq!(data, content);
    vfs.release(fh).unwrap();
    assert_eq!(server.open_descriptor_count(), 0);
}

#[test]
fn test_prefetch_degrades_at_connection_cap() {
    let server = MemoryServer::new();
    let cfg = FsConfig {
        block_size: 4096,
        max_conn: 1,
        ..Default::default()
    };
    let vfs = mount_vfs(&server, cfg);

    let content = patterned(12_288);
    server.add_file("/tempZone/home/rods/capped.bin", &content);

    // the single connection is held by the open file; prefetch workers
    // cannot lease one and the read must still complete synchronously
    let fh = vfs.open("/tempZone/home/rods/capped.bin", libc::O_RDONLY).unwrap();
    let data = vfs.read(fh, 0, 12_288).unwrap();
    assert_eq!(data, content);
    vfs.release(fh).unwrap();
}

#[test]
fn test_pointer_tracks_descriptor_position() {
    let server = MemoryServer::new();
    server.mkdir_all("/tempZone/home/rods");
    let content = patterned(20_000);
    server.add_file("/tempZone/home/rods/pos.bin", &content);

    let client = Arc::new(MemoryClient::new(server.clone()));
    let account = Account::new("memory", "tempZone", "rods");
    let cfg = FsConfig {
        block_size: 4096,
        ..Default::default()
    };
    let pool = Arc::new(ConnPool::new(client, account, &cfg));
    let registry = Arc::new(FdRegistry::new(pool.clone(), Rpc::new(cfg.rpc_timeout_sec)));

    let conn = pool.get_and_use(ConnKind::FileIo).unwrap();
    let handle = registry
        .open(&conn, "/tempZone/home/rods/pos.bin", libc::O_RDONLY)
        .unwrap();

    // before any traffic the descriptor sits at the start
    assert_eq!(handle.last_file_pointer(), 0);
    assert_eq!(server.descriptor_position(handle.remote_fd()), Some(0));

    let buffered = irodsfs::buffered::BufferedFs::new(
        pool.clone(),
        registry.clone(),
        None,
        &cfg,
    );
    buffered.read_block(&handle, 2, &mut vec![0u8; 4096]).unwrap();
    assert_eq!(handle.last_file_pointer(), 3 * 4096);
    assert_eq!(
        server.descriptor_position(handle.remote_fd()),
        Some(handle.last_file_pointer())
    );

    registry.close(handle).unwrap();
}

#[test]
fn test_read_while_other_files_active() {
    let server = MemoryServer::new();
    let cfg = FsConfig {
        block_size: 4096,
        ..Default::default()
    };
    let vfs = Arc::new(mount_vfs(&server, cfg));

    let a = patterned(30_000);
    let b: Vec<u8> = patterned(30_000).iter().map(|v| v.wrapping_add(1)).collect();
    server.add_file("/tempZone/home/rods/a.bin", &a);
    server.add_file("/tempZone/home/rods/b.bin", &b);

    let handles: Vec<_> = ["a.bin", "b.bin"]
        .iter()
        .map(|name| {
            let vfs = vfs.clone();
            let path = format!("/tempZone/home/rods/{}", name);
            std::thread::spawn(move || {
                let fh = vfs.open(&path, libc::O_RDONLY).unwrap();
                let data = vfs.read(fh, 0, 30_000).unwrap();
                vfs.release(fh).unwrap();
                data
            })
        })
        .collect();

    let results: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results[0], a);
    assert_eq!(results[1], b);
    assert_eq!(server.open_descriptor_count(), 0);
}
