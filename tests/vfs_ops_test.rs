/*!
 * Namespace operations across the full stack
 */

use std::sync::Arc;

use irodsfs::client::memory::{MemoryClient, MemoryServer};
use irodsfs::client::{Account, EntryKind};
use irodsfs::{FsConfig, FsError, Vfs};

fn mount_vfs(server: &MemoryServer, cfg: FsConfig) -> Vfs {
    server.mkdir_all("/tempZone/home/rods");
    let client = Arc::new(MemoryClient::new(server.clone()));
    Vfs::new(client, Account::new("memory", "tempZone", "rods"), cfg)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 233) as u8).collect()
}

#[test]
fn test_write_then_read_back_through_fresh_handle() {
    let server = MemoryServer::new();
    let cfg = FsConfig {
        block_size: 4096,
        ..Default::default()
    };
    let vfs = mount_vfs(&server, cfg);
    let path = "/tempZone/home/rods/out.bin";
    let content = patterned(10_000);

    vfs.create(path, 0o644).unwrap();
    let fh = vfs.open(path, libc::O_WRONLY).unwrap();
    let mut off = 0u64;
    for chunk in content.chunks(3_000) {
        off += vfs.write(fh, off, chunk).unwrap() as u64;
    }
    vfs.release(fh).unwrap();

    let fh = vfs.open(path, libc::O_RDONLY).unwrap();
    assert_eq!(vfs.read(fh, 0, 10_000).unwrap(), content);
    vfs.release(fh).unwrap();

    assert_eq!(vfs.getattr(path).unwrap().size, 10_000);
}

#[test]
fn test_tree_build_and_teardown() {
    let server = MemoryServer::new();
    let vfs = mount_vfs(&server, FsConfig::default());

    vfs.mkdir("/tempZone/home/rods/project").unwrap();
    vfs.mkdir("/tempZone/home/rods/project/data").unwrap();
    vfs.create("/tempZone/home/rods/project/readme.txt", 0o644).unwrap();

    let dh = vfs.opendir("/tempZone/home/rods/project").unwrap();
    let mut entries = vfs.readdir(dh).unwrap();
    vfs.releasedir(dh).unwrap();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        entries,
        vec![
            ("data".to_string(), EntryKind::Collection),
            ("readme.txt".to_string(), EntryKind::DataObject),
        ]
    );

    vfs.unlink("/tempZone/home/rods/project/readme.txt").unwrap();
    vfs.rmdir("/tempZone/home/rods/project/data").unwrap();
    vfs.rmdir("/tempZone/home/rods/project").unwrap();
    assert!(matches!(
        vfs.getattr("/tempZone/home/rods/project"),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn test_rename_moves_content() {
    let server = MemoryServer::new();
    let vfs = mount_vfs(&server, FsConfig::default());
    server.add_file("/tempZone/home/rods/old.bin", &patterned(5_000));

    vfs.rename("/tempZone/home/rods/old.bin", "/tempZone/home/rods/new.bin")
        .unwrap();

    let fh = vfs.open("/tempZone/home/rods/new.bin", libc::O_RDONLY).unwrap();
    assert_eq!(vfs.read(fh, 0, 5_000).unwrap(), patterned(5_000));
    vfs.release(fh).unwrap();

    assert!(matches!(
        vfs.open("/tempZone/home/rods/old.bin", libc::O_RDONLY),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn test_removing_missing_object_reports_lookup_miss() {
    let server = MemoryServer::new();
    let vfs = mount_vfs(&server, FsConfig::default());

    assert!(matches!(
        vfs.unlink("/tempZone/home/rods/ghost.bin"),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        vfs.rmdir("/tempZone/home/rods/ghost"),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn test_full_lifecycle_quiesces_cleanly() {
    let server = MemoryServer::new();
    let cfg = FsConfig {
        block_size: 4096,
        ..Default::default()
    };
    let vfs = mount_vfs(&server, cfg);
    vfs.start();

    for name in ["a", "b", "c", "d"] {
        server.add_file(
            &format!("/tempZone/home/rods/{}.bin", name),
            &patterned(25_000),
        );
    }

    let mut handles = Vec::new();
    for name in ["a", "b", "c", "d"] {
        handles.push(
            vfs.open(&format!("/tempZone/home/rods/{}.bin", name), libc::O_RDONLY)
                .unwrap(),
        );
    }
    for &fh in &handles {
        assert_eq!(vfs.read(fh, 0, 25_000).unwrap(), patterned(25_000));
    }
    for fh in handles {
        vfs.release(fh).unwrap();
    }

    vfs.shutdown();
    assert_eq!(server.open_descriptor_count(), 0);

    let report = vfs.conn_report();
    assert_eq!(report.inuse_file_io, 0);
    assert_eq!(report.free_file_io, 0);
}
