/*!
 * Kernel dispatch shim
 *
 * Implements the fuser callbacks on top of the path-based core. The kernel
 * speaks inodes; the shim keeps a bidirectional inode/path table with
 * lazily allocated, session-stable inode numbers. Errors cross the
 * boundary as negative errno values via `FsError::to_errno`.
 */

use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use log::{debug, error, info};

use crate::client::{join_path, EntryKind, ObjStat};
use crate::vfs::Vfs;

const ATTR_TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Bidirectional inode/path mapping with lazy allocation. Inode numbers
/// are stable for the lifetime of the mount.
struct InodeTable {
    ino_to_path: DashMap<u64, String>,
    path_to_ino: DashMap<String, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    fn new(root_path: &str) -> Self {
        let table = Self {
            ino_to_path: DashMap::new(),
            path_to_ino: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        };
        table.ino_to_path.insert(ROOT_INO, root_path.to_string());
        table.path_to_ino.insert(root_path.to_string(), ROOT_INO);
        table
    }

    fn get_or_allocate(&self, path: &str) -> u64 {
        let ino = *self
            .path_to_ino
            .entry(path.to_string())
            .or_insert_with(|| self.next_ino.fetch_add(1, Ordering::SeqCst));
        self.ino_to_path.insert(ino, path.to_string());
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.ino_to_path.get(&ino).map(|e| e.value().clone())
    }

    /// Rewrite a path and everything under it after a rename.
    fn rename_prefix(&self, from: &str, to: &str) {
        let child_prefix = format!("{}/", from);
        let affected: Vec<(u64, String)> = self
            .ino_to_path
            .iter()
            .filter(|e| e.value() == from || e.value().starts_with(&child_prefix))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (ino, old_path) in affected {
            let new_path = format!("{}{}", to, &old_path[from.len()..]);
            self.path_to_ino.remove(&old_path);
            self.path_to_ino.insert(new_path.clone(), ino);
            self.ino_to_path.insert(ino, new_path);
        }
    }
}

pub struct IrodsFuse {
    vfs: Arc<Vfs>,
    inodes: InodeTable,
    uid: u32,
    gid: u32,
}

impl IrodsFuse {
    pub fn new(vfs: Arc<Vfs>) -> Self {
        let root = vfs.account().workdir.clone();
        Self {
            inodes: InodeTable::new(&root),
            vfs,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn attr_from(&self, ino: u64, stat: &ObjStat) -> FileAttr {
        let mtime = UNIX_EPOCH + Duration::from_secs(stat.mtime.max(0) as u64);
        let ctime = UNIX_EPOCH + Duration::from_secs(stat.ctime.max(0) as u64);
        let is_dir = stat.kind == EntryKind::Collection;
        FileAttr {
            ino,
            size: stat.size,
            blocks: (stat.size + 511) / 512,
            atime: mtime,
            mtime,
            ctime,
            crtime: ctime,
            kind: if is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: (stat.mode & 0o7777) as u16,
            nlink: if is_dir { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, i32> {
        self.inodes.path_of(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(join_path(&parent_path, name))
    }
}

fn unix_secs(time: TimeOrNow) -> i64 {
    let st = match time {
        TimeOrNow::SpecificTime(st) => st,
        TimeOrNow::Now => SystemTime::now(),
    };
    st.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Filesystem for IrodsFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        // background threads must not start before the mount is live
        self.vfs.start();
        info!("mounted {}", self.vfs.account().workdir);
        Ok(())
    }

    fn destroy(&mut self) {
        self.vfs.shutdown();
        info!("unmounted {}", self.vfs.account().workdir);
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.vfs.getattr(&path) {
            Ok(stat) => {
                let ino = self.inodes.get_or_allocate(&path);
                reply.entry(&ATTR_TTL, &self.attr_from(ino, &stat), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.vfs.getattr(&path) {
            Ok(stat) => reply.attr(&ATTR_TTL, &self.attr_from(ino, &stat)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };

        let result = (|| -> crate::error::Result<()> {
            if let Some(size) = size {
                self.vfs.truncate(&path, size)?;
            }
            if let Some(mode) = mode {
                self.vfs.chmod(&path, mode & 0o7777)?;
            }
            if uid.is_some() || gid.is_some() {
                self.vfs
                    .chown(&path, uid.unwrap_or(self.uid), gid.unwrap_or(self.gid))?;
            }
            if let Some(mtime) = mtime {
                self.vfs.utimens(&path, Some(unix_secs(mtime)))?;
            }
            Ok(())
        })();

        match result.and_then(|_| self.vfs.getattr(&path)) {
            Ok(stat) => reply.attr(&ATTR_TTL, &self.attr_from(ino, &stat)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyData) {
        // no symbolic links in the remote namespace
        reply.error(libc::EINVAL);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if mode & libc::S_IFMT != libc::S_IFREG {
            return reply.error(libc::EPERM);
        }
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self
            .vfs
            .create(&path, mode & 0o7777)
            .and_then(|_| self.vfs.getattr(&path))
        {
            Ok(stat) => {
                let ino = self.inodes.get_or_allocate(&path);
                reply.entry(&ATTR_TTL, &self.attr_from(ino, &stat), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self
            .vfs
            .mkdir(&path)
            .and_then(|_| self.vfs.getattr(&path))
        {
            Ok(stat) => {
                let ino = self.inodes.get_or_allocate(&path);
                reply.entry(&ATTR_TTL, &self.attr_from(ino, &stat), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.vfs.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.vfs.rmdir(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let to = match self.child_path(newparent, newname) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.vfs.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename_prefix(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.vfs.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        debug!("read ino {} fh {} off {} size {}", ino, fh, offset, size);
        match self.vfs.read(fh, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read failed: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.vfs.write(fh, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                error!("write failed: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.vfs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.vfs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.vfs.fsync(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.vfs.opendir(&path) {
            Ok(dh) => reply.opened(dh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let children = match self.vfs.readdir(fh) {
            Ok(entries) => entries,
            Err(e) => return reply.error(e.to_errno()),
        };

        let mut listing: Vec<(u64, FileType, String)> = Vec::with_capacity(children.len() + 2);
        listing.push((ino, FileType::Directory, ".".to_string()));
        listing.push((ino, FileType::Directory, "..".to_string()));
        for (name, kind) in children {
            let child_ino = self.inodes.get_or_allocate(&join_path(&path, &name));
            let file_type = match kind {
                EntryKind::Collection => FileType::Directory,
                EntryKind::DataObject => FileType::RegularFile,
            };
            listing.push((child_ino, file_type, name));
        }

        for (idx, (child_ino, file_type, name)) in
            listing.iter().enumerate().skip(offset as usize)
        {
            // the offset passed along is that of the next entry
            if reply.add(*child_ino, (idx + 1) as i64, *file_type, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.vfs.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let s = self.vfs.statfs();
        reply.statfs(
            s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn ioctl(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: u32,
        _cmd: u32,
        _in_data: &[u8],
        _out_size: u32,
        reply: fuser::ReplyIoctl,
    ) {
        reply.error(libc::ENOSYS);
    }
}

/// Mount the filesystem and dispatch kernel callbacks until unmount.
pub fn mount(vfs: Arc<Vfs>, mountpoint: &Path) -> std::io::Result<()> {
    let options = vec![
        MountOption::FSName("irodsfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    fuser::mount2(IrodsFuse::new(vfs), mountpoint, &options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_table_allocation() {
        let table = InodeTable::new("/tempZone/home/rods");
        assert_eq!(table.path_of(ROOT_INO).unwrap(), "/tempZone/home/rods");

        let a = table.get_or_allocate("/tempZone/home/rods/a");
        let b = table.get_or_allocate("/tempZone/home/rods/b");
        assert_ne!(a, b);
        assert_eq!(table.get_or_allocate("/tempZone/home/rods/a"), a);
        assert_eq!(table.path_of(a).unwrap(), "/tempZone/home/rods/a");
    }

    #[test]
    fn test_inode_table_rename_prefix() {
        let table = InodeTable::new("/z/home/rods");
        let dir = table.get_or_allocate("/z/home/rods/dir");
        let file = table.get_or_allocate("/z/home/rods/dir/f.txt");

        table.rename_prefix("/z/home/rods/dir", "/z/home/rods/moved");
        assert_eq!(table.path_of(dir).unwrap(), "/z/home/rods/moved");
        assert_eq!(table.path_of(file).unwrap(), "/z/home/rods/moved/f.txt");
        assert_eq!(table.get_or_allocate("/z/home/rods/moved"), dir);
    }
}
