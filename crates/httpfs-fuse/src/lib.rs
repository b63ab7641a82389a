//! # httpfs-fuse
//!
//! FUSE adapter for the remote-site filesystem.
//!
//! Maps the tree index and cache pool behind [`httpfs_runtime::Store`]
//! to kernel filesystem operations:
//! - Inodes are assigned from tree arena positions, root is inode 1.
//! - Read operations go through the chunk cache.
//! - Every mutating operation is refused with `EROFS`.

pub mod table;

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod imp {
    use std::ffi::OsStr;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use fuser::{
        FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
        ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
        TimeOrNow,
    };
    use libc::{c_int, EBUSY, EINVAL, EISDIR, ENOENT, EROFS, O_ACCMODE, O_RDONLY, W_OK};
    use tracing::{debug, warn};

    use httpfs_runtime::{Store, StoreError};
    use httpfs_tree::NodeKind;

    use crate::table::{Entry, InodeTable};

    const TTL: Duration = Duration::from_secs(1);
    const BLOCK_SIZE: u32 = 4096;

    pub struct HttpFs {
        store: Arc<Store>,
        exec_files: bool,
        table: InodeTable,
    }

    impl HttpFs {
        pub fn new(store: Arc<Store>, exec_files: bool) -> Self {
            let table = InodeTable::build(&store, exec_files);
            Self {
                store,
                exec_files,
                table,
            }
        }

        /// Mount the filesystem at the given path (Ref: <https://docs.rs/fuser>)
        pub fn mount(self, mountpoint: &Path) -> anyhow::Result<()> {
            let opts = vec![
                MountOption::RO,
                MountOption::FSName("httpfs".to_string()),
            ];
            fuser::mount2(self, mountpoint, &opts)?;
            Ok(())
        }

        /// Pick up a swapped tree generation before serving an operation.
        fn refresh(&mut self) {
            if self.table.refresh(&self.store, self.exec_files) {
                debug!(generation = self.table.generation(), "inode table rebuilt");
            }
        }

        fn attr(entry: &Entry) -> FileAttr {
            let mtime = UNIX_EPOCH + Duration::from_secs(entry.mtime);
            FileAttr {
                ino: entry.ino,
                size: entry.size,
                blocks: entry.size.div_ceil(BLOCK_SIZE as u64),
                atime: mtime,
                mtime,
                ctime: mtime,
                crtime: mtime,
                kind: match entry.kind {
                    NodeKind::Directory => FileType::Directory,
                    NodeKind::RegularFile => FileType::RegularFile,
                    NodeKind::Symlink => FileType::Symlink,
                },
                perm: entry.perm,
                nlink: entry.nlink,
                uid: 0,
                gid: 0,
                rdev: 0,
                flags: 0,
                blksize: BLOCK_SIZE,
            }
        }

        fn errno(err: &StoreError) -> c_int {
            match err {
                StoreError::NotFound(_) => ENOENT,
                StoreError::NotRegular(_) => EISDIR,
                StoreError::Unsupported(_) => EINVAL,
                // Transient transport or cache trouble; the caller may
                // try again.
                StoreError::Cache(_) => EBUSY,
            }
        }
    }

    impl Filesystem for HttpFs {
        fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
            self.refresh();
            let name = match name.to_str() {
                Some(s) => s,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.table.child(parent, name) {
                Some(entry) => reply.entry(&TTL, &Self::attr(entry), 0),
                None => reply.error(ENOENT),
            }
        }

        fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
            self.refresh();
            self.store.stats().record_getattr();
            match self.table.get(ino) {
                Some(entry) => reply.attr(&TTL, &Self::attr(entry)),
                None => reply.error(ENOENT),
            }
        }

        fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
            self.refresh();
            match self.table.get(ino).and_then(|e| e.target.as_deref()) {
                Some(target) => reply.data(target.as_bytes()),
                None => reply.error(EINVAL),
            }
        }

        fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
            self.refresh();
            if flags & O_ACCMODE != O_RDONLY {
                reply.error(EROFS);
                return;
            }
            let entry = match self.table.get(ino) {
                Some(e) => e,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            if entry.kind == NodeKind::Directory {
                reply.error(EISDIR);
                return;
            }
            let (path, special) = (entry.path.clone(), entry.special);
            if let Err(e) = self.store.open(&path) {
                warn!(path = %path, error = %e, "open failed");
                reply.error(Self::errno(&e));
                return;
            }
            // Virtual content bypasses the page cache so each open sees
            // fresh output.
            let open_flags = if special != 0 {
                fuser::consts::FOPEN_DIRECT_IO
            } else {
                0
            };
            reply.opened(0, open_flags);
        }

        fn read(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            size: u32,
            _flags: c_int,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            self.refresh();
            let path = match self.table.get(ino) {
                Some(entry) => entry.path.clone(),
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            match self.store.read_at(&path, offset.max(0) as u64, size as usize) {
                Ok(data) => reply.data(&data),
                Err(e) => {
                    warn!(path = %path, offset, error = %e, "read failed");
                    reply.error(Self::errno(&e));
                }
            }
        }

        fn release(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            self.refresh();
            if let Some(entry) = self.table.get(ino) {
                let path = entry.path.clone();
                self.store.release(&path);
            }
            reply.ok();
        }

        fn readdir(
            &mut self,
            _req: &Request,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            self.refresh();
            self.store.stats().record_readdir();
            let rows = match self.table.listing(ino, offset) {
                Some(rows) => rows,
                None => {
                    reply.error(ENOENT);
                    return;
                }
            };
            for row in rows {
                let kind = match row.kind {
                    NodeKind::Directory => FileType::Directory,
                    NodeKind::Symlink => FileType::Symlink,
                    NodeKind::RegularFile => FileType::RegularFile,
                };
                if reply.add(row.ino, row.offset, kind, &row.name) {
                    break;
                }
            }
            reply.ok();
        }

        fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
            self.refresh();
            let files = self.table.len() as u64;
            reply.statfs(0, 0, 0, files, 0, BLOCK_SIZE, 255, BLOCK_SIZE);
        }

        fn setattr(
            &mut self,
            _req: &Request,
            _ino: u64,
            _mode: Option<u32>,
            _uid: Option<u32>,
            _gid: Option<u32>,
            _size: Option<u64>,
            _atime: Option<TimeOrNow>,
            _mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            reply.error(EROFS);
        }

        fn mknod(
            &mut self,
            _req: &Request,
            _parent: u64,
            _name: &OsStr,
            _mode: u32,
            _umask: u32,
            _rdev: u32,
            reply: ReplyEntry,
        ) {
            reply.error(EROFS);
        }

        fn mkdir(
            &mut self,
            _req: &Request,
            _parent: u64,
            _name: &OsStr,
            _mode: u32,
            _umask: u32,
            reply: ReplyEntry,
        ) {
            reply.error(EROFS);
        }

        fn unlink(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
            reply.error(EROFS);
        }

        fn rmdir(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
            reply.error(EROFS);
        }

        fn symlink(
            &mut self,
            _req: &Request,
            _parent: u64,
            _name: &OsStr,
            _target: &Path,
            reply: ReplyEntry,
        ) {
            reply.error(EROFS);
        }

        fn rename(
            &mut self,
            _req: &Request,
            _parent: u64,
            _name: &OsStr,
            _newparent: u64,
            _newname: &OsStr,
            _flags: u32,
            reply: ReplyEmpty,
        ) {
            reply.error(EROFS);
        }

        fn link(
            &mut self,
            _req: &Request,
            _ino: u64,
            _newparent: u64,
            _newname: &OsStr,
            reply: ReplyEntry,
        ) {
            reply.error(EROFS);
        }

        fn write(
            &mut self,
            _req: &Request,
            _ino: u64,
            _fh: u64,
            _offset: i64,
            _data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            reply.error(EROFS);
        }

        fn create(
            &mut self,
            _req: &Request,
            _parent: u64,
            _name: &OsStr,
            _mode: u32,
            _umask: u32,
            _flags: i32,
            reply: ReplyCreate,
        ) {
            reply.error(EROFS);
        }

        // The mount is world-readable; only write access is refused.
        fn access(&mut self, _req: &Request, _ino: u64, mask: i32, reply: ReplyEmpty) {
            if mask & W_OK != 0 {
                reply.error(EROFS);
                return;
            }
            reply.ok();
        }
    }
}

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
mod imp {
    use std::sync::Arc;

    use httpfs_runtime::Store;

    /// Dummy FUSE filesystem for non-Linux or non-feature builds
    pub struct HttpFs;

    impl HttpFs {
        pub fn new(_store: Arc<Store>, _exec_files: bool) -> Self {
            #[cfg(not(target_os = "linux"))]
            println!(
                "FUSE support is only available on Linux (current: {}).",
                std::env::consts::OS
            );
            #[cfg(all(target_os = "linux", not(feature = "fuse")))]
            println!("Mounting is disabled. Compile with --features fuse to enable.");
            Self
        }

        pub fn mount(self, _mountpoint: &std::path::Path) -> anyhow::Result<()> {
            anyhow::bail!("FUSE not supported in this build")
        }
    }
}

pub use imp::HttpFs;
