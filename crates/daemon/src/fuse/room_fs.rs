//! `fuser` filesystem over a mounted room
//!
//! Each callback resolves the inode to a path and runs the matching
//! [`MatrixFs`] operation on the tokio runtime. The kernel delivers writes
//! in pieces; they are gathered per open handle and committed as one whole
//! file write on flush, fsync or release.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use tokio::runtime::Handle;

use common::path;
use common::prelude::{EntryKind, FsError, MatrixFs, RoomStateProvider, Stat};

use super::errno::{errno, NO_ATTRIBUTE};
use super::inode_table::InodeTable;

/// How long the kernel may cache attributes and lookups
const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;

/// A file opened by the kernel
#[derive(Debug)]
struct OpenFile {
    path: String,
    /// Whole content to commit; loaded on first write
    buffer: Option<Vec<u8>>,
    dirty: bool,
}

pub struct RoomFs<P> {
    fs: MatrixFs<P>,
    runtime: Handle,
    inodes: InodeTable,
    open_files: HashMap<u64, OpenFile>,
    next_fh: u64,
    uid: u32,
    gid: u32,
}

impl<P: RoomStateProvider> RoomFs<P> {
    pub fn new(fs: MatrixFs<P>, runtime: Handle) -> Self {
        // SAFETY: getuid/getgid cannot fail and touch no memory
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            fs,
            runtime,
            inodes: InodeTable::new(),
            open_files: HashMap::new(),
            next_fh: 1,
            uid,
            gid,
        }
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inodes
            .get_path(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        self.inodes.child_path(parent, name).ok_or(libc::ENOENT)
    }

    fn attr(&mut self, path: &str) -> Result<FileAttr, c_int> {
        let stat = self.block_on(self.fs.stat(path)).map_err(|e| errno(&e))?;
        // Unflushed writes decide the size the kernel sees
        let size = self
            .open_files
            .values()
            .filter(|file| file.path == path && file.dirty)
            .find_map(|file| file.buffer.as_ref().map(|buffer| buffer.len() as u64))
            .unwrap_or(stat.size);
        let ino = self.inodes.get_or_create(path);
        Ok(file_attr(
            ino,
            &stat,
            size,
            self.fs.can_write_any(),
            self.uid,
            self.gid,
        ))
    }

    fn open_handle(&mut self, path: &str, truncate: bool) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.open_files.insert(
            fh,
            OpenFile {
                path: path.to_string(),
                buffer: truncate.then(Vec::new),
                dirty: truncate,
            },
        );
        fh
    }

    fn buffer_for(&mut self, fh: u64) -> Result<&mut OpenFile, c_int> {
        let file = self.open_files.get_mut(&fh).ok_or(libc::EBADF)?;
        if file.buffer.is_none() {
            let content = self
                .runtime
                .block_on(self.fs.read(&file.path))
                .map_err(|e| errno(&e))?;
            file.buffer = Some(content);
        }
        Ok(file)
    }

    fn commit(&mut self, fh: u64) -> Result<(), c_int> {
        let Some(file) = self.open_files.get_mut(&fh) else {
            return Ok(());
        };
        let (true, Some(buffer)) = (file.dirty, file.buffer.as_ref()) else {
            return Ok(());
        };
        self.runtime
            .block_on(self.fs.write(&file.path, buffer))
            .map_err(|e| {
                tracing::warn!("committing {} failed: {}", file.path, e);
                errno(&e)
            })?;
        file.dirty = false;
        Ok(())
    }

    fn truncate(&mut self, path: &str, size: u64) -> Result<(), c_int> {
        let mut content = if size == 0 {
            Vec::new()
        } else {
            self.block_on(self.fs.read(path)).map_err(|e| errno(&e))?
        };
        content.resize(size as usize, 0);
        self.block_on(self.fs.write(path, &content))
            .map_err(|e| errno(&e))
    }

    fn create_file(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        self.block_on(async {
            if self.fs.exists(path) {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
            self.fs.touch(path).await?;
            if mode & 0o111 != 0 {
                self.fs.set_executable(path, true).await?;
            }
            Ok(())
        })
    }
}

impl<P: RoomStateProvider> Filesystem for RoomFs<P> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        tracing::info!(
            "filesystem ready ({})",
            if self.fs.can_write_any() {
                "read-write"
            } else {
                "read-only until granted"
            }
        );
        Ok(())
    }

    fn destroy(&mut self) {
        let handles: Vec<u64> = self.open_files.keys().copied().collect();
        for fh in handles {
            let _ = self.commit(fh);
        }
        tracing::info!("filesystem released");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self
            .child_of(parent, name)
            .and_then(|path| self.attr(&path));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.path_of(ino).and_then(|path| self.attr(&path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };

        if let Some(size) = size {
            let open = fh.filter(|fh| self.open_files.contains_key(fh));
            let result = match open {
                Some(fh) => self.buffer_for(fh).map(|file| {
                    if let Some(buffer) = file.buffer.as_mut() {
                        buffer.resize(size as usize, 0);
                    }
                    file.dirty = true;
                }),
                None => self.truncate(&path, size),
            };
            if let Err(e) = result {
                return reply.error(e);
            }
        }

        if let Some(mode) = mode {
            if self.fs.is_file(&path) {
                let result = self.block_on(self.fs.set_executable(&path, mode & 0o111 != 0));
                if let Err(e) = result {
                    return reply.error(errno(&e));
                }
            }
        }

        if size.is_none() && (atime.is_some() || mtime.is_some()) {
            if let Err(e) = self.block_on(self.fs.touch(&path)) {
                return reply.error(errno(&e));
            }
        }

        match self.attr(&path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        let children = match self.fs.list_children(&path) {
            Ok(children) => children,
            Err(e) => return reply.error(errno(&e)),
        };

        let parent_ino = self.inodes.get_or_create(path::parent(&path));
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for name in children {
            let child = path::join(&path, &name);
            let kind = match self.fs.kind(&child) {
                Some(EntryKind::Directory) => FileType::Directory,
                _ => FileType::RegularFile,
            };
            entries.push((self.inodes.get_or_create(&child), kind, name));
        }

        let skip = usize::try_from(offset).unwrap_or(0);
        for (index, (child_ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
            if reply.add(child_ino, (index + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
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
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = self.block_on(self.fs.create_dir(&path)) {
            return reply.error(errno(&e));
        }
        match self.attr(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        if mode & (libc::S_IFMT as u32) != libc::S_IFREG as u32 {
            return reply.error(libc::EPERM);
        }
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = self.create_file(&path, mode & !umask) {
            return reply.error(errno(&e));
        }
        match self.attr(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = self.create_file(&path, mode & !umask) {
            return reply.error(errno(&e));
        }
        match self.attr(&path) {
            Ok(attr) => {
                let fh = self.open_handle(&path, false);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        if !self.fs.is_file(&path) {
            return reply.error(if self.fs.exists(&path) {
                libc::EISDIR
            } else {
                libc::ENOENT
            });
        }

        let writing = flags & libc::O_ACCMODE != libc::O_RDONLY;
        if writing && !self.fs.can_write(&path) {
            return reply.error(libc::EACCES);
        }
        let fh = self.open_handle(&path, writing && flags & libc::O_TRUNC != 0);
        reply.opened(fh, 0);
    }

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
        let buffered = self
            .open_files
            .get(&fh)
            .and_then(|file| file.buffer.as_ref())
            .map(|buffer| window(buffer, offset, size).to_vec());
        if let Some(data) = buffered {
            return reply.data(&data);
        }

        let result = self
            .path_of(ino)
            .and_then(|path| self.block_on(self.fs.read(&path)).map_err(|e| errno(&e)));
        match result {
            Ok(content) => reply.data(window(&content, offset, size)),
            Err(e) => reply.error(e),
        }
    }

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
        let Ok(offset) = usize::try_from(offset) else {
            return reply.error(libc::EINVAL);
        };
        match self.buffer_for(fh) {
            Ok(file) => {
                if let Some(buffer) = file.buffer.as_mut() {
                    splice(buffer, offset, data);
                }
                file.dirty = true;
                reply.written(data.len() as u32);
            }
            Err(e) => reply.error(e),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.commit(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.commit(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
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
        let result = self.commit(fh);
        self.open_files.remove(&fh);
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.delete(&path)) {
            Ok(()) => {
                self.inodes.remove_by_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_of(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match self.block_on(self.fs.remove_dir(&path)) {
            Ok(()) => {
                self.inodes.remove_by_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(key), Ok(value)) = (name.to_str(), String::from_utf8(value.to_vec())) else {
            return reply.error(libc::EINVAL);
        };
        let result = self
            .path_of(ino)
            .and_then(|path| {
                self.block_on(self.fs.set_attribute(&path, key, value))
                    .map_err(|e| errno(&e))
            });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(key) = name.to_str() else {
            return reply.error(NO_ATTRIBUTE);
        };
        let result = self
            .path_of(ino)
            .and_then(|path| {
                self.block_on(self.fs.get_attribute(&path, key))
                    .map_err(|e| errno(&e))
            });
        match result {
            Ok(Some(value)) => reply_xattr(reply, value.as_bytes(), size),
            Ok(None) => reply.error(NO_ATTRIBUTE),
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self
            .path_of(ino)
            .and_then(|path| {
                self.block_on(self.fs.list_attribute_names(&path))
                    .map_err(|e| errno(&e))
            });
        match result {
            Ok(names) => {
                let mut data = Vec::new();
                for name in names {
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                }
                reply_xattr(reply, &data, size);
            }
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(key) = name.to_str() else {
            return reply.error(NO_ATTRIBUTE);
        };
        let result = self
            .path_of(ino)
            .and_then(|path| {
                self.block_on(self.fs.remove_attribute(&path, key))
                    .map_err(|e| errno(&e))
            });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        if !self.fs.exists(&path) {
            return reply.error(libc::ENOENT);
        }
        if mask & libc::W_OK != 0 && !self.fs.can_write_any() {
            return reply.error(libc::EACCES);
        }
        reply.ok();
    }
}

/// Answer an xattr request: a size probe, the data, or `ERANGE`
fn reply_xattr(reply: ReplyXattr, data: &[u8], size: u32) {
    if size == 0 {
        reply.size(data.len() as u32);
    } else if size as usize >= data.len() {
        reply.data(data);
    } else {
        reply.error(libc::ERANGE);
    }
}

fn to_system_time(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(millis).unwrap_or(0))
}

/// Permission bits; write bits only while the room lets us write
fn permissions(kind: EntryKind, executable: bool, writable: bool) -> u16 {
    let perm: u16 = match kind {
        EntryKind::Directory => 0o755,
        _ if executable => 0o755,
        _ => 0o644,
    };
    if writable {
        perm
    } else {
        perm & !0o222
    }
}

fn file_attr(ino: u64, stat: &Stat, size: u64, writable: bool, uid: u32, gid: u32) -> FileAttr {
    let directory = stat.kind == EntryKind::Directory;
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: to_system_time(stat.times.accessed),
        mtime: to_system_time(stat.times.modified),
        ctime: to_system_time(stat.times.changed),
        crtime: to_system_time(stat.times.changed),
        kind: if directory {
            FileType::Directory
        } else {
            FileType::RegularFile
        },
        perm: permissions(stat.kind, stat.executable, writable),
        nlink: if directory { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// The part of `content` a read at `offset` for `size` bytes returns
fn window(content: &[u8], offset: i64, size: u32) -> &[u8] {
    let start = usize::try_from(offset).unwrap_or(0).min(content.len());
    let end = start.saturating_add(size as usize).min(content.len());
    &content[start..end]
}

/// Write `data` into `buffer` at `offset`, zero-filling any gap
fn splice(buffer: &mut Vec<u8>, offset: usize, data: &[u8]) {
    let end = offset + data.len();
    if buffer.len() < end {
        buffer.resize(end, 0);
    }
    buffer[offset..end].copy_from_slice(data);
}
