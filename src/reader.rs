//! The filesystem frontend.
//!
//! Read and metadata operations are served in-process with `*at` syscalls
//! against the base directory fd. Everything that mutates the tree, and
//! every open with write intent, is forwarded to the writer backend over the
//! control socket. The single `u64` file-handle slot the kernel gives us
//! routes per-handle I/O: handles below [`REMOTE_FD_OFFSET`] are local
//! read-only fds, handles at or above it are backend fds plus the offset.
//!
//! Once the controller revokes write access by shutting down the socket,
//! forwarded operations fail with `EIO` while everything local keeps
//! working until the filesystem is unmounted.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use fuser::FileAttr;
use fuser::FileType;
use fuser::Filesystem;
use fuser::KernelConfig;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyStatfs;
use fuser::ReplyWrite;
use fuser::ReplyXattr;
use fuser::Request;
use fuser::TimeOrNow;
use fuser::consts::FOPEN_DIRECT_IO;
use libc::c_int;
use log::debug;
use log::error;

use crate::inode::InodeTable;
use crate::inode::ROOT_INO;
use crate::remote::RemoteConn;
use crate::sys;
use crate::wire::REMOTE_FD_OFFSET;
use crate::wire::WireTimespec;

const TTL: Duration = Duration::from_secs(1);

/// Decides whether an open bypasses the backend entirely. Anything that can
/// create or modify the file has to go through it.
pub fn wants_write(flags: i32) -> bool {
    (flags & libc::O_ACCMODE) != libc::O_RDONLY || (flags & libc::O_CREAT) != 0
}

/// Routes a file handle: local read-only fd, or backend fd.
pub fn remote_fd(fh: u64) -> Option<i32> {
    if fh >= REMOTE_FD_OFFSET {
        Some((fh - REMOTE_FD_OFFSET) as i32)
    } else {
        None
    }
}

fn errno(err: &io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn path_bytes(path: &Path) -> &[u8] {
    path.as_os_str().as_bytes()
}

fn filetime(sec: i64, nsec: i64) -> SystemTime {
    let nsec = nsec.clamp(0, 999_999_999) as u32;
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec)
    } else {
        UNIX_EPOCH - Duration::new(sec.unsigned_abs(), 0) + Duration::new(0, nsec)
    }
}

fn system_time_parts(time: SystemTime) -> (i64, i64) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => (after.as_secs() as i64, i64::from(after.subsec_nanos())),
        Err(err) => {
            let before = err.duration();
            let mut sec = -(before.as_secs() as i64);
            let mut nsec = before.subsec_nanos();
            if nsec > 0 {
                sec -= 1;
                nsec = 1_000_000_000 - nsec;
            }
            (sec, i64::from(nsec))
        }
    }
}

fn file_kind(st_mode: libc::mode_t) -> FileType {
    match st_mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn dirent_kind(d_type: u8) -> Option<FileType> {
    match d_type {
        libc::DT_DIR => Some(FileType::Directory),
        libc::DT_REG => Some(FileType::RegularFile),
        libc::DT_LNK => Some(FileType::Symlink),
        libc::DT_FIFO => Some(FileType::NamedPipe),
        libc::DT_CHR => Some(FileType::CharDevice),
        libc::DT_BLK => Some(FileType::BlockDevice),
        libc::DT_SOCK => Some(FileType::Socket),
        _ => None,
    }
}

fn stat_to_attr(st: &libc::stat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: filetime(st.st_atime, st.st_atime_nsec),
        mtime: filetime(st.st_mtime, st.st_mtime_nsec),
        ctime: filetime(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_kind(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn wire_time(time: Option<TimeOrNow>) -> WireTimespec {
    match time {
        None => WireTimespec::omit(),
        Some(TimeOrNow::Now) => WireTimespec::now(),
        Some(TimeOrNow::SpecificTime(time)) => {
            let (sec, nsec) = system_time_parts(time);
            WireTimespec::new(sec, nsec)
        }
    }
}

pub struct RevokeFs {
    basefd: OwnedFd,
    remote: RemoteConn,
    inodes: InodeTable,
    /// Read-only files opened locally, keyed by their handle (the raw fd).
    local_files: HashMap<u64, OwnedFd>,
}

impl RevokeFs {
    pub fn new(basefd: OwnedFd, remote: RemoteConn) -> RevokeFs {
        RevokeFs {
            basefd,
            remote,
            inodes: InodeTable::new(),
            local_files: HashMap::new(),
        }
    }

    fn stat_path(&self, path: &Path) -> Result<libc::stat, c_int> {
        let cpath = sys::cstring(path_bytes(path)).map_err(|err| errno(&err))?;
        sys::fstatat(self.basefd.as_fd(), &cpath, libc::AT_SYMLINK_NOFOLLOW)
            .map_err(|err| errno(&err))
    }

    /// Registers the entry and builds the reply attributes in one step, so
    /// lookup counting can never diverge from what was replied.
    fn entry_attr(&mut self, path: &Path) -> Result<FileAttr, c_int> {
        let st = self.stat_path(path)?;
        let ino = self.inodes.register(path);
        Ok(stat_to_attr(&st, ino))
    }

    fn open_directory(&self, ino: u64, path: &Path) -> io::Result<sys::Directory> {
        if ino == ROOT_INO {
            // The root has no name of its own: re-open the base directory by
            // duplicating its fd (close-on-exec preserved) and rewinding.
            let mut dir = sys::Directory::from_fd(sys::dup_cloexec(self.basefd.as_fd())?)?;
            dir.rewind();
            Ok(dir)
        } else {
            let cpath = sys::cstring(path_bytes(path))?;
            let fd = sys::openat(
                self.basefd.as_fd(),
                &cpath,
                libc::O_RDONLY | libc::O_DIRECTORY,
                0,
            )?;
            sys::Directory::from_fd(fd)
        }
    }

    /// File type for a dirent whose filesystem did not report one.
    fn entry_kind(&self, dir_path: &Path, entry: &sys::DirectoryEntry) -> FileType {
        if let Some(kind) = dirent_kind(entry.kind) {
            return kind;
        }
        let child = if dir_path == Path::new(".") {
            PathBuf::from(&entry.name)
        } else {
            dir_path.join(&entry.name)
        };
        match self.stat_path(&child) {
            Ok(st) => file_kind(st.st_mode),
            Err(_) => FileType::RegularFile,
        }
    }
}

impl Filesystem for RevokeFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        match self.entry_attr(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.inodes.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        match self.stat_path(path) {
            Ok(st) => reply.attr(&TTL, &stat_to_attr(&st, ino)),
            Err(err) => reply.error(err),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path_of(ino).map(Path::to_path_buf) else {
            return reply.error(libc::ENOENT);
        };
        let bytes = path_bytes(&path);
        if let Some(mode) = mode {
            if let Err(err) = self.remote.chmod(bytes, mode) {
                return reply.error(err);
            }
        }
        if uid.is_some() || gid.is_some() {
            let uid = uid.unwrap_or(u32::MAX);
            let gid = gid.unwrap_or(u32::MAX);
            if let Err(err) = self.remote.chown(bytes, uid, gid) {
                return reply.error(err);
            }
        }
        if let Some(size) = size {
            if let Err(err) = self.remote.truncate(bytes, size) {
                return reply.error(err);
            }
        }
        if atime.is_some() || mtime.is_some() {
            if let Err(err) = self.remote.utimens(bytes, wire_time(atime), wire_time(mtime)) {
                return reply.error(err);
            }
        }
        match self.stat_path(&path) {
            Ok(st) => reply.attr(&TTL, &stat_to_attr(&st, ino)),
            Err(err) => reply.error(err),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        let target = sys::cstring(path_bytes(path))
            .and_then(|cpath| sys::readlinkat(self.basefd.as_fd(), &cpath));
        match target {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        // Device and special nodes have no business in a passthrough tree.
        reply.error(libc::EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        if let Err(err) = self.remote.mkdir(path_bytes(&path), mode) {
            return reply.error(err);
        }
        match self.entry_attr(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        match self.remote.unlink(path_bytes(&path)) {
            Ok(()) => {
                self.inodes.unlinked(&path);
                reply.ok();
            }
            Err(err) => reply.error(err),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        match self.remote.rmdir(path_bytes(&path)) {
            Ok(()) => {
                self.inodes.unlinked(&path);
                reply.ok();
            }
            Err(err) => reply.error(err),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.inodes.child_path(parent, link_name) else {
            return reply.error(libc::ENOENT);
        };
        if let Err(err) = self
            .remote
            .symlink(target.as_os_str().as_bytes(), path_bytes(&path))
        {
            return reply.error(err);
        }
        match self.entry_attr(&path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(_) => {
                // The backend reported success on the same tree we read
                // from. If the link is not there the two sides no longer
                // agree on what the base tree is, and nothing we return is
                // trustworthy.
                error!("backend created symlink {path:?} but it is not visible; aborting");
                std::process::abort();
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let Some(from) = self.inodes.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        let Some(to) = self.inodes.child_path(newparent, newname) else {
            return reply.error(libc::ENOENT);
        };
        match self
            .remote
            .rename(path_bytes(&from), path_bytes(&to), flags)
        {
            Ok(()) => {
                self.inodes.renamed(&from, &to);
                reply.ok();
            }
            Err(err) => reply.error(err),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let Some(from) = self.inodes.path_of(ino).map(Path::to_path_buf) else {
            return reply.error(libc::ENOENT);
        };
        let Some(to) = self.inodes.child_path(newparent, newname) else {
            return reply.error(libc::ENOENT);
        };
        if let Err(err) = self.remote.link(path_bytes(&from), path_bytes(&to)) {
            return reply.error(err);
        }
        match self.entry_attr(&to) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(err),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino).map(Path::to_path_buf) else {
            return reply.error(libc::ENOENT);
        };
        if !wants_write(flags) {
            let opened = sys::cstring(path_bytes(&path))
                .and_then(|cpath| sys::openat(self.basefd.as_fd(), &cpath, flags, 0));
            match opened {
                Ok(fd) => {
                    let fh = fd.as_raw_fd() as u64;
                    debug!("open {path:?} read-only, local handle {fh}");
                    self.local_files.insert(fh, fd);
                    reply.opened(fh, 0);
                }
                Err(err) => reply.error(errno(&err)),
            }
        } else {
            match self.remote.open(path_bytes(&path), flags, 0) {
                Ok(fd) => {
                    debug!("open {path:?} for writing, backend fd {fd}");
                    // Direct I/O so reads and writes on this handle reach
                    // the backend instead of the kernel page cache.
                    reply.opened(fd as u64 + REMOTE_FD_OFFSET, FOPEN_DIRECT_IO);
                }
                Err(err) => reply.error(err),
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            return reply.error(libc::ENOENT);
        };
        let fd = match self.remote.open(path_bytes(&path), flags, mode) {
            Ok(fd) => fd,
            Err(err) => return reply.error(err),
        };
        match self.entry_attr(&path) {
            Ok(attr) => reply.created(&TTL, &attr, 0, fd as u64 + REMOTE_FD_OFFSET, FOPEN_DIRECT_IO),
            Err(err) => {
                let _ = self.remote.close(fd);
                reply.error(err);
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if let Some(fd) = remote_fd(fh) {
            match self.remote.read_chunked(fd, offset, size as usize) {
                Ok(data) => reply.data(&data),
                Err(err) => reply.error(err),
            }
            return;
        }
        let Some(fd) = self.local_files.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match sys::pread(fd.as_fd(), &mut buf[filled..], offset + filled as i64) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(err) => return reply.error(errno(&err)),
            }
        }
        reply.data(&buf[..filled]);
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
        if let Some(fd) = remote_fd(fh) {
            match self.remote.write_chunked(fd, offset, data) {
                Ok(written) => reply.written(written as u32),
                Err(err) => reply.error(err),
            }
            return;
        }
        let Some(fd) = self.local_files.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        let mut written = 0;
        while written < data.len() {
            match sys::pwrite(fd.as_fd(), &data[written..], offset + written as i64) {
                Ok(0) => break,
                Ok(count) => written += count,
                Err(err) => return reply.error(errno(&err)),
            }
        }
        reply.written(written as u32);
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
        if let Some(fd) = remote_fd(fh) {
            match self.remote.close(fd) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err),
            }
            return;
        }
        match self.local_files.remove(&fh) {
            Some(_) => reply.ok(),
            None => reply.error(libc::EBADF),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        if let Some(fd) = remote_fd(fh) {
            match self.remote.fsync(fd) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err),
            }
            return;
        }
        let Some(fd) = self.local_files.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        match sys::fsync(fd.as_fd()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
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
        let Some(path) = self.inodes.path_of(ino).map(Path::to_path_buf) else {
            return reply.error(libc::ENOENT);
        };
        let dir = match self.open_directory(ino, &path) {
            Ok(dir) => dir,
            Err(err) => return reply.error(errno(&err)),
        };
        let entries = match dir.collect::<io::Result<Vec<_>>>() {
            Ok(entries) => entries,
            Err(err) => return reply.error(errno(&err)),
        };
        for (index, entry) in entries.iter().enumerate().skip(offset as usize) {
            let kind = self.entry_kind(&path, entry);
            if reply.add(entry.ino, (index + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // Exactly one base directory, so the base fd speaks for every path.
        match sys::fstatvfs(self.basefd.as_fd()) {
            Ok(st) => reply.statfs(
                st.f_blocks,
                st.f_bfree,
                st.f_bavail,
                st.f_files,
                st.f_ffree,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOTSUP);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.inodes.path_of(ino) else {
            return reply.error(libc::ENOENT);
        };
        // Always claim the tree is writable: coreutils probe access(W_OK)
        // before an unlink and would refuse to try if we said no. The
        // actual mutation still fails at the backend after revocation. A
        // stripped mask of 0 is still checked, as a plain existence probe.
        let mask = mask & !libc::W_OK;
        let checked = sys::cstring(path_bytes(path))
            .and_then(|cpath| sys::faccessat(self.basefd.as_fd(), &cpath, mask, 0));
        match checked {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }
}
