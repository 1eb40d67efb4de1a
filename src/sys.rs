//! Thin safe wrappers over the syscalls both sides of the filesystem use.
//!
//! Every file operation is performed relative to an open directory fd with
//! the `*at` family, so a rename of the base tree cannot redirect in-flight
//! operations. All wrappers return `io::Result` with the raw OS error
//! preserved; callers that speak the wire protocol turn that into a negated
//! errno result.

use std::ffi::CStr;
use std::ffi::CString;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::io;
use std::io::IoSlice;
use std::io::IoSliceMut;
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::IntoRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::path::Path;

use nix::errno::Errno;

/// Checks the return value of a libc call, mapping `-1` to the current
/// `errno`.
fn check_retval<T: From<i8> + PartialEq>(t: T) -> io::Result<T> {
    if t == T::from(-1_i8) {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}

/// Builds a C path from raw bytes. An interior NUL cannot name a real file,
/// so it is reported as `EINVAL`.
pub fn cstring(path: &[u8]) -> io::Result<CString> {
    CString::new(path).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Opens a base directory by absolute or cwd-relative path. This is the only
/// place a full pathname is used; everything afterwards goes through the
/// returned fd.
pub fn open_base(path: &Path) -> io::Result<OwnedFd> {
    let cpath = cstring(path.as_os_str().as_bytes())?;
    let fd = check_retval(unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn openat(
    dirfd: BorrowedFd<'_>,
    path: &CStr,
    flags: libc::c_int,
    mode: libc::mode_t,
) -> io::Result<OwnedFd> {
    let fd = check_retval(unsafe {
        libc::openat(
            dirfd.as_raw_fd(),
            path.as_ptr(),
            flags | libc::O_CLOEXEC,
            mode as libc::c_uint,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn mkdirat(dirfd: BorrowedFd<'_>, path: &CStr, mode: libc::mode_t) -> io::Result<()> {
    check_retval(unsafe { libc::mkdirat(dirfd.as_raw_fd(), path.as_ptr(), mode) })?;
    Ok(())
}

pub fn unlinkat(dirfd: BorrowedFd<'_>, path: &CStr, flags: libc::c_int) -> io::Result<()> {
    check_retval(unsafe { libc::unlinkat(dirfd.as_raw_fd(), path.as_ptr(), flags) })?;
    Ok(())
}

pub fn symlinkat(target: &CStr, dirfd: BorrowedFd<'_>, linkpath: &CStr) -> io::Result<()> {
    check_retval(unsafe {
        libc::symlinkat(target.as_ptr(), dirfd.as_raw_fd(), linkpath.as_ptr())
    })?;
    Ok(())
}

pub fn linkat(
    olddirfd: BorrowedFd<'_>,
    oldpath: &CStr,
    newdirfd: BorrowedFd<'_>,
    newpath: &CStr,
) -> io::Result<()> {
    check_retval(unsafe {
        libc::linkat(
            olddirfd.as_raw_fd(),
            oldpath.as_ptr(),
            newdirfd.as_raw_fd(),
            newpath.as_ptr(),
            0,
        )
    })?;
    Ok(())
}

pub fn renameat2(
    olddirfd: BorrowedFd<'_>,
    oldpath: &CStr,
    newdirfd: BorrowedFd<'_>,
    newpath: &CStr,
    flags: libc::c_uint,
) -> io::Result<()> {
    check_retval(unsafe {
        libc::renameat2(
            olddirfd.as_raw_fd(),
            oldpath.as_ptr(),
            newdirfd.as_raw_fd(),
            newpath.as_ptr(),
            flags,
        )
    })?;
    Ok(())
}

pub fn fchmodat(dirfd: BorrowedFd<'_>, path: &CStr, mode: libc::mode_t) -> io::Result<()> {
    check_retval(unsafe { libc::fchmodat(dirfd.as_raw_fd(), path.as_ptr(), mode, 0) })?;
    Ok(())
}

pub fn fchownat(
    dirfd: BorrowedFd<'_>,
    path: &CStr,
    uid: libc::uid_t,
    gid: libc::gid_t,
) -> io::Result<()> {
    check_retval(unsafe {
        libc::fchownat(
            dirfd.as_raw_fd(),
            path.as_ptr(),
            uid,
            gid,
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(())
}

pub fn utimensat(
    dirfd: BorrowedFd<'_>,
    path: &CStr,
    times: &[libc::timespec; 2],
) -> io::Result<()> {
    check_retval(unsafe {
        libc::utimensat(
            dirfd.as_raw_fd(),
            path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(())
}

pub fn fstatat(dirfd: BorrowedFd<'_>, path: &CStr, flags: libc::c_int) -> io::Result<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    check_retval(unsafe {
        libc::fstatat(dirfd.as_raw_fd(), path.as_ptr(), st.as_mut_ptr(), flags)
    })?;
    Ok(unsafe { st.assume_init() })
}

pub fn readlinkat(dirfd: BorrowedFd<'_>, path: &CStr) -> io::Result<OsString> {
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let len = check_retval(unsafe {
        libc::readlinkat(
            dirfd.as_raw_fd(),
            path.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    })?;
    buf.truncate(len as usize);
    Ok(OsString::from_vec(buf))
}

pub fn faccessat(
    dirfd: BorrowedFd<'_>,
    path: &CStr,
    mode: libc::c_int,
    flags: libc::c_int,
) -> io::Result<()> {
    check_retval(unsafe { libc::faccessat(dirfd.as_raw_fd(), path.as_ptr(), mode, flags) })?;
    Ok(())
}

pub fn ftruncate(fd: BorrowedFd<'_>, size: libc::off_t) -> io::Result<()> {
    check_retval(unsafe { libc::ftruncate(fd.as_raw_fd(), size) })?;
    Ok(())
}

pub fn fsync(fd: BorrowedFd<'_>) -> io::Result<()> {
    check_retval(unsafe { libc::fsync(fd.as_raw_fd()) })?;
    Ok(())
}

pub fn pread(fd: BorrowedFd<'_>, buf: &mut [u8], offset: libc::off_t) -> io::Result<usize> {
    let n = check_retval(unsafe {
        libc::pread(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), offset)
    })?;
    Ok(n as usize)
}

pub fn pwrite(fd: BorrowedFd<'_>, buf: &[u8], offset: libc::off_t) -> io::Result<usize> {
    let n = check_retval(unsafe {
        libc::pwrite(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len(), offset)
    })?;
    Ok(n as usize)
}

/// Duplicates an fd, keeping close-on-exec set on the copy.
pub fn dup_cloexec(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let duped = check_retval(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

pub fn fstatvfs(fd: BorrowedFd<'_>) -> io::Result<libc::statvfs> {
    let mut st = MaybeUninit::<libc::statvfs>::uninit();
    check_retval(unsafe { libc::fstatvfs(fd.as_raw_fd(), st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

/// Writes one frame with a single `writev`, retrying on `EINTR`.
pub fn send_frame(fd: BorrowedFd<'_>, iov: &[IoSlice<'_>]) -> io::Result<usize> {
    loop {
        match nix::sys::uio::writev(fd, iov) {
            Ok(n) => return Ok(n),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Reads one frame with a single `recvmsg`, retrying on `EINTR`. Returns the
/// byte count and whether the datagram was truncated to fit the iovecs; a
/// truncated frame means the peer violated the size cap.
pub fn recv_frame(fd: BorrowedFd<'_>, iov: &mut [IoSliceMut<'_>]) -> io::Result<(usize, bool)> {
    loop {
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        // IoSliceMut is guaranteed ABI-compatible with iovec.
        msg.msg_iov = iov.as_mut_ptr().cast::<libc::iovec>();
        msg.msg_iovlen = iov.len() as _;
        let n = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msg, 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        let truncated = msg.msg_flags & libc::MSG_TRUNC != 0;
        return Ok((n as usize, truncated));
    }
}

/// A directory stream over an fd, for serving `readdir` without retaining
/// any pathname.
pub struct Directory {
    dirp: *mut libc::DIR,
}

/// One entry as read from the stream. `kind` is the raw `d_type` byte;
/// `DT_UNKNOWN` means the underlying filesystem did not report a type.
pub struct DirectoryEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: u8,
}

impl Directory {
    /// Takes ownership of `fd` and turns it into a directory stream.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Directory> {
        let raw = fd.into_raw_fd();
        let dirp = unsafe { libc::fdopendir(raw) };
        if dirp.is_null() {
            let err = io::Error::last_os_error();
            // fdopendir only takes ownership on success.
            drop(unsafe { OwnedFd::from_raw_fd(raw) });
            return Err(err);
        }
        Ok(Directory { dirp })
    }

    /// Rewinds the stream to the first entry.
    pub fn rewind(&mut self) {
        unsafe { libc::rewinddir(self.dirp) };
    }
}

impl Iterator for Directory {
    type Item = io::Result<DirectoryEntry>;

    fn next(&mut self) -> Option<io::Result<DirectoryEntry>> {
        Errno::clear();
        let entry = unsafe { libc::readdir(self.dirp) };
        if entry.is_null() {
            return match Errno::last_raw() {
                0 => None,
                raw => Some(Err(io::Error::from_raw_os_error(raw))),
            };
        }
        let entry = unsafe { &*entry };
        let name = OsStr::from_bytes(unsafe { CStr::from_ptr(entry.d_name.as_ptr()) }.to_bytes());
        Some(Ok(DirectoryEntry {
            name: name.to_os_string(),
            ino: entry.d_ino,
            kind: entry.d_type,
        }))
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dirp) };
    }
}
