//! The writer backend: the only process that mutates the base tree.
//!
//! The backend reads framed requests from the control socket in a strictly
//! serial loop, performs the corresponding syscall relative to its own base
//! directory fd, and writes exactly one response per request. It trusts
//! nothing it receives: paths are validated to stay inside the base tree,
//! created modes are stripped of setuid/setgid and group/other write bits,
//! and I/O requests must reference descriptors this backend opened itself.
//!
//! Failures come in two flavors. A syscall error is an ordinary outcome,
//! reported to the peer as a negated errno. A malformed frame, an unknown
//! opcode, or a path escaping the tree means the peer is compromised or
//! buggy, and the backend terminates instead of trying to resynchronize the
//! stream.

use std::collections::HashMap;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

use log::debug;
use nix::errno::Errno;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::poll::poll;
use zerocopy::FromBytes;

use crate::sys;
use crate::wire;
use crate::wire::MAX_DATA_SIZE;
use crate::wire::MAX_REQUEST_SIZE;
use crate::wire::Opcode;
use crate::wire::Payload;
use crate::wire::REQUEST_HEADER_SIZE;
use crate::wire::ReplyHeader;
use crate::wire::RequestHeader;
use crate::wire::WireTimespec;

const DANGEROUS_MODE_BITS: libc::mode_t =
    libc::S_ISUID | libc::S_ISGID | libc::S_IWGRP | libc::S_IWOTH;

/// Strips mode bits the backend never applies, whatever the peer asked for.
fn mask_mode(mode: u32) -> libc::mode_t {
    (mode as libc::mode_t) & !DANGEROUS_MODE_BITS
}

fn protocol_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// A path is acceptable iff it is non-empty, relative, and has no `..`
/// component. Together with the `*at` syscalls this keeps every operation
/// inside the subtree rooted at the base fd.
fn validate_path(path: &[u8]) -> io::Result<()> {
    if path.is_empty() {
        return Err(protocol_error("empty path in request".into()));
    }
    if path[0] == b'/' {
        return Err(protocol_error(format!(
            "absolute path in request: {:?}",
            String::from_utf8_lossy(path)
        )));
    }
    if path.split(|&byte| byte == b'/').any(|component| component == b"..") {
        return Err(protocol_error(format!(
            "path escapes the base tree: {:?}",
            String::from_utf8_lossy(path)
        )));
    }
    Ok(())
}

fn errno_result(err: io::Error) -> i32 {
    -err.raw_os_error().unwrap_or(libc::EIO)
}

fn ok_or_errno(res: io::Result<()>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(err) => errno_result(err),
    }
}

/// The whole remaining payload as a validated path.
fn take_path<'a>(payload: &mut Payload<'a>) -> io::Result<&'a [u8]> {
    let path = payload.rest();
    validate_path(path)?;
    Ok(path)
}

/// Splits a two-path payload at the length carried in `arg1`. Validation is
/// the caller's business, not least because a symlink target is deliberately
/// left unvalidated.
fn split_paths<'a>(
    header: &RequestHeader,
    payload: &mut Payload<'a>,
) -> io::Result<(&'a [u8], &'a [u8])> {
    let first_len = header.arg1.get() as usize;
    let first = payload.take(first_len).ok_or_else(|| {
        protocol_error(format!(
            "two-path payload shorter than its declared first length {first_len}"
        ))
    })?;
    Ok((first, payload.rest()))
}

/// Requires an exhausted payload for ops that do not carry one.
fn expect_empty(payload: &Payload<'_>, op: &str) -> io::Result<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(protocol_error(format!("unexpected payload on {op} request")))
    }
}

/// All long-lived backend state. One instance is threaded through every
/// handler; there are no globals.
pub struct Writer {
    basefd: OwnedFd,
    socket: OwnedFd,
    exit_with: Option<OwnedFd>,
    open_fds: HashMap<RawFd, OwnedFd>,
}

impl Writer {
    /// `exit_with`, when present, couples this backend's lifetime to its
    /// controller: the backend terminates as soon as the fd reports hangup.
    pub fn new(basefd: OwnedFd, socket: OwnedFd, exit_with: Option<OwnedFd>) -> Writer {
        Writer {
            basefd,
            socket,
            exit_with,
            open_fds: HashMap::new(),
        }
    }

    /// Serves requests until the peer goes away (`Ok`) or violates the
    /// protocol (`Err`). Descriptors in the open set are released on drop.
    pub fn run(&mut self) -> io::Result<()> {
        let mut request = vec![0u8; MAX_REQUEST_SIZE];
        let mut response = vec![0u8; MAX_DATA_SIZE];
        loop {
            self.wait_for_request()?;
            let received = wire::recv_request(self.socket.as_fd(), &mut request)?;
            if received == 0 {
                debug!("control socket closed, shutting down");
                return Ok(());
            }
            if received < REQUEST_HEADER_SIZE {
                return Err(protocol_error(format!(
                    "request frame of {received} bytes is shorter than a header"
                )));
            }
            let (header, payload) = request[..received].split_at(REQUEST_HEADER_SIZE);
            let header = RequestHeader::read_from_bytes(header)
                .map_err(|_| protocol_error("unreadable request header".into()))?;
            let op = Opcode::try_from(header.op.get()).map_err(|_| {
                protocol_error(format!("unknown opcode {}", header.op.get()))
            })?;
            let (result, data_len) = self.dispatch(op, &header, payload, &mut response)?;
            wire::send_reply(
                self.socket.as_fd(),
                &ReplyHeader::new(result),
                &response[..data_len],
            )?;
        }
    }

    /// Blocks until the control socket has input or the exit-with fd hangs
    /// up. The exit-with fd wins when both fire.
    fn wait_for_request(&self) -> io::Result<()> {
        loop {
            let mut fds = Vec::with_capacity(2);
            fds.push(PollFd::new(self.socket.as_fd(), PollFlags::POLLIN));
            if let Some(exit_with) = &self.exit_with {
                fds.push(PollFd::new(exit_with.as_fd(), PollFlags::empty()));
            }
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
            if let Some(revents) = fds.get(1).and_then(|fd| fd.revents()) {
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                    return Err(io::Error::other("exit-with fd closed"));
                }
            }
            if fds[0].revents().is_some_and(|revents| !revents.is_empty()) {
                return Ok(());
            }
        }
    }

    fn dispatch(
        &mut self,
        op: Opcode,
        header: &RequestHeader,
        payload: &[u8],
        response: &mut [u8],
    ) -> io::Result<(i32, usize)> {
        debug!(
            "{op:?} arg1={} arg2={} arg3={}",
            header.arg1.get(),
            header.arg2.get(),
            header.arg3.get()
        );
        let mut payload = Payload::new(payload);
        if op == Opcode::Read {
            return self.do_read(header, &mut payload, response);
        }
        let result = match op {
            Opcode::Mkdir => self.do_mkdir(header, &mut payload)?,
            Opcode::Rmdir => self.do_rmdir(&mut payload)?,
            Opcode::Unlink => self.do_unlink(&mut payload)?,
            Opcode::Symlink => self.do_symlink(header, &mut payload)?,
            Opcode::Link => self.do_link(header, &mut payload)?,
            Opcode::Rename => self.do_rename(header, &mut payload)?,
            Opcode::Chmod => self.do_chmod(header, &mut payload)?,
            Opcode::Chown => self.do_chown(header, &mut payload)?,
            Opcode::Truncate => self.do_truncate(header, &mut payload)?,
            Opcode::Utimens => self.do_utimens(header, &mut payload)?,
            Opcode::Open => self.do_open(header, &mut payload)?,
            Opcode::Write => self.do_write(header, &mut payload)?,
            Opcode::Fsync => self.do_fsync(header, &mut payload)?,
            Opcode::Close => self.do_close(header, &mut payload)?,
            Opcode::Access => self.do_access(header, &mut payload)?,
            Opcode::Read => unreachable!(),
        };
        Ok((result, 0))
    }

    /// An fd is only usable if this backend opened it and has not yet closed
    /// it.
    fn open_fd(&self, raw: u64) -> Result<BorrowedFd<'_>, i32> {
        self.open_fds
            .get(&(raw as RawFd))
            .map(|fd| fd.as_fd())
            .ok_or(-libc::EBADF)
    }

    fn do_mkdir(&self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let path = take_path(payload)?;
        let mode = mask_mode(header.arg1.get() as u32);
        Ok(ok_or_errno(sys::cstring(path).and_then(|cpath| {
            sys::mkdirat(self.basefd.as_fd(), &cpath, mode)
        })))
    }

    fn do_rmdir(&self, payload: &mut Payload<'_>) -> io::Result<i32> {
        let path = take_path(payload)?;
        Ok(ok_or_errno(sys::cstring(path).and_then(|cpath| {
            sys::unlinkat(self.basefd.as_fd(), &cpath, libc::AT_REMOVEDIR)
        })))
    }

    fn do_unlink(&self, payload: &mut Payload<'_>) -> io::Result<i32> {
        let path = take_path(payload)?;
        Ok(ok_or_errno(sys::cstring(path).and_then(|cpath| {
            sys::unlinkat(self.basefd.as_fd(), &cpath, 0)
        })))
    }

    fn do_symlink(&self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let (target, linkpath) = split_paths(header, payload)?;
        // The link itself must live inside the tree; its target is content
        // and may point anywhere.
        validate_path(linkpath)?;
        Ok(ok_or_errno(sys::cstring(target).and_then(|ctarget| {
            let clink = sys::cstring(linkpath)?;
            sys::symlinkat(&ctarget, self.basefd.as_fd(), &clink)
        })))
    }

    fn do_link(&self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let (from, to) = split_paths(header, payload)?;
        validate_path(from)?;
        validate_path(to)?;
        Ok(ok_or_errno(sys::cstring(from).and_then(|cfrom| {
            let cto = sys::cstring(to)?;
            sys::linkat(self.basefd.as_fd(), &cfrom, self.basefd.as_fd(), &cto)
        })))
    }

    fn do_rename(&self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let (from, to) = split_paths(header, payload)?;
        validate_path(from)?;
        validate_path(to)?;
        let flags = header.arg2.get() as libc::c_uint;
        Ok(ok_or_errno(sys::cstring(from).and_then(|cfrom| {
            let cto = sys::cstring(to)?;
            sys::renameat2(self.basefd.as_fd(), &cfrom, self.basefd.as_fd(), &cto, flags)
        })))
    }

    fn do_chmod(&self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let path = take_path(payload)?;
        let mode = mask_mode(header.arg1.get() as u32);
        Ok(ok_or_errno(sys::cstring(path).and_then(|cpath| {
            sys::fchmodat(self.basefd.as_fd(), &cpath, mode)
        })))
    }

    fn do_chown(&self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let path = take_path(payload)?;
        let uid = header.arg1.get() as libc::uid_t;
        let gid = header.arg2.get() as libc::gid_t;
        Ok(ok_or_errno(sys::cstring(path).and_then(|cpath| {
            sys::fchownat(self.basefd.as_fd(), &cpath, uid, gid)
        })))
    }

    fn do_truncate(&self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let path = take_path(payload)?;
        let size = header.arg1.get() as libc::off_t;
        Ok(ok_or_errno(sys::cstring(path).and_then(|cpath| {
            let fd = sys::openat(
                self.basefd.as_fd(),
                &cpath,
                libc::O_WRONLY | libc::O_NOFOLLOW,
                0,
            )?;
            sys::ftruncate(fd.as_fd(), size)
        })))
    }

    fn do_utimens(&self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let path_len = header.arg1.get() as usize;
        let path = payload.take(path_len).ok_or_else(|| {
            protocol_error("utimens payload shorter than its declared path length".into())
        })?;
        validate_path(path)?;
        let atime = *payload
            .fetch::<WireTimespec>()
            .ok_or_else(|| protocol_error("utimens payload missing timestamps".into()))?;
        let mtime = *payload
            .fetch::<WireTimespec>()
            .ok_or_else(|| protocol_error("utimens payload missing timestamps".into()))?;
        expect_empty(payload, "utimens")?;
        let times = [
            libc::timespec {
                tv_sec: atime.sec.get() as libc::time_t,
                tv_nsec: atime.nsec.get() as libc::c_long,
            },
            libc::timespec {
                tv_sec: mtime.sec.get() as libc::time_t,
                tv_nsec: mtime.nsec.get() as libc::c_long,
            },
        ];
        Ok(ok_or_errno(sys::cstring(path).and_then(|cpath| {
            sys::utimensat(self.basefd.as_fd(), &cpath, &times)
        })))
    }

    fn do_open(&mut self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let path = take_path(payload)?;
        let mode = mask_mode(header.arg1.get() as u32);
        let flags = header.arg2.get() as u32 as libc::c_int;
        // O_NOFOLLOW so a symlink in the final component is refused rather
        // than followed. O_TRUNC is withheld from the open and applied by
        // ftruncate afterwards, so the no-follow check has already settled
        // which object is being truncated.
        let open_flags = (flags & !libc::O_TRUNC) | libc::O_NOFOLLOW;
        let cpath = match sys::cstring(path) {
            Ok(cpath) => cpath,
            Err(err) => return Ok(errno_result(err)),
        };
        let fd = match sys::openat(self.basefd.as_fd(), &cpath, open_flags, mode) {
            Ok(fd) => fd,
            Err(err) => return Ok(errno_result(err)),
        };
        if flags & libc::O_TRUNC != 0 {
            if let Err(err) = sys::ftruncate(fd.as_fd(), 0) {
                return Ok(errno_result(err));
            }
        }
        let raw = fd.as_raw_fd();
        self.open_fds.insert(raw, fd);
        Ok(raw)
    }

    fn do_read(
        &mut self,
        header: &RequestHeader,
        payload: &mut Payload<'_>,
        response: &mut [u8],
    ) -> io::Result<(i32, usize)> {
        expect_empty(payload, "read")?;
        let fd = match self.open_fd(header.arg1.get()) {
            Ok(fd) => fd,
            Err(errno) => return Ok((errno, 0)),
        };
        // Oversized reads are clamped, not refused.
        let size = (header.arg2.get() as usize).min(MAX_DATA_SIZE);
        let offset = header.arg3.get() as libc::off_t;
        match sys::pread(fd, &mut response[..size], offset) {
            Ok(count) => Ok((count as i32, count)),
            Err(err) => Ok((errno_result(err), 0)),
        }
    }

    fn do_write(&mut self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let data = payload.rest();
        let offset = header.arg2.get() as libc::off_t;
        let fd = match self.open_fd(header.arg1.get()) {
            Ok(fd) => fd,
            Err(errno) => return Ok(errno),
        };
        match sys::pwrite(fd, data, offset) {
            Ok(count) => Ok(count as i32),
            Err(err) => Ok(errno_result(err)),
        }
    }

    fn do_fsync(&mut self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        expect_empty(payload, "fsync")?;
        let fd = match self.open_fd(header.arg1.get()) {
            Ok(fd) => fd,
            Err(errno) => return Ok(errno),
        };
        Ok(ok_or_errno(sys::fsync(fd)))
    }

    fn do_close(&mut self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        expect_empty(payload, "close")?;
        match self.open_fds.remove(&(header.arg1.get() as RawFd)) {
            Some(fd) => {
                drop(fd);
                Ok(0)
            }
            None => Ok(-libc::EBADF),
        }
    }

    fn do_access(&self, header: &RequestHeader, payload: &mut Payload<'_>) -> io::Result<i32> {
        let path = take_path(payload)?;
        let mode = header.arg1.get() as libc::c_int;
        Ok(ok_or_errno(sys::cstring(path).and_then(|cpath| {
            sys::faccessat(self.basefd.as_fd(), &cpath, mode, 0)
        })))
    }
}
