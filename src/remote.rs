//! Frontend connection to the writer backend.
//!
//! One request/response exchange at a time: the socket mutex is held across
//! the `writev` of the request and the `readv` of the matching response, so
//! frames from concurrent filesystem callbacks can never interleave and no
//! request id is needed on the wire.
//!
//! Errors split two ways. An errno reported by the backend comes back as
//! `Err(errno)` and flows to the kernel unchanged. Any socket-level failure
//! (the controller revoked write access, the backend died, a short frame)
//! surfaces as `EIO`.

use std::io;
use std::os::fd::AsFd;
use std::os::fd::OwnedFd;

use libc::c_int;
use log::warn;
use parking_lot::Mutex;
use zerocopy::IntoBytes;

use crate::wire;
use crate::wire::MAX_DATA_SIZE;
use crate::wire::Opcode;
use crate::wire::RequestHeader;
use crate::wire::WireTimespec;

/// Operation outcome: `Err` carries a positive errno for the kernel.
pub type OpResult<T> = Result<T, c_int>;

pub struct RemoteConn {
    socket: Mutex<OwnedFd>,
}

impl RemoteConn {
    pub fn new(socket: OwnedFd) -> RemoteConn {
        RemoteConn {
            socket: Mutex::new(socket),
        }
    }

    /// One atomic exchange on the wire.
    fn exchange(
        &self,
        header: &RequestHeader,
        primary: &[u8],
        secondary: &[u8],
        recv_buf: &mut [u8],
    ) -> io::Result<(i32, usize)> {
        let socket = self.socket.lock();
        wire::send_request(socket.as_fd(), header, primary, secondary)?;
        wire::recv_reply(socket.as_fd(), recv_buf)
    }

    /// Sends a request with no interesting response payload.
    fn call(
        &self,
        op: Opcode,
        args: (u64, u64, u64),
        primary: &[u8],
        secondary: &[u8],
    ) -> OpResult<i32> {
        if primary.len() + secondary.len() > MAX_DATA_SIZE {
            return Err(libc::ENAMETOOLONG);
        }
        let header = RequestHeader::new(op, args.0, args.1, args.2);
        match self.exchange(&header, primary, secondary, &mut []) {
            Ok((result, _)) if result < 0 => Err(-result),
            Ok((result, _)) => Ok(result),
            Err(err) => {
                warn!("{op:?} request failed on the control socket: {err}");
                Err(libc::EIO)
            }
        }
    }

    pub fn mkdir(&self, path: &[u8], mode: u32) -> OpResult<()> {
        self.call(Opcode::Mkdir, (u64::from(mode), 0, 0), path, &[])?;
        Ok(())
    }

    pub fn rmdir(&self, path: &[u8]) -> OpResult<()> {
        self.call(Opcode::Rmdir, (0, 0, 0), path, &[])?;
        Ok(())
    }

    pub fn unlink(&self, path: &[u8]) -> OpResult<()> {
        self.call(Opcode::Unlink, (0, 0, 0), path, &[])?;
        Ok(())
    }

    /// `target` is the link's content and may point anywhere; only
    /// `linkpath` names an object inside the base tree.
    pub fn symlink(&self, target: &[u8], linkpath: &[u8]) -> OpResult<()> {
        self.call(
            Opcode::Symlink,
            (target.len() as u64, 0, 0),
            target,
            linkpath,
        )?;
        Ok(())
    }

    pub fn link(&self, from: &[u8], to: &[u8]) -> OpResult<()> {
        self.call(Opcode::Link, (from.len() as u64, 0, 0), from, to)?;
        Ok(())
    }

    pub fn rename(&self, from: &[u8], to: &[u8], flags: u32) -> OpResult<()> {
        self.call(
            Opcode::Rename,
            (from.len() as u64, u64::from(flags), 0),
            from,
            to,
        )?;
        Ok(())
    }

    pub fn chmod(&self, path: &[u8], mode: u32) -> OpResult<()> {
        self.call(Opcode::Chmod, (u64::from(mode), 0, 0), path, &[])?;
        Ok(())
    }

    /// `u32::MAX` for either id leaves it unchanged, as with `chown(2)`.
    pub fn chown(&self, path: &[u8], uid: u32, gid: u32) -> OpResult<()> {
        self.call(
            Opcode::Chown,
            (u64::from(uid), u64::from(gid), 0),
            path,
            &[],
        )?;
        Ok(())
    }

    pub fn truncate(&self, path: &[u8], size: u64) -> OpResult<()> {
        self.call(Opcode::Truncate, (size, 0, 0), path, &[])?;
        Ok(())
    }

    pub fn utimens(
        &self,
        path: &[u8],
        atime: WireTimespec,
        mtime: WireTimespec,
    ) -> OpResult<()> {
        let times = [atime, mtime];
        self.call(
            Opcode::Utimens,
            (path.len() as u64, 0, 0),
            path,
            times.as_bytes(),
        )?;
        Ok(())
    }

    /// Opens (and possibly creates) a file for writing in the backend.
    /// Returns the backend fd number.
    pub fn open(&self, path: &[u8], flags: i32, mode: u32) -> OpResult<i32> {
        self.call(
            Opcode::Open,
            (u64::from(mode), u64::from(flags as u32), 0),
            path,
            &[],
        )
    }

    pub fn access(&self, path: &[u8], mode: i32) -> OpResult<()> {
        self.call(Opcode::Access, (u64::from(mode as u32), 0, 0), path, &[])?;
        Ok(())
    }

    pub fn fsync(&self, fd: i32) -> OpResult<()> {
        self.call(Opcode::Fsync, (fd as u64, 0, 0), &[], &[])?;
        Ok(())
    }

    pub fn close(&self, fd: i32) -> OpResult<()> {
        self.call(Opcode::Close, (fd as u64, 0, 0), &[], &[])?;
        Ok(())
    }

    /// One capped read. Short counts mean end of file.
    fn read_at(&self, fd: i32, offset: i64, buf: &mut [u8]) -> OpResult<usize> {
        let size = buf.len().min(MAX_DATA_SIZE);
        let header = RequestHeader::new(Opcode::Read, fd as u64, size as u64, offset as u64);
        match self.exchange(&header, &[], &[], &mut buf[..size]) {
            Ok((result, _)) if result < 0 => Err(-result),
            Ok((result, payload_len)) => {
                if result as usize != payload_len {
                    warn!("read response payload does not match its result count");
                    return Err(libc::EIO);
                }
                Ok(result as usize)
            }
            Err(err) => {
                warn!("read request failed on the control socket: {err}");
                Err(libc::EIO)
            }
        }
    }

    /// One capped write.
    fn write_at(&self, fd: i32, offset: i64, data: &[u8]) -> OpResult<usize> {
        debug_assert!(data.len() <= MAX_DATA_SIZE);
        let result = self.call(Opcode::Write, (fd as u64, offset as u64, 0), data, &[])?;
        Ok(result as usize)
    }

    /// Reads up to `size` bytes at `offset`, splitting into capped wire
    /// operations. Stops early at end of file. As with writes, an error on
    /// the first chunk is reported as such and a later failure returns the
    /// short read collected so far.
    pub fn read_chunked(&self, fd: i32, offset: i64, size: usize) -> OpResult<Vec<u8>> {
        let mut data = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let want = (size - filled).min(MAX_DATA_SIZE);
            match self.read_at(fd, offset + filled as i64, &mut data[filled..filled + want]) {
                Ok(got) => {
                    filled += got;
                    if got < want {
                        break;
                    }
                }
                Err(errno) if filled == 0 => return Err(errno),
                Err(_) => break,
            }
        }
        data.truncate(filled);
        Ok(data)
    }

    /// Writes all of `data` at `offset` in capped wire operations. Returns
    /// the byte count actually written; an error on the first chunk is
    /// reported as such, a later failure truncates the count.
    pub fn write_chunked(&self, fd: i32, offset: i64, data: &[u8]) -> OpResult<usize> {
        let mut written = 0;
        while written < data.len() {
            let chunk = &data[written..(written + MAX_DATA_SIZE).min(data.len())];
            match self.write_at(fd, offset + written as i64, chunk) {
                Ok(n) => {
                    written += n;
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(errno) if written == 0 => return Err(errno),
                Err(_) => break,
            }
        }
        Ok(written)
    }
}
