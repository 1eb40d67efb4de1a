//! Request/response framing for the revokefs control socket.
//!
//! Every exchange between the filesystem frontend and the writer backend is a
//! pair of datagrams on a `SOCK_SEQPACKET` socket: one request frame, one
//! response frame. A frame is a fixed little-endian header followed by an
//! inline payload of at most [`MAX_DATA_SIZE`] bytes. The seqpacket message
//! boundary is load-bearing: a single `writev` emits exactly one frame and a
//! single `recvmsg` consumes exactly one.

use std::io;
use std::io::IoSlice;
use std::io::IoSliceMut;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use smallvec::SmallVec;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::I32;
use zerocopy::byteorder::I64;
use zerocopy::byteorder::LittleEndian;
use zerocopy::byteorder::U32;
use zerocopy::byteorder::U64;
use zerocopy::error::ConvertError;

use crate::sys;

/// Upper bound on the inline payload of a single frame, in either direction.
/// Bulk reads and writes are split into operations of at most this size.
pub const MAX_DATA_SIZE: usize = 16 * 1024;

/// File handles at or above this value refer to descriptors owned by the
/// writer backend; handles below it are read-only descriptors local to the
/// frontend. Subtracting the offset from a remote handle yields the backend
/// fd number.
pub const REMOTE_FD_OFFSET: u64 = u32::MAX as u64;

/// Size of a serialized [`RequestHeader`].
pub const REQUEST_HEADER_SIZE: usize = size_of::<RequestHeader>();

/// Size of a serialized [`ReplyHeader`].
pub const REPLY_HEADER_SIZE: usize = size_of::<ReplyHeader>();

/// Largest well-formed request frame.
pub const MAX_REQUEST_SIZE: usize = REQUEST_HEADER_SIZE + MAX_DATA_SIZE;

/// Largest well-formed response frame.
pub const MAX_REPLY_SIZE: usize = REPLY_HEADER_SIZE + MAX_DATA_SIZE;

/// Operations the writer backend performs on behalf of the frontend.
///
/// The discriminants are the on-wire opcode values; they are dense so the
/// backend can reject any unknown tag synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Opcode {
    Mkdir = 0,
    Rmdir = 1,
    Unlink = 2,
    Symlink = 3,
    Link = 4,
    Rename = 5,
    Chmod = 6,
    Chown = 7,
    Truncate = 8,
    Utimens = 9,
    Open = 10,
    Read = 11,
    Write = 12,
    Fsync = 13,
    Close = 14,
    Access = 15,
}

/// Fixed request header: opcode plus three scalar arguments. Path and data
/// arguments travel in the payload; for two-path operations `arg1` holds the
/// byte length of the first path and the second occupies the remainder.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RequestHeader {
    pub op: U32<LittleEndian>,
    pub arg1: U64<LittleEndian>,
    pub arg2: U64<LittleEndian>,
    pub arg3: U64<LittleEndian>,
}

impl RequestHeader {
    pub fn new(op: Opcode, arg1: u64, arg2: u64, arg3: u64) -> Self {
        RequestHeader {
            op: U32::new(op.into()),
            arg1: U64::new(arg1),
            arg2: U64::new(arg2),
            arg3: U64::new(arg3),
        }
    }
}

/// Fixed response header. Non-negative results are operation specific (bytes
/// transferred, new fd); negative results are negated errno values. Only
/// `READ` responses carry a payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ReplyHeader {
    pub result: I32<LittleEndian>,
}

impl ReplyHeader {
    pub fn new(result: i32) -> Self {
        ReplyHeader {
            result: I32::new(result),
        }
    }
}

/// On-wire timestamp, one `utimensat(2)` timespec. The nanosecond field may
/// carry `UTIME_NOW` or `UTIME_OMIT`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct WireTimespec {
    pub sec: I64<LittleEndian>,
    pub nsec: I64<LittleEndian>,
}

impl WireTimespec {
    pub fn new(sec: i64, nsec: i64) -> Self {
        WireTimespec {
            sec: I64::new(sec),
            nsec: I64::new(nsec),
        }
    }

    pub fn omit() -> Self {
        Self::new(0, libc::UTIME_OMIT as i64)
    }

    pub fn now() -> Self {
        Self::new(0, libc::UTIME_NOW as i64)
    }
}

/// Decomposes a request payload into typed pieces, front to back. Returns
/// `None` when the remaining bytes cannot satisfy the requested piece, which
/// the backend treats as a fatal encoding violation.
pub struct Payload<'a> {
    data: &'a [u8],
}

impl<'a> Payload<'a> {
    pub fn new(data: &'a [u8]) -> Payload<'a> {
        Payload { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take the next `count` raw bytes.
    pub fn take(&mut self, count: usize) -> Option<&'a [u8]> {
        if count > self.data.len() {
            return None;
        }
        let (head, rest) = self.data.split_at(count);
        self.data = rest;
        Some(head)
    }

    /// Take all remaining bytes.
    pub fn rest(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }

    /// Take the next typed value.
    pub fn fetch<T: FromBytes + KnownLayout + Immutable + Unaligned>(&mut self) -> Option<&'a T> {
        match zerocopy::Ref::<_, T>::from_prefix(self.data) {
            // Wire structs are unaligned; an alignment failure cannot happen.
            Err(ConvertError::Alignment(_)) => unreachable!("wire structs are unaligned"),
            Err(ConvertError::Size(_)) => None,
            Err(ConvertError::Validity(infallible)) => match infallible {},
            Ok((head, rest)) => {
                self.data = rest;
                Some(zerocopy::Ref::into_ref(head))
            }
        }
    }
}

/// Emit one request frame in a single `writev`.
pub fn send_request(
    fd: std::os::fd::BorrowedFd<'_>,
    header: &RequestHeader,
    primary: &[u8],
    secondary: &[u8],
) -> io::Result<()> {
    debug_assert!(primary.len() + secondary.len() <= MAX_DATA_SIZE);
    let mut iov: SmallVec<[IoSlice<'_>; 3]> = SmallVec::new();
    iov.push(IoSlice::new(header.as_bytes()));
    if !primary.is_empty() {
        iov.push(IoSlice::new(primary));
    }
    if !secondary.is_empty() {
        iov.push(IoSlice::new(secondary));
    }
    let expected = REQUEST_HEADER_SIZE + primary.len() + secondary.len();
    let sent = sys::send_frame(fd, &iov)?;
    if sent != expected {
        return Err(io::Error::other(format!(
            "short request frame: sent {sent} of {expected} bytes"
        )));
    }
    Ok(())
}

/// Emit one response frame in a single `writev`.
pub fn send_reply(
    fd: std::os::fd::BorrowedFd<'_>,
    header: &ReplyHeader,
    data: &[u8],
) -> io::Result<()> {
    debug_assert!(data.len() <= MAX_DATA_SIZE);
    let mut iov: SmallVec<[IoSlice<'_>; 2]> = SmallVec::new();
    iov.push(IoSlice::new(header.as_bytes()));
    if !data.is_empty() {
        iov.push(IoSlice::new(data));
    }
    let expected = REPLY_HEADER_SIZE + data.len();
    let sent = sys::send_frame(fd, &iov)?;
    if sent != expected {
        return Err(io::Error::other(format!(
            "short response frame: sent {sent} of {expected} bytes"
        )));
    }
    Ok(())
}

/// Receive one request frame into the backend's preallocated buffer.
/// Returns `Ok(0)` on orderly end of stream.
pub fn recv_request(fd: std::os::fd::BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    debug_assert!(buf.len() >= MAX_REQUEST_SIZE);
    let mut iov = [IoSliceMut::new(buf)];
    let (received, truncated) = sys::recv_frame(fd, &mut iov)?;
    if truncated {
        return Err(io::Error::other("request frame exceeds maximum size"));
    }
    Ok(received)
}

/// Receive one response frame: the header plus any payload into `data`.
/// Returns the result code and the payload length.
pub fn recv_reply(fd: std::os::fd::BorrowedFd<'_>, data: &mut [u8]) -> io::Result<(i32, usize)> {
    let mut header = ReplyHeader::new(0);
    let (received, _truncated) = {
        let mut iov = [IoSliceMut::new(header.as_mut_bytes()), IoSliceMut::new(data)];
        sys::recv_frame(fd, &mut iov)?
    };
    if received < REPLY_HEADER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "control socket closed",
        ));
    }
    Ok((header.result.get(), received - REPLY_HEADER_SIZE))
}
