//! Revocable split-privilege passthrough filesystem.
//!
//! A directory tree is exposed at a mount point with the trust split across
//! two processes. The frontend serves reads and metadata in-process against
//! an open fd on the base tree; every mutation is forwarded over a seqpacket
//! socket to a writer backend that validates paths, masks dangerous mode
//! bits, and performs the syscall. The controlling parent can revoke write
//! access at any time by shutting down the socket: reads keep working,
//! mutations start failing, and the backend exits.
//!
//! The crate is a library so both sides and the wire protocol can be
//! exercised in-process; the `revokefs` binary wires them together.

#![warn(rust_2018_idioms)]

pub mod inode;
pub mod reader;
pub mod remote;
pub mod sys;
pub mod wire;
pub mod writer;

pub use crate::reader::RevokeFs;
pub use crate::remote::RemoteConn;
pub use crate::wire::MAX_DATA_SIZE;
pub use crate::wire::REMOTE_FD_OFFSET;
pub use crate::writer::Writer;
