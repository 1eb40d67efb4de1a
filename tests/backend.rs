//! End-to-end tests for the writer backend, driven over a real seqpacket
//! socketpair against a scratch directory. No kernel mount is needed: the
//! frontend connection type speaks to a backend running on a thread exactly
//! as it would to the forked process.

use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread;
use std::thread::JoinHandle;

use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::sys::socket::socketpair;
use std::os::fd::OwnedFd;
use tempfile::TempDir;

use revokefs::MAX_DATA_SIZE;
use revokefs::RemoteConn;
use revokefs::Writer;
use revokefs::sys;
use revokefs::wire;
use revokefs::wire::Opcode;
use revokefs::wire::RequestHeader;
use revokefs::wire::WireTimespec;

struct Backend {
    conn: RemoteConn,
    handle: JoinHandle<io::Result<()>>,
}

fn spawn_backend(base: &Path) -> Backend {
    let (frontend, backend) = seqpacket_pair();
    Backend {
        conn: RemoteConn::new(frontend),
        handle: spawn_writer(base, backend, None),
    }
}

fn seqpacket_pair() -> (OwnedFd, OwnedFd) {
    socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .unwrap()
}

fn spawn_writer(
    base: &Path,
    socket: OwnedFd,
    exit_with: Option<OwnedFd>,
) -> JoinHandle<io::Result<()>> {
    let basefd = sys::open_base(base).unwrap();
    thread::spawn(move || Writer::new(basefd, socket, exit_with).run())
}

#[test]
fn create_write_read_close_roundtrip() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    let fd = backend
        .conn
        .open(b"x", libc::O_RDWR | libc::O_CREAT, 0o644)
        .unwrap();
    assert!(fd >= 0);
    assert_eq!(backend.conn.write_chunked(fd, 0, b"hello").unwrap(), 5);
    assert_eq!(backend.conn.read_chunked(fd, 0, 5).unwrap(), b"hello");
    backend.conn.close(fd).unwrap();
    assert_eq!(backend.conn.close(fd), Err(libc::EBADF));

    assert_eq!(std::fs::read(dir.path().join("x")).unwrap(), b"hello");

    drop(backend.conn);
    backend.handle.join().unwrap().unwrap();
}

#[test]
fn bulk_io_splits_into_capped_operations() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    let data: Vec<u8> = (0..3 * MAX_DATA_SIZE + 123)
        .map(|i| (i % 251) as u8)
        .collect();
    let fd = backend
        .conn
        .open(b"bulk", libc::O_RDWR | libc::O_CREAT, 0o600)
        .unwrap();
    assert_eq!(
        backend.conn.write_chunked(fd, 0, &data).unwrap(),
        data.len()
    );
    assert_eq!(backend.conn.read_chunked(fd, 0, data.len()).unwrap(), data);
    // Reading past the end stops at it.
    assert_eq!(
        backend.conn.read_chunked(fd, 0, data.len() + 999).unwrap(),
        data
    );
    backend.conn.close(fd).unwrap();
    assert_eq!(std::fs::read(dir.path().join("bulk")).unwrap(), data);
}

#[test]
fn mkdir_strips_dangerous_mode_bits() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    backend.conn.mkdir(b"d", 0o4777).unwrap();
    let mode = std::fs::metadata(dir.path().join("d"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & (libc::S_ISUID | libc::S_ISGID) as u32, 0);
    assert_eq!(mode & 0o022, 0);
    assert_ne!(mode & 0o700, 0);
}

#[test]
fn chmod_applies_masked_mode() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    let backend = spawn_backend(dir.path());

    backend.conn.chmod(b"f", 0o6777).unwrap();
    let mode = std::fs::metadata(dir.path().join("f"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o755);
}

#[test]
fn traversal_component_kills_backend() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    assert_eq!(backend.conn.mkdir(b"../escape", 0o755), Err(libc::EIO));
    drop(backend.conn);
    assert!(backend.handle.join().unwrap().is_err());
    assert!(!dir.path().parent().unwrap().join("escape").exists());
}

#[test]
fn absolute_path_kills_backend() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    assert_eq!(backend.conn.unlink(b"/etc/hostname"), Err(libc::EIO));
    drop(backend.conn);
    assert!(backend.handle.join().unwrap().is_err());
}

#[test]
fn empty_path_kills_backend() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    assert_eq!(backend.conn.rmdir(b""), Err(libc::EIO));
    drop(backend.conn);
    assert!(backend.handle.join().unwrap().is_err());
}

#[test]
fn symlink_destination_is_validated_but_target_is_not() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    backend.conn.symlink(b"/nowhere/in/particular", b"lnk").unwrap();
    assert_eq!(
        std::fs::read_link(dir.path().join("lnk")).unwrap(),
        Path::new("/nowhere/in/particular")
    );

    assert_eq!(
        backend.conn.symlink(b"target", b"../outside"),
        Err(libc::EIO)
    );
    drop(backend.conn);
    assert!(backend.handle.join().unwrap().is_err());
}

#[test]
fn unknown_opcode_kills_backend() {
    let dir = TempDir::new().unwrap();
    let (frontend, socket) = seqpacket_pair();
    let handle = spawn_writer(dir.path(), socket, None);

    let mut frame = [0u8; 28];
    frame[0] = 99;
    nix::unistd::write(&frontend, &frame).unwrap();
    drop(frontend);
    assert!(handle.join().unwrap().is_err());
}

#[test]
fn short_frame_kills_backend() {
    let dir = TempDir::new().unwrap();
    let (frontend, socket) = seqpacket_pair();
    let handle = spawn_writer(dir.path(), socket, None);

    nix::unistd::write(&frontend, &[1u8, 2, 3]).unwrap();
    drop(frontend);
    assert!(handle.join().unwrap().is_err());
}

#[test]
fn stray_payload_on_fsync_kills_backend() {
    let dir = TempDir::new().unwrap();
    let (frontend, socket) = seqpacket_pair();
    let handle = spawn_writer(dir.path(), socket, None);

    let header = RequestHeader::new(Opcode::Fsync, 3, 0, 0);
    wire::send_request(frontend.as_fd(), &header, b"stray", b"").unwrap();
    drop(frontend);
    assert!(handle.join().unwrap().is_err());
}

#[test]
fn unopened_fds_are_rejected() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    assert_eq!(backend.conn.fsync(12345), Err(libc::EBADF));
    assert_eq!(backend.conn.write_chunked(12345, 0, b"x"), Err(libc::EBADF));
    // The backend is still serving after an fd-level error.
    backend.conn.mkdir(b"still-alive", 0o755).unwrap();
}

#[test]
fn closed_fd_leaves_the_open_set() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    let fd = backend
        .conn
        .open(b"f", libc::O_WRONLY | libc::O_CREAT, 0o644)
        .unwrap();
    backend.conn.close(fd).unwrap();
    assert_eq!(backend.conn.write_chunked(fd, 0, b"x"), Err(libc::EBADF));
}

#[test]
fn oversized_reads_are_clamped() {
    let dir = TempDir::new().unwrap();
    let big: Vec<u8> = (0..40_000).map(|i| (i % 199) as u8).collect();
    std::fs::write(dir.path().join("big"), &big).unwrap();
    let (frontend, socket) = seqpacket_pair();
    let handle = spawn_writer(dir.path(), socket, None);

    let open = RequestHeader::new(Opcode::Open, 0, libc::O_RDWR as u32 as u64, 0);
    wire::send_request(frontend.as_fd(), &open, b"big", b"").unwrap();
    let (fd, _) = wire::recv_reply(frontend.as_fd(), &mut []).unwrap();
    assert!(fd >= 0);

    let read = RequestHeader::new(Opcode::Read, fd as u64, 64 * 1024, 0);
    wire::send_request(frontend.as_fd(), &read, b"", b"").unwrap();
    let mut data = vec![0u8; MAX_DATA_SIZE];
    let (result, len) = wire::recv_reply(frontend.as_fd(), &mut data).unwrap();
    assert_eq!(result as usize, MAX_DATA_SIZE);
    assert_eq!(len, MAX_DATA_SIZE);
    assert_eq!(&data[..], &big[..MAX_DATA_SIZE]);

    drop(frontend);
    handle.join().unwrap().unwrap();
}

#[test]
fn open_refuses_a_symlink_in_the_final_component() {
    let dir = TempDir::new().unwrap();
    std::os::unix::fs::symlink("victim", dir.path().join("lnk")).unwrap();
    let backend = spawn_backend(dir.path());

    assert_eq!(
        backend.conn.open(b"lnk", libc::O_WRONLY | libc::O_CREAT, 0o644),
        Err(libc::ELOOP)
    );
    assert!(!dir.path().join("victim").exists());
}

#[test]
fn open_with_trunc_truncates_after_the_nofollow_check() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("f"), b"0123456789").unwrap();
    let backend = spawn_backend(dir.path());

    let fd = backend
        .conn
        .open(b"f", libc::O_WRONLY | libc::O_TRUNC, 0)
        .unwrap();
    assert_eq!(std::fs::metadata(dir.path().join("f")).unwrap().len(), 0);
    backend.conn.close(fd).unwrap();
}

#[test]
fn rename_moves_and_replaces() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a"), b"payload").unwrap();
    let backend = spawn_backend(dir.path());

    backend.conn.rename(b"a", b"b", 0).unwrap();
    assert!(!dir.path().join("a").exists());
    assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), b"payload");

    // RENAME_NOREPLACE surfaces as an ordinary errno.
    std::fs::write(dir.path().join("c"), b"other").unwrap();
    assert_eq!(
        backend.conn.rename(b"b", b"c", libc::RENAME_NOREPLACE),
        Err(libc::EEXIST)
    );
}

#[test]
fn link_unlink_and_rmdir() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("orig"), b"x").unwrap();
    let backend = spawn_backend(dir.path());

    backend.conn.link(b"orig", b"copy").unwrap();
    assert_eq!(
        std::fs::metadata(dir.path().join("orig")).unwrap().nlink(),
        2
    );
    backend.conn.unlink(b"copy").unwrap();
    assert!(!dir.path().join("copy").exists());

    backend.conn.mkdir(b"d", 0o755).unwrap();
    backend.conn.rmdir(b"d").unwrap();
    assert!(!dir.path().join("d").exists());
    assert_eq!(backend.conn.rmdir(b"d"), Err(libc::ENOENT));
}

#[test]
fn utimens_sets_explicit_times_and_omits_the_rest() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    let backend = spawn_backend(dir.path());

    backend
        .conn
        .utimens(b"f", WireTimespec::omit(), WireTimespec::new(12345, 0))
        .unwrap();
    let meta = std::fs::metadata(dir.path().join("f")).unwrap();
    assert_eq!(meta.mtime(), 12345);
}

#[test]
fn truncate_shrinks_by_path() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("f"), b"0123456789").unwrap();
    let backend = spawn_backend(dir.path());

    backend.conn.truncate(b"f", 4).unwrap();
    assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"0123");
}

#[test]
fn access_reports_like_faccessat() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    let backend = spawn_backend(dir.path());

    backend.conn.access(b"f", libc::R_OK).unwrap();
    assert_eq!(backend.conn.access(b"missing", libc::R_OK), Err(libc::ENOENT));
}

#[test]
fn chown_with_placeholder_ids_changes_nothing() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("f"), b"").unwrap();
    let backend = spawn_backend(dir.path());

    backend.conn.chown(b"f", u32::MAX, u32::MAX).unwrap();
    let meta = std::fs::metadata(dir.path().join("f")).unwrap();
    assert_eq!(meta.uid(), unsafe { libc::getuid() });
}

#[test]
fn revocation_fails_mutations_and_backend_exits_cleanly() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("kept"), b"still here").unwrap();
    let (frontend, socket) = seqpacket_pair();
    let handle = spawn_writer(dir.path(), socket, None);
    let raw = frontend.as_raw_fd();
    let conn = RemoteConn::new(frontend);

    conn.mkdir(b"before", 0o755).unwrap();

    // The controller's revocation: half-close the socket out from under the
    // connection.
    unsafe { libc::shutdown(raw, libc::SHUT_RDWR) };

    assert_eq!(conn.unlink(b"kept"), Err(libc::EIO));
    assert_eq!(conn.mkdir(b"after", 0o755), Err(libc::EIO));
    // Reads against the base tree are untouched by revocation.
    assert_eq!(std::fs::read(dir.path().join("kept")).unwrap(), b"still here");
    assert!(dir.path().join("before").exists());
    assert!(!dir.path().join("after").exists());

    // The backend saw end-of-stream, which is an orderly shutdown.
    handle.join().unwrap().unwrap();
}

#[test]
fn exit_with_fd_hangup_terminates_backend() {
    let dir = TempDir::new().unwrap();
    let (read_end, write_end) = nix::unistd::pipe().unwrap();
    let (frontend, socket) = seqpacket_pair();
    let handle = spawn_writer(dir.path(), socket, Some(read_end));

    let conn = RemoteConn::new(frontend);
    conn.mkdir(b"alive", 0o755).unwrap();

    drop(write_end);
    assert!(handle.join().unwrap().is_err());
    assert_eq!(conn.mkdir(b"dead", 0o755), Err(libc::EIO));
}

#[test]
fn backend_closes_its_fds_on_exit() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    let fd = backend
        .conn
        .open(b"f", libc::O_WRONLY | libc::O_CREAT, 0o644)
        .unwrap();
    assert_eq!(backend.conn.write_chunked(fd, 0, b"data").unwrap(), 4);
    // Never closed: process (here, Writer) teardown must release it.
    drop(backend.conn);
    backend.handle.join().unwrap().unwrap();
    assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"data");
}

#[test]
fn chmod_survives_a_prior_operation_error() {
    let dir = TempDir::new().unwrap();
    let backend = spawn_backend(dir.path());

    assert_eq!(backend.conn.chmod(b"missing", 0o600), Err(libc::ENOENT));
    std::fs::write(dir.path().join("f"), b"").unwrap();
    backend.conn.chmod(b"f", 0o600).unwrap();
    let mode = std::fs::metadata(dir.path().join("f"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o600);
}
