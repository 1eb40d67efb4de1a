//! Combined binary: filesystem frontend by default, writer backend with
//! `--backend`. When no control socket is handed in, the frontend creates a
//! seqpacket socketpair and forks the backend itself.

use std::io;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::path::Path;
use std::path::PathBuf;

use clap::Arg;
use clap::ArgAction;
use clap::ArgMatches;
use clap::Command;
use clap::crate_version;
use fuser::MountOption;
use log::debug;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::sys::socket::socketpair;
use nix::unistd::ForkResult;
use nix::unistd::fork;

use revokefs::RemoteConn;
use revokefs::RevokeFs;
use revokefs::Writer;
use revokefs::sys;

fn cli() -> Command {
    Command::new("revokefs")
        .version(crate_version!())
        .about("Mount a directory tree whose write access can be revoked")
        .arg(
            Arg::new("basepath")
                .required(true)
                .index(1)
                .help("Directory tree to expose"),
        )
        .arg(
            Arg::new("mountpoint")
                .index(2)
                .help("Where to mount the filesystem (unused with --backend)"),
        )
        .arg(
            Arg::new("socket")
                .long("socket")
                .value_name("FD")
                .value_parser(clap::value_parser!(i32))
                .help("Already-open control socket fd (a socketpair is created otherwise)"),
        )
        .arg(
            Arg::new("exit-with-fd")
                .long("exit-with-fd")
                .value_name("FD")
                .value_parser(clap::value_parser!(i32))
                .help("Backend: terminate as soon as this fd reports hangup"),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .action(ArgAction::SetTrue)
                .help("Run the writer backend against --socket instead of mounting"),
        )
        .arg(
            Arg::new("options")
                .short('o')
                .value_name("OPTIONS")
                .action(ArgAction::Append)
                .help("Comma-separated mount options passed to the FUSE layer"),
        )
}

fn parse_option(opt: &str) -> MountOption {
    match opt {
        "auto_unmount" => MountOption::AutoUnmount,
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "default_permissions" => MountOption::DefaultPermissions,
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "dirsync" => MountOption::DirSync,
        _ => match opt.split_once('=') {
            Some(("fsname", name)) => MountOption::FSName(name.to_string()),
            Some(("subtype", name)) => MountOption::Subtype(name.to_string()),
            _ => MountOption::CUSTOM(opt.to_string()),
        },
    }
}

fn mount_options(matches: &ArgMatches) -> Vec<MountOption> {
    let mut options = vec![MountOption::FSName("revokefs".to_string())];
    if let Some(values) = matches.get_many::<String>("options") {
        for value in values {
            for opt in value.split(',').filter(|opt| !opt.is_empty()) {
                options.push(parse_option(opt));
            }
        }
    }
    options
}

/// Creates the control socketpair and forks the backend. The child never
/// returns; the parent gets the frontend end.
fn spawn_backend(basepath: &Path, exit_with_fd: Option<RawFd>) -> io::Result<OwnedFd> {
    let (frontend, backend) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            debug!("forked writer backend as pid {child}");
            drop(backend);
            Ok(frontend)
        }
        ForkResult::Child => {
            drop(frontend);
            // SAFETY: the fd number was handed to us by the controller.
            let exit_with = exit_with_fd.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
            let served = sys::open_base(basepath)
                .and_then(|basefd| Writer::new(basefd, backend, exit_with).run());
            let status = match served {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("revokefs backend: {err}");
                    1
                }
            };
            std::process::exit(status);
        }
    }
}

fn run(matches: &ArgMatches) -> io::Result<()> {
    let basepath = PathBuf::from(matches.get_one::<String>("basepath").unwrap());
    let socket_fd = matches.get_one::<i32>("socket").copied();
    let exit_with_fd = matches.get_one::<i32>("exit-with-fd").copied();

    if matches.get_flag("backend") {
        let socket_fd = socket_fd.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "--backend requires --socket")
        })?;
        let basefd = sys::open_base(&basepath)?;
        // SAFETY: the fd numbers were handed to us by the controller.
        let socket = unsafe { OwnedFd::from_raw_fd(socket_fd) };
        let exit_with = exit_with_fd.map(|fd| unsafe { OwnedFd::from_raw_fd(fd) });
        return Writer::new(basefd, socket, exit_with).run();
    }

    let mountpoint = matches.get_one::<String>("mountpoint").ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "missing mountpoint argument")
    })?;
    let basefd = sys::open_base(&basepath)?;
    let socket = match socket_fd {
        // SAFETY: the fd number was handed to us by the controller.
        Some(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
        None => spawn_backend(&basepath, exit_with_fd)?,
    };
    let fs = RevokeFs::new(basefd, RemoteConn::new(socket));
    fuser::mount2(fs, mountpoint, &mount_options(matches))
}

fn main() {
    env_logger::init();
    let matches = cli().get_matches();
    if let Err(err) = run(&matches) {
        eprintln!("revokefs: {err}");
        std::process::exit(1);
    }
}
