// SPDX-License-Identifier: MIT OR Apache-2.0
//! Child process spawning with a loopback connect-back socket.
//!
//! The parent binds an ephemeral listener on 127.0.0.1, spawns the child with
//! the listener's address in `TASKMASTER_CONNECT`, and accepts the child's
//! connection without blocking. The optional bootstrap path travels as a
//! `--bootstrap` argument for the child binary to interpret.

use crate::sys;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Environment variable carrying the parent's connect-back address.
pub const CONNECT_ENV: &str = "TASKMASTER_CONNECT";

/// Opt-in switch: when present, auto-detected workers are routed through a
/// shared process proxy instead of being spawned directly.
pub const FORK_PROXY_ENV: &str = "TASKMASTER_FORK_PROXY";

const ACCEPT_POLL: Duration = Duration::from_millis(1);

/// Whether this runtime can spawn socket-connected worker children at all.
pub fn can_fork_child() -> bool {
    cfg!(unix)
}

pub fn fork_proxy_requested() -> bool {
    std::env::var_os(FORK_PROXY_ENV).is_some()
}

/// A spawned child that has not connected back yet.
pub struct PendingChild {
    child: Child,
    listener: TcpListener,
}

impl PendingChild {
    /// Polls the listener for the child's connection. Returns `Ok(None)`
    /// while the child has not connected yet.
    pub fn try_accept(&mut self) -> std::io::Result<Option<TcpStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Drops the listener and hands over the process handle.
    pub fn into_child(self) -> Child {
        self.child
    }
}

/// Spawns `executable` and hands it a connect-back address.
pub fn spawn_connect_back(
    executable: &Path,
    bootstrap: Option<&Path>,
) -> std::io::Result<PendingChild> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let mut command = Command::new(executable);
    command.env(CONNECT_ENV, addr.to_string());
    command.stdin(Stdio::null());
    if let Some(bootstrap) = bootstrap {
        command.arg("--bootstrap").arg(bootstrap);
    }
    let child = command.spawn()?;
    logwise::info_sync!(
        "spawned child {pid} from {executable}",
        pid = child.id().to_string(),
        executable = executable.display().to_string()
    );
    Ok(PendingChild { child, listener })
}

/// Waits for the child's connection, bounded by `timeout`. Used where a
/// blocking wait is acceptable (proxy enrollment, the proxy runtime).
pub fn accept_with_deadline(
    pending: &mut PendingChild,
    timeout: Duration,
) -> std::io::Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(stream) = pending.try_accept()? {
            return Ok(stream);
        }
        if let Ok(Some(status)) = pending.child_mut().try_wait() {
            return Err(std::io::Error::other(format!(
                "child exited before connecting back: {}",
                status
            )));
        }
        if Instant::now() >= deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for the child to connect back",
            ));
        }
        sys::sleep(ACCEPT_POLL);
    }
}

/// Child side: connects to the address the parent put in the environment.
pub fn connect_back() -> std::io::Result<TcpStream> {
    let addr = std::env::var(CONNECT_ENV).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not set; not spawned by a taskmaster parent", CONNECT_ENV),
        )
    })?;
    TcpStream::connect(addr)
}

/// Child side: the `--bootstrap` path, when the parent passed one.
pub fn bootstrap_from_args() -> Option<PathBuf> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == "--bootstrap" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
