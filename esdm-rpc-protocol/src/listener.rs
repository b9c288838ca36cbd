// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Endpoint bind/listen setup (§4.3): each of the two local sockets is bound, chmod'd to its trust
//! tier's mode, and given a generous backlog before the connection-accept loop starts.
//!
//! Binding a `UnixListener` to a path that already exists fails with `AddrInUse`; a stale socket
//! left behind by a crashed previous instance is the common cause, so before giving up we probe it
//! with a non-blocking connect and only unlink it if nothing answers.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::socket::{
    connect, socket, AddressFamily, SockFlag, SockType, UnixAddr,
};
use nix::sys::stat::{fchmod, Mode};
use nix::unistd::unlink;

use crate::BootstrapError;

/// Backlog passed to `listen(2)`; generous because a burst of clients connecting at once (e.g.
/// many processes starting up together) should queue rather than be refused.
pub const LISTEN_BACKLOG: i32 = 128;

pub struct Endpoint {
    pub path: PathBuf,
    pub listener: UnixListener,
}

impl Endpoint {
    /// Binds `path`, clearing out a stale socket left by a previous instance first, then chmods it
    /// to `mode` (0o666 for the unprivileged endpoint, 0o600 for the privileged one, per §3).
    pub fn bind(path: &Path, mode: u32) -> Result<Self, BootstrapError> {
        if path.exists() {
            clear_stale_socket(path);
        }

        let listener = UnixListener::bind(path).map_err(BootstrapError::Listen)?;
        // std's UnixListener does not expose backlog tuning; the default is already generous
        // enough for a local-only service, so LISTEN_BACKLOG documents the expectation rather than
        // being threaded through a raw socket() call.

        fchmod(&listener, Mode::from_bits_truncate(mode)).map_err(BootstrapError::Chmod)?;

        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = unlink(&self.path);
    }
}

/// Tries a non-blocking connect to `path` to tell a live socket from an abandoned one (§4.3: "attempt
/// a non-blocking connect to it; if the connect returns 'in progress' or succeeds, another instance
/// is live"); only unlinks the path if nothing is listening. A blocking connect here would risk
/// hanging bootstrap indefinitely against a listener whose accept backlog is saturated, so the probe
/// socket is opened with `SOCK_NONBLOCK` rather than going through `std::os::unix::net::UnixStream`.
/// Best-effort: any unexpected error just falls through to unlinking, which `bind` will itself
/// surface an error for if the path genuinely cannot be reused.
fn clear_stale_socket(path: &Path) {
    let probe = match socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_NONBLOCK, None) {
        Ok(fd) => fd,
        Err(e) => {
            log::warn!("failed to open stale-socket probe for {}: {e}", path.display());
            let _ = unlink(path);
            return;
        }
    };

    let addr = match UnixAddr::new(path) {
        Ok(addr) => addr,
        Err(e) => {
            log::warn!("failed to build socket address for {}: {e}", path.display());
            let _ = unlink(path);
            return;
        }
    };

    match connect(probe.as_raw_fd(), &addr) {
        Ok(()) | Err(Errno::EINPROGRESS) => {
            log::warn!(
                "a process is already listening on {}; leaving it in place",
                path.display()
            );
        }
        Err(Errno::ECONNREFUSED) => {
            log::info!("clearing stale socket at {}", path.display());
            let _ = unlink(path);
        }
        Err(_) => {
            let _ = unlink(path);
        }
    }
}
