// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The accept loop and thread-pool glue (§4.9, §2 component 9): one thread per endpoint accepts
//! connections and spawns a named worker thread per accepted connection, until told to stop.
//!
//! Service tables and shared state are built once at bootstrap and never mutated again (§5 "Shared
//! resource policy"), so they are handed to every worker thread as `'static` references rather
//! than behind a lock: the caller is expected to `Box::leak` them once, during bootstrap, the same
//! way a long-lived daemon's globally-shared, read-only configuration is usually made `'static`.

use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::connection::Connection;
use crate::service::{ServiceState, ServiceTable};

/// Process-wide shutdown flag (§5 "server_exit"): a single-word atomic, written with release
/// semantics by whoever decides to shut the server down, read with acquire semantics by every
/// accept loop. Setting it stops new connections from being accepted or spawned; connections
/// already being served finish their current request and exit on their next read timeout.
#[derive(Clone)]
pub struct ServerExit(Arc<AtomicBool>);

impl ServerExit {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Requests shutdown. Idempotent.
    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for ServerExit {
    fn default() -> Self {
        Self::new()
    }
}

/// The [`ServerExit`] a running server's shutdown signal handler reports into. Set once, by
/// [`install_shutdown_handlers`]; a bare `extern "C"` signal handler cannot capture anything, so
/// this plays the same process-global role `supervisor::SERVER_PID` plays for the relay handler.
static SHUTDOWN_TARGET: OnceLock<ServerExit> = OnceLock::new();

extern "C" fn handle_shutdown_signal(_raw_signal: i32) {
    if let Some(exit) = SHUTDOWN_TARGET.get() {
        exit.signal();
    }
}

/// Installs handlers for `SIGHUP`/`SIGINT`/`SIGQUIT`/`SIGTERM` in the server (child) process that
/// set `exit` instead of leaving the default disposition to terminate the process outright. Without
/// this, the signal the supervisor relays (§4.7 step 4) would kill the child before any accept loop
/// ever observes `exit.is_set()`; with it, already-accepted connections get to finish their current
/// request and exit on their next read timeout, and each accept loop stops taking new connections
/// the next time it comes up for air (§4.9 "Shutdown").
///
/// # Safety
/// Installs process-wide signal handlers; must only be called once, before any signal in this set
/// can be delivered.
pub unsafe fn install_shutdown_handlers(exit: ServerExit) {
    if SHUTDOWN_TARGET.set(exit).is_err() {
        warn!("install_shutdown_handlers called more than once; ignoring");
        return;
    }

    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
        if let Err(e) = signal::sigaction(sig, &action) {
            error!("failed to install shutdown handler for {sig:?}: {e}");
        }
    }
}

/// Sets the accepted socket's receive timeout (§4.4 step 1: "`select`/equivalent on the fd with a
/// bounded read timeout"), via `SO_RCVTIMEO` rather than a separate `select` call: the blocking
/// read already used by [`Connection`] then times out on its own and surfaces
/// `ErrorKind::WouldBlock`/`TimedOut`, which [`Connection::serve`] already maps to
/// [`crate::Error::Timeout`].
pub fn set_read_timeout(stream: &UnixStream, timeout: Duration) -> std::io::Result<()> {
    stream.set_read_timeout(Some(timeout))
}

/// Runs the accept loop for one endpoint (§4.9). Never blocks on handler work: every accepted
/// connection is handed off to its own freshly spawned, named worker thread, and the loop goes
/// straight back to `accept`.
///
/// `name` becomes the spawned threads' name prefix (e.g. `"esdm-unpriv"` spawns
/// `"esdm-unpriv-conn-1"`, `"esdm-unpriv-conn-2"`, ...) so a hung connection is identifiable in a
/// thread dump.
///
/// Exits once `exit` is observed set. Accept errors that are plausibly transient (interrupted
/// syscall, a client that disconnected between `select` and `accept`) are logged and retried; any
/// other accept error is also retried, since there is no other actor that can restart this loop.
pub fn accept_loop(
    name: &'static str,
    listener: &UnixListener,
    table: &'static ServiceTable<UnixStream>,
    state: &'static ServiceState,
    max_msg: u32,
    read_timeout: Duration,
    exit: ServerExit,
) {
    let next_worker_id = AtomicU64::new(1);

    info!("{name} accept loop starting");

    loop {
        if exit.is_set() {
            info!("{name} accept loop stopping: server_exit set");
            return;
        }

        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = set_read_timeout(&stream, read_timeout) {
                    warn!("{name}: failed to set read timeout on accepted connection: {e}");
                }

                spawn_connection(name, &next_worker_id, stream, table, state, max_msg, &exit);
            }
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                continue;
            }
            Err(e) => {
                warn!("{name}: accept failed, retrying: {e}");
            }
        }
    }
}

fn spawn_connection(
    name: &'static str,
    next_worker_id: &AtomicU64,
    stream: UnixStream,
    table: &'static ServiceTable<UnixStream>,
    state: &'static ServiceState,
    max_msg: u32,
    exit: &ServerExit,
) {
    let worker_id = next_worker_id.fetch_add(1, Ordering::Relaxed);
    let thread_name = format!("{name}-conn-{worker_id}");
    let exit = exit.clone();

    let spawned = thread::Builder::new().name(thread_name.clone()).spawn(move || {
        // `exit` can have been set in the window between `accept` returning and this thread
        // actually getting scheduled; check once more before doing any work on behalf of a
        // shutting-down server.
        if exit.is_set() {
            return;
        }

        let mut conn = Connection::new(stream, table, state, max_msg);
        conn.serve();
    });

    if let Err(e) = spawned {
        error!("{name}: failed to spawn handler thread {thread_name}: {e}");
    }
}
