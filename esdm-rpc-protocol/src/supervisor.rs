// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The privileged supervisor process (§4.7): forks the server child, stays root, relays shutdown
//! signals to it, waits for it to exit, and performs best-effort cleanup the child can no longer
//! do for itself once it has permanently dropped privileges.
//!
//! The supervisor never serves a request and never touches the service tables; its only job is
//! process lifecycle and cleanup of root-owned resources.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use log::{error, info, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use esdm_config::Config;

/// PID of the forked server child, `0` before `init` forks and after the child has been reaped.
/// Read by the signal handler, which cannot safely carry a closure-captured value, so it has to be
/// process-global.
static SERVER_PID: AtomicI32 = AtomicI32::new(0);

/// A single cleanup step's failure. Collected and logged, never propagated: `cleanup` runs every
/// step regardless of whether an earlier one returned this (§4.7, §7.1).
#[derive(Debug)]
pub struct CleanupError(std::io::Error);

impl fmt::Display for CleanupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CleanupError {}

impl From<std::io::Error> for CleanupError {
    fn from(e: std::io::Error) -> Self {
        Self(e)
    }
}

/// What one instance of resource cleanup must be able to do, abstracted so tests can swap in a
/// fake that records calls instead of touching the filesystem/SysV IPC namespace (§8.1).
pub trait CleanupTarget {
    fn unlink_socket(&self, path: &std::path::Path) -> Result<(), CleanupError>;
    fn remove_status_shm(&self) -> Result<(), CleanupError>;
    fn remove_semaphore(&self) -> Result<(), CleanupError>;
}

/// The real, OS-backed [`CleanupTarget`].
pub struct OsCleanup;

impl CleanupTarget for OsCleanup {
    fn unlink_socket(&self, path: &std::path::Path) -> Result<(), CleanupError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_status_shm(&self) -> Result<(), CleanupError> {
        // The status segment's producer/owner is out of scope (§1); from the supervisor's side
        // this is a best-effort unlink under its well-known name.
        match std::fs::remove_file("/dev/shm/esdm-rpc-status") {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_semaphore(&self) -> Result<(), CleanupError> {
        match std::fs::remove_file("/dev/shm/sem.esdm-rpc-status") {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Unlinks both socket paths and removes the status SHM segment and its semaphore. Every step is
/// best-effort (§4.7): a failure is logged and does not stop the remaining steps from running.
pub fn cleanup(config: &Config, target: &dyn CleanupTarget) {
    for path in [&config.unpriv_socket, &config.priv_socket] {
        if let Err(e) = target.unlink_socket(path) {
            warn!("cleanup: failed to unlink {}: {e}", path.display());
        }
    }

    if let Err(e) = target.remove_status_shm() {
        warn!("cleanup: failed to remove status shared-memory segment: {e}");
    }

    if let Err(e) = target.remove_semaphore() {
        warn!("cleanup: failed to remove named semaphore: {e}");
    }
}

extern "C" fn relay_to_child(raw_signal: i32) {
    let pid = SERVER_PID.load(Ordering::Acquire);
    if pid > 0 {
        let _ = signal::kill(Pid::from_raw(pid), Signal::try_from(raw_signal).ok());
    }
}

/// Installs handlers for `SIGHUP`/`SIGINT`/`SIGQUIT`/`SIGTERM` that relay the signal to
/// `SERVER_PID` without the supervisor itself acting on it (§4.7 step 4): the child owns shutdown
/// behavior, the supervisor just forwards.
///
/// # Safety
/// Installs a process-wide signal handler; must only be called once, from the supervisor process
/// before `wait`ing on the child.
unsafe fn install_relay_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(relay_to_child),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
        if let Err(e) = signal::sigaction(sig, &action) {
            error!("failed to install relay handler for {sig:?}: {e}");
        }
    }
}

/// Restores default disposition for the four relayed signals. Called once the child has exited
/// and the supervisor is about to run cleanup and exit itself (§4.7 step 4, "restore default
/// signal handling").
fn restore_default_handlers() {
    for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM] {
        unsafe {
            let _ = signal::sigaction(
                sig,
                &SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()),
            );
        }
    }
}

/// Runs the full supervisor lifecycle (§4.7): fork, with the child running `child_main` (expected
/// to be the bootstrap + accept-loop sequence, never returning on success) and the parent relaying
/// signals, waiting, and cleaning up.
///
/// Returns only in the parent, after the child has exited and cleanup has run. The child path
/// calls `child_main` and then exits the process directly — it never returns to this function's
/// caller, matching `fork`'s usual control-flow split.
pub fn init<F>(config: &Config, child_main: F) -> !
where
    F: FnOnce() -> i32,
{
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = child_main();
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            SERVER_PID.store(child.as_raw(), Ordering::Release);
            unsafe { install_relay_handlers() };

            info!("supervisor watching server pid {child}");

            let status = loop {
                match waitpid(child, None) {
                    Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                        break status
                    }
                    Ok(_) => continue,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        error!("waitpid failed: {e}");
                        break WaitStatus::StillAlive;
                    }
                }
            };

            SERVER_PID.store(0, Ordering::Release);
            restore_default_handlers();

            match status {
                WaitStatus::Exited(_, code) => info!("server exited with code {code}"),
                WaitStatus::Signaled(_, sig, _) => info!("server killed by signal {sig:?}"),
                _ => warn!("server wait status unavailable: {status:?}"),
            }

            cleanup(config, &OsCleanup);
            std::process::exit(0);
        }
        Err(e) => {
            error!("fork failed: {e}");
            std::process::exit(1);
        }
    }
}
