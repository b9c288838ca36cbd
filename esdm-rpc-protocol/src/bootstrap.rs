// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The child bootstrap state machine (§4.8, §4.8a): runs once inside the forked server process,
//! before it ever serves a request.
//!
//! States are linear, no backtracking:
//!
//! ```text
//! S0 start -> S1 priv-listen -> S2 spawn-unpriv -> S3 drop -> S4 release -> S5 serve
//! ```
//!
//! Any failure before S5 is process-fatal (§4.8): the caller logs it, tears down whatever
//! listener(s) were created, and exits nonzero. A failure to drop privileges in S3 is especially
//! fatal and MUST NOT release the init barrier.

use std::sync::Arc;

use log::{error, info};

use esdm_config::Config;

use crate::barrier::InitBarrier;
use crate::listener::Endpoint;
use crate::BootstrapError;

/// Resolves `username` to a uid/gid pair and permanently drops to it: `setgid` then `setuid`, in
/// that order, since dropping uid first would leave the process unable to change its gid.
///
/// Verifies the drop actually took by re-reading `geteuid`/`getegid` after the calls return
/// success — a silently-ignored `setuid` (e.g. under certain sandboxes) must not go unnoticed,
/// since every downstream invariant (§8 testable property 4) depends on it.
pub fn drop_privileges_permanent(username: &str) -> Result<(), BootstrapError> {
    let user = nix::unistd::User::from_name(username)
        .map_err(BootstrapError::DropPrivileges)?
        .ok_or(BootstrapError::DropPrivilegesNotVerified)?;

    nix::unistd::setgid(user.gid).map_err(BootstrapError::DropPrivileges)?;
    nix::unistd::setuid(user.uid).map_err(BootstrapError::DropPrivileges)?;

    if nix::unistd::geteuid() != user.uid || nix::unistd::getegid() != user.gid {
        return Err(BootstrapError::DropPrivilegesNotVerified);
    }

    Ok(())
}

/// What state S2 hands off to the unprivileged listener thread (§4.8a): the endpoint it must
/// create and chmod itself (a second process-uid-dropping thread racing the main thread would be
/// redundant and harder to reason about), and the barrier it must wait on before accepting.
pub struct UnprivListenerPlan {
    pub socket_path: std::path::PathBuf,
    pub mode: u32,
    pub barrier: Arc<InitBarrier>,
}

/// Runs S1-S2: creates the privileged endpoint as root, then returns a plan for the caller to
/// spawn the unprivileged listener bootstrap thread (§4.8a) with.
///
/// Splitting this out from [`run`] lets tests exercise "privileged endpoint creation" and "drop
/// ordering" independently of an actual `fork`.
pub fn priv_listen(config: &Config) -> Result<Endpoint, BootstrapError> {
    info!("binding privileged endpoint at {}", config.priv_socket.display());
    Endpoint::bind(&config.priv_socket, 0o600)
}

/// Runs the unprivileged listener bootstrap (§4.8a) on its own thread: create the endpoint, chmod
/// it, then block on the barrier before ever accepting. Intended to be spawned from S2 and joined
/// (or just detached) from the caller once S5 starts its own accept loop.
pub fn unpriv_listener_bootstrap(
    plan: UnprivListenerPlan,
) -> Result<Endpoint, BootstrapError> {
    let endpoint = Endpoint::bind(&plan.socket_path, plan.mode)?;
    plan.barrier.wait();
    Ok(endpoint)
}

/// Runs the full S0-S5 sequence for the server (child) process. `on_unpriv_ready` is called once
/// the unprivileged endpoint has been bound (still inside S2, before privileges are dropped) and
/// receives ownership of it plus the barrier it must wait on — callers pass a closure that spawns
/// the accept-loop thread described in §4.8a.
///
/// Returns the bound privileged [`Endpoint`] once S4 has released the barrier; the caller is
/// expected to run the privileged accept loop (S5) itself on the current thread, since that loop
/// never returns in normal operation.
pub fn run<F>(config: &Config, on_unpriv_ready: F) -> Result<Endpoint, BootstrapError>
where
    F: FnOnce(UnprivListenerPlan),
{
    // S1: priv-listen.
    let priv_endpoint = priv_listen(config)?;

    // S2: spawn-unpriv.
    let barrier = Arc::new(InitBarrier::new());
    on_unpriv_ready(UnprivListenerPlan {
        socket_path: config.unpriv_socket.clone(),
        mode: 0o666,
        barrier: Arc::clone(&barrier),
    });

    // S3: drop. Fatal and non-recoverable on failure; must not reach S4.
    if let Err(e) = drop_privileges_permanent(&config.user) {
        error!("privilege drop failed, aborting before releasing init barrier: {e}");
        return Err(e);
    }

    // S4: release.
    barrier.open();

    // S5 (serve) is the caller's responsibility: it owns the thread this function returns on.
    Ok(priv_endpoint)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    PrivListen,
    SpawnUnpriv,
    Drop,
    Release,
    Serve,
}

impl State {
    fn next(self) -> Option<State> {
        match self {
            State::Start => Some(State::PrivListen),
            State::PrivListen => Some(State::SpawnUnpriv),
            State::SpawnUnpriv => Some(State::Drop),
            State::Drop => Some(State::Release),
            State::Release => Some(State::Serve),
            State::Serve => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_is_linear_with_no_backtracking() {
        let mut s = State::Start;
        let mut seen = vec![s];
        while let Some(next) = s.next() {
            assert!(!seen.contains(&next), "state {:?} revisited", next);
            seen.push(next);
            s = next;
        }
        assert_eq!(s, State::Serve);
        assert_eq!(
            seen,
            vec![
                State::Start,
                State::PrivListen,
                State::SpawnUnpriv,
                State::Drop,
                State::Release,
                State::Serve,
            ]
        );
    }

    #[test]
    fn drop_privileges_for_unknown_user_is_an_error() {
        let err = drop_privileges_permanent("this-user-should-not-exist-on-any-host");
        assert!(err.is_err());
    }

    #[test]
    fn priv_listen_binds_at_configured_path_with_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("esdm-bootstrap-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut config = Config::default();
        config.priv_socket = dir.join("priv.sock");

        let endpoint = priv_listen(&config).unwrap();
        let meta = std::fs::metadata(&endpoint.path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        drop(endpoint);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unpriv_listener_bootstrap_blocks_until_barrier_opens() {
        let dir = std::env::temp_dir().join(format!("esdm-bootstrap-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let barrier = Arc::new(InitBarrier::new());
        let plan = UnprivListenerPlan {
            socket_path: dir.join("unpriv.sock"),
            mode: 0o666,
            barrier: Arc::clone(&barrier),
        };

        let handle = std::thread::spawn(move || unpriv_listener_bootstrap(plan));

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());

        barrier.open();
        let endpoint = handle.join().unwrap().unwrap();
        assert!(endpoint.path.exists());

        drop(endpoint);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
