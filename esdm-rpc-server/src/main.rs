// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! `esdm-rpcd`: the random-number daemon's RPC service plane binary.
//!
//! Normal operation forks into a privileged supervisor (this process) and an unprivileged server
//! child (§4.7); `--foreground` skips the fork for interactive use and testing, running the
//! bootstrap/serve sequence directly so a developer can `Ctrl-C` it without reaching for `kill`.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::error;

use esdm_config::{Cli, Config};
use esdm_rpc_protocol::accept::{self, ServerExit};
use esdm_rpc_protocol::bootstrap;
use esdm_rpc_protocol::messages::ChaChaRandomSource;
use esdm_rpc_protocol::service::{self, ServiceState, ServiceTable};

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli);

    if config.foreground {
        std::process::exit(run_child(&config));
    }

    esdm_rpc_protocol::supervisor::init(&config, || run_child(&config));
}

/// Runs the server (child) process to completion: bootstrap, then both accept loops. Shared
/// between the forked child path and `--foreground` mode, since the sequence is identical; only
/// whether a privileged parent is watching differs.
fn run_child(config: &Config) -> i32 {
    let max_msg = config.max_msg.min(esdm_rpc_protocol::MAX_MSG_HARD_LIMIT);
    let read_timeout = Duration::from_millis(config.read_timeout_ms);

    // Built once here and leaked: every handler thread for the rest of this process's life reads
    // these through a `'static` reference without synchronization (§5 "service tables are
    // immutable after bootstrap").
    let state: &'static ServiceState = Box::leak(Box::new(ServiceState {
        random_source: Arc::new(ChaChaRandomSource::default()),
    }));
    let unpriv_table: &'static ServiceTable<UnixStream> =
        Box::leak(Box::new(service::unprivileged_table()));
    let priv_table: &'static ServiceTable<UnixStream> =
        Box::leak(Box::new(service::privileged_table()));

    let exit = ServerExit::new();

    // SAFETY: called exactly once per process, before the accept loops that read `exit` start.
    unsafe {
        accept::install_shutdown_handlers(exit.clone());
    }

    let priv_endpoint = {
        let exit = exit.clone();
        bootstrap::run(config, move |plan| {
            let exit = exit.clone();
            let spawned = thread::Builder::new()
                .name("esdm-listen-unpriv".to_string())
                .spawn(move || match bootstrap::unpriv_listener_bootstrap(plan) {
                    Ok(endpoint) => {
                        accept::accept_loop(
                            "esdm-unpriv",
                            &endpoint.listener,
                            unpriv_table,
                            state,
                            max_msg,
                            read_timeout,
                            exit,
                        );
                    }
                    Err(e) => {
                        error!("unprivileged listener bootstrap failed: {e}");
                    }
                });

            if let Err(e) = spawned {
                error!("failed to spawn unprivileged listener thread: {e}");
            }
        })
    };

    let priv_endpoint = match priv_endpoint {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("server bootstrap failed, exiting: {e}");
            return 1;
        }
    };

    // S5: the privileged accept loop runs on the current thread for the rest of the process's
    // life (§4.8 state table); it only returns once `exit` has been signaled, which nothing in
    // this binary currently does short of the process being killed.
    accept::accept_loop(
        "esdm-priv",
        &priv_endpoint.listener,
        priv_table,
        state,
        max_msg,
        read_timeout,
        exit,
    );

    0
}
