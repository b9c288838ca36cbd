// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Configuration for the ESDM RPC service plane.
//!
//! Values come from a `clap`-derived CLI struct, then get overridden by environment variables
//! where present. The server and client binaries both depend on this crate so that the socket
//! paths and wire limits they use always agree.

use std::path::PathBuf;

use clap::Parser;
use log::warn;

/// Default path of the unprivileged endpoint; mode 0666.
pub const DEFAULT_UNPRIV_SOCKET: &str = "/var/run/esdm-rpc-unpriv.socket";

/// Default path of the privileged endpoint; mode 0600.
pub const DEFAULT_PRIV_SOCKET: &str = "/var/run/esdm-rpc-priv.socket";

/// Default unprivileged account the server process drops to after bootstrap.
pub const DEFAULT_UNPRIV_USER: &str = "nobody";

/// Default maximum payload size accepted in a single request, in bytes.
pub const DEFAULT_MAX_MSG: u32 = 1 << 16;

/// Default per-connection read timeout, in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 2_000;

#[derive(Parser, Debug, Clone)]
#[command(name = "esdm-rpcd", about = "ESDM random number daemon RPC service plane")]
pub struct Cli {
    /// Path of the unprivileged (world rw) local socket.
    #[arg(long)]
    pub unpriv_socket: Option<PathBuf>,

    /// Path of the privileged (owner rw) local socket.
    #[arg(long)]
    pub priv_socket: Option<PathBuf>,

    /// Unprivileged account to drop to after bootstrap.
    #[arg(long)]
    pub user: Option<String>,

    /// Maximum accepted payload length, in bytes.
    #[arg(long)]
    pub max_msg: Option<u32>,

    /// Per-connection read timeout, in milliseconds.
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Stay attached to the controlling terminal instead of forking the supervisor/server split.
    #[arg(long)]
    pub foreground: bool,
}

/// Fully resolved configuration handed to the supervisor and bootstrap.
#[derive(Debug, Clone)]
pub struct Config {
    pub unpriv_socket: PathBuf,
    pub priv_socket: PathBuf,
    pub user: String,
    pub max_msg: u32,
    pub read_timeout_ms: u64,
    pub foreground: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unpriv_socket: PathBuf::from(DEFAULT_UNPRIV_SOCKET),
            priv_socket: PathBuf::from(DEFAULT_PRIV_SOCKET),
            user: DEFAULT_UNPRIV_USER.to_string(),
            max_msg: DEFAULT_MAX_MSG,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            foreground: false,
        }
    }
}

impl Config {
    /// Resolve configuration from CLI flags, falling back to environment variables, then to
    /// built-in defaults. CLI flags always win over the environment.
    pub fn from_cli(cli: Cli) -> Self {
        let mut cfg = Config::default();

        cfg.unpriv_socket = cli
            .unpriv_socket
            .or_else(|| env_path("ESDM_RPC_UNPRIV_SOCKET"))
            .unwrap_or(cfg.unpriv_socket);

        cfg.priv_socket = cli
            .priv_socket
            .or_else(|| env_path("ESDM_RPC_PRIV_SOCKET"))
            .unwrap_or(cfg.priv_socket);

        cfg.user = cli
            .user
            .or_else(|| std::env::var("ESDM_RPC_USER").ok())
            .unwrap_or(cfg.user);

        cfg.max_msg = cli
            .max_msg
            .or_else(|| env_parsed("ESDM_RPC_MAX_MSG"))
            .unwrap_or(cfg.max_msg);

        cfg.read_timeout_ms = cli
            .read_timeout_ms
            .or_else(|| env_parsed("ESDM_RPC_READ_TIMEOUT_MS"))
            .unwrap_or(cfg.read_timeout_ms);

        cfg.foreground = cli.foreground;

        cfg
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name).map(PathBuf::from)
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring malformed {name}={raw:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env_or_cli() {
        let cli = Cli {
            unpriv_socket: None,
            priv_socket: None,
            user: None,
            max_msg: None,
            read_timeout_ms: None,
            foreground: false,
        };

        let cfg = Config::from_cli(cli);
        assert_eq!(cfg.unpriv_socket, PathBuf::from(DEFAULT_UNPRIV_SOCKET));
        assert_eq!(cfg.priv_socket, PathBuf::from(DEFAULT_PRIV_SOCKET));
        assert_eq!(cfg.user, DEFAULT_UNPRIV_USER);
        assert_eq!(cfg.max_msg, DEFAULT_MAX_MSG);
        assert_eq!(cfg.read_timeout_ms, DEFAULT_READ_TIMEOUT_MS);
    }

    #[test]
    fn cli_flags_win_over_defaults() {
        let cli = Cli {
            unpriv_socket: Some(PathBuf::from("/tmp/u.sock")),
            priv_socket: None,
            user: Some("esdm".to_string()),
            max_msg: Some(4096),
            read_timeout_ms: None,
            foreground: true,
        };

        let cfg = Config::from_cli(cli);
        assert_eq!(cfg.unpriv_socket, PathBuf::from("/tmp/u.sock"));
        assert_eq!(cfg.user, "esdm");
        assert_eq!(cfg.max_msg, 4096);
        assert!(cfg.foreground);
    }
}
