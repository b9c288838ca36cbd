// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The access guard (§4.6): resolves a connected peer's OS identity and answers "is this caller
//! privileged?" for handlers that require it.
//!
//! This is advisory, defense-in-depth on top of the endpoint's file-mode (§4.3): a handler on the
//! unprivileged table must never consult it to *grant* privilege, only handlers reachable through
//! the privileged endpoint consult it to catch a misconfigured filesystem permission.

use std::os::fd::AsFd;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredential {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

/// Reads the peer's credentials off an already-connected local socket via `SO_PEERCRED`.
pub fn peer_credential<S: AsFd>(stream: &S) -> nix::Result<PeerCredential> {
    let cred = getsockopt(stream, PeerCredentials)?;
    Ok(PeerCredential {
        uid: cred.uid(),
        gid: cred.gid(),
        pid: cred.pid(),
    })
}

/// A peer is privileged iff its effective UID is 0 (§4.6). Resolving credentials can fail (e.g.
/// the peer already closed its end); such a peer is conservatively treated as unprivileged.
pub fn peer_is_privileged<S: AsFd>(stream: &S) -> bool {
    match peer_credential(stream) {
        Ok(cred) => cred.uid == 0,
        Err(e) => {
            log::warn!("could not read peer credentials, denying privilege: {e}");
            false
        }
    }
}
