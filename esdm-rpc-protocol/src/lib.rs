// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The ESDM RPC service plane: a privilege-separated, connection-oriented, length-framed
//! request/response transport that multiplexes local clients onto the entropy daemon's DRNG
//! back-end.
//!
//! This crate is the "core" described by the design: frame codec, scratch allocator, endpoint
//! listeners, connection handler, dispatcher, access guard, and the supervisor/bootstrap process
//! split. The DRNG/entropy-pool algorithms themselves are out of scope; [`messages::RandomSource`]
//! is the trait boundary handlers call through.

pub mod accept;
pub mod access;
pub mod arena;
pub mod barrier;
pub mod bootstrap;
pub mod client;
pub mod connection;
pub mod frame;
pub mod listener;
pub mod messages;
pub mod service;
pub mod supervisor;

use std::fmt;

/// Maximum payload length this crate will ever read or write on a single request, independent of
/// the configured `max_msg` (which must not exceed this). Sized to keep a worst-case connection's
/// scratch arena a small, fixed amount of memory.
pub const MAX_MSG_HARD_LIMIT: u32 = 1 << 20;

/// Extra bytes reserved in the scratch arena beyond the declared payload bound, for the
/// intermediate allocations a message deserializer performs while unpacking a `max_msg`-sized
/// payload (lengths, option discriminants, alignment padding).
pub const HEADROOM: usize = 4096;

#[derive(Debug)]
pub enum Error {
    /// The peer's fd produced an OS-level I/O error.
    Io(std::io::Error),

    /// The peer took longer than the configured read timeout to send the rest of a frame.
    Timeout,

    /// The peer closed the connection mid-frame.
    Eof,

    /// The frame's header or payload did not parse as a valid message.
    Decode(DecodeError),

    /// `method_index` is not present in the connection's endpoint's service table.
    UnknownMethod(u32),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Timeout => write!(f, "read timed out"),
            Self::Eof => write!(f, "peer closed connection mid-frame"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::UnknownMethod(m) => write!(f, "unknown method index {m}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Whether a given [`Error`] is connection-fatal (always true for variants defined so far; kept
/// as a method rather than relying on callers to enumerate variants, since a future variant might
/// be recoverable).
impl Error {
    /// True if the transport should send a `SERVICE_FAILED` reply before tearing the connection
    /// down (feasible because the header was already decoded). False if the connection should
    /// just be dropped silently (the header itself may not even be available).
    pub fn reply_before_close(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::UnknownMethod(_))
    }
}

#[derive(Debug)]
pub enum DecodeError {
    /// Fewer bytes were available than the declared length required.
    Truncated,

    /// A length or discriminant field in the payload was structurally invalid.
    Malformed,

    /// The scratch arena ran out of room for this request's intermediate allocations. Reported to
    /// the client identically to any other decode failure (`SERVICE_FAILED`); a connection that
    /// hits this is not torn down, since there was nothing wrong with the connection itself.
    OutOfMemory,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated message"),
            Self::Malformed => write!(f, "malformed message"),
            Self::OutOfMemory => write!(f, "scratch allocator exhausted"),
        }
    }
}

/// Errors specific to process bootstrap (listener setup, privilege drop). Always process-fatal.
#[derive(Debug)]
pub enum BootstrapError {
    Listen(std::io::Error),
    Chmod(nix::Error),
    DropPrivileges(nix::Error),
    DropPrivilegesNotVerified,
}

impl std::error::Error for BootstrapError {}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Listen(e) => write!(f, "failed to create listener: {e}"),
            Self::Chmod(e) => write!(f, "failed to chmod socket: {e}"),
            Self::DropPrivileges(e) => write!(f, "failed to drop privileges: {e}"),
            Self::DropPrivilegesNotVerified => {
                write!(f, "privilege drop did not take effect, aborting")
            }
        }
    }
}

/// A connected pair of local stream sockets, for driving connection-handler tests without a real
/// listener. Mirrors how a handler thread sees one half after `accept()`.
pub mod pipe {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::OwnedFd;

    pub struct Endpoint {
        pub fd: OwnedFd,
    }

    pub fn pipe() -> std::io::Result<(Endpoint, Endpoint)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;

        Ok((Endpoint { fd: a }, Endpoint { fd: b }))
    }

    impl std::io::Read for Endpoint {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(nix::unistd::read(&self.fd, buf)?)
        }
    }

    impl std::io::Write for Endpoint {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            use std::os::fd::AsFd;
            Ok(nix::unistd::write(self.fd.as_fd(), buf)?)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl std::os::fd::AsFd for Endpoint {
        fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
            self.fd.as_fd()
        }
    }
}
