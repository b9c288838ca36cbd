// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Client-side request/reply helper (§6 "wire protocol"): encode one request frame, write it, and
//! block for the matching reply.
//!
//! Grounded in the retrieved RPC protocol crate's `do_rpc_call`, adapted to this core's simpler
//! fixed-width header instead of ONC RPC's XID/record-mark framing. Like the server side, a client
//! connection only ever has one request in flight (§4.5 "Ordering"): this helper does not return
//! until it has read the reply to the request it just sent.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::frame::{ClientHeader, ServerHeader, StatusCode, CLIENT_HEADER_LEN, SERVER_HEADER_LEN};
use crate::Error;

static NEXT_REQUEST_ID: AtomicU32 = AtomicU32::new(1);

/// Allocates a fresh `request_id`. Monotonically increasing for the life of the process; good
/// enough for a client that issues requests one at a time, which is all this transport supports
/// per connection.
pub fn next_request_id() -> u32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A decoded reply. `SERVICE_FAILED` replies decode just as cleanly as `SUCCESS` ones; it is the
/// caller's job to check `status` before trusting `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub request_id: u32,
    pub payload: Vec<u8>,
}

/// Sends one request on `stream` and blocks until the matching reply has been fully read.
///
/// Returns [`Error::Eof`] if the peer closes before a complete reply arrives, same as the server
/// side's handling of a peer that disconnects mid-frame.
pub fn call<S: Read + Write>(
    stream: &mut S,
    method_index: u32,
    payload: &[u8],
) -> Result<Reply, Error> {
    let request_id = next_request_id();

    let header = ClientHeader {
        method_index,
        message_length: payload.len() as u32,
        request_id,
    };

    let mut header_bytes = [0u8; CLIENT_HEADER_LEN];
    header.encode(&mut header_bytes);

    stream.write_all(&header_bytes)?;
    stream.write_all(payload)?;

    let mut reply_header_bytes = [0u8; SERVER_HEADER_LEN];
    read_exact_or_eof(stream, &mut reply_header_bytes)?;
    let reply_header = ServerHeader::decode(&reply_header_bytes)?;

    let mut body = vec![0u8; reply_header.message_length as usize];
    read_exact_or_eof(stream, &mut body)?;

    Ok(Reply {
        status: reply_header.status_code,
        request_id: reply_header.request_id,
        payload: body,
    })
}

/// Like `Read::read_exact`, but a clean EOF (zero bytes available right at a frame boundary) comes
/// back as [`Error::Eof`] instead of `std::io::ErrorKind::UnexpectedEof`, matching how the server
/// side's connection handler distinguishes the two (§4.4).
fn read_exact_or_eof<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<(), Error> {
    stream.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Eof
        } else {
            Error::Io(e)
        }
    })
}
