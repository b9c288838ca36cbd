// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Service tables and the dispatcher (§4.5, §3 "Service table").
//!
//! A [`ServiceTable`] is a dense array from `method_index` to a handler capability. Two tables
//! exist process-wide, one per trust tier; they are built once at bootstrap and never mutated
//! again, so handlers can read them from any thread without synchronization.

use std::os::fd::AsFd;
use std::sync::Arc;

use log::debug;

use crate::arena::Arena;
use crate::frame::{ServerHeader, StatusCode};
use crate::messages::{
    EmptyRequest, GetRandomBytesFullRequest, GetRandomRequest, GetRandomResponse, Message,
    RandomSource, RngStatus, StatusResponse,
};

/// Shared, immutable state every handler can reach. Grows as more methods need collaborators; for
/// now it is just the DRNG back-end (§4.11).
pub struct ServiceState {
    pub random_source: Arc<dyn RandomSource>,
}

/// What a [`Handler`] hands back to the dispatcher. This plays the role of the "completion
/// callback" in §4.5: the handler calls it implicitly by returning, exactly once, and the
/// dispatcher is the only code that turns it into wire bytes.
pub enum HandlerOutcome {
    /// The handler succeeded; `payload` is the already-encoded response message.
    Success(Vec<u8>),
    /// The decoded arguments were well-formed but semantically invalid for this handler.
    GarbageArgs,
    /// The handler hit an internal error (e.g. the DRNG back-end is unavailable).
    SystemErr,
}

/// Per-call context a handler gets: shared service state, the request's scratch arena, and a
/// capability to consult the access guard (§4.6) without the dispatcher precomputing it — most
/// handlers never call this; only ones bound to the privileged table need to.
pub struct HandlerContext<'a, S> {
    pub state: &'a ServiceState,
    pub request_id: u32,
    stream: &'a S,
}

impl<'a, S: AsFd> HandlerContext<'a, S> {
    pub fn is_caller_privileged(&self) -> bool {
        crate::access::peer_is_privileged(self.stream)
    }
}

pub type Handler<S> = fn(&HandlerContext<S>, &[u8], &mut Arena) -> HandlerOutcome;

pub struct Descriptor<S> {
    pub name: &'static str,
    pub handler: Handler<S>,
}

/// Maps `method_index` to a handler capability. Built once via [`ServiceTable::new`]; the 0th slot
/// is a dense array, not a sparse map, so lookup is `O(1)` and cannot allocate.
pub struct ServiceTable<S> {
    descriptors: Vec<Option<Descriptor<S>>>,
}

impl<S> ServiceTable<S> {
    pub fn new(descriptors: Vec<Option<Descriptor<S>>>) -> Self {
        Self { descriptors }
    }

    pub fn descriptor(&self, method_index: u32) -> Option<&Descriptor<S>> {
        self.descriptors.get(method_index as usize)?.as_ref()
    }
}

/// The dispatcher (§4.5): given a fully-buffered request, locates the handler, decodes the
/// payload through the arena, invokes the handler, and encodes whatever it returns into a
/// complete server header + payload ready to write.
///
/// Returns `None` when `method_index` is not present in `table` — the caller replies
/// `SERVICE_FAILED` in that case, same as for a handler-reported failure, but logs it distinctly.
pub fn dispatch<S: AsFd>(
    table: &ServiceTable<S>,
    state: &ServiceState,
    stream: &S,
    method_index: u32,
    request_id: u32,
    payload: &[u8],
    arena: &mut Arena,
) -> Result<(ServerHeader, Vec<u8>), crate::Error> {
    let descriptor = table
        .descriptor(method_index)
        .ok_or(crate::Error::UnknownMethod(method_index))?;

    debug!("dispatching method {} ({})", method_index, descriptor.name);

    let ctx = HandlerContext {
        state,
        request_id,
        stream,
    };

    let outcome = (descriptor.handler)(&ctx, payload, arena);

    let (status, body) = match outcome {
        HandlerOutcome::Success(body) => (StatusCode::Success, body),
        HandlerOutcome::GarbageArgs => {
            debug!("method {} reported garbage arguments", method_index);
            (StatusCode::ServiceFailed, Vec::new())
        }
        HandlerOutcome::SystemErr => {
            debug!("method {} reported an internal error", method_index);
            (StatusCode::ServiceFailed, Vec::new())
        }
    };

    let header = ServerHeader {
        status_code: status,
        method_index,
        message_length: body.len() as u32,
        request_id,
    };

    Ok((header, body))
}

/// Method indices on the unprivileged table. Dense and independent from the privileged table's
/// numbering (§3 "Service table").
pub mod unpriv_method {
    pub const GET_RANDOM: u32 = 0;
    pub const STATUS: u32 = 1;
}

/// Method indices on the privileged table.
pub mod priv_method {
    pub const GET_RANDOM_BYTES_FULL: u32 = 0;
    pub const RNG_RESEED: u32 = 1;
}

fn get_random<S>(_ctx: &HandlerContext<S>, payload: &[u8], arena: &mut Arena) -> HandlerOutcome {
    let req = match GetRandomRequest::decode_in(arena, payload) {
        Ok(req) => req,
        Err(_) => return HandlerOutcome::GarbageArgs,
    };

    let mut bytes = vec![0u8; req.count as usize];
    if _ctx.state.random_source.fill(&mut bytes).is_err() {
        return HandlerOutcome::SystemErr;
    }

    let resp = GetRandomResponse { bytes };
    let mut out = Vec::new();
    resp.encode_into(&mut out);
    HandlerOutcome::Success(out)
}

fn status<S>(_ctx: &HandlerContext<S>, payload: &[u8], arena: &mut Arena) -> HandlerOutcome {
    if EmptyRequest::decode_in(arena, payload).is_err() {
        return HandlerOutcome::GarbageArgs;
    }

    let resp = StatusResponse {
        status: _ctx.state.random_source.status(),
        bytes_served: 0,
    };
    let mut out = Vec::new();
    resp.encode_into(&mut out);
    HandlerOutcome::Success(out)
}

/// Bound to the privileged endpoint's file-mode (0600); the credential check below is the
/// defense-in-depth layer described in §4.6, not the primary control.
fn get_random_bytes_full<S: AsFd>(
    ctx: &HandlerContext<S>,
    payload: &[u8],
    arena: &mut Arena,
) -> HandlerOutcome {
    if !ctx.is_caller_privileged() {
        return HandlerOutcome::SystemErr;
    }

    let req = match GetRandomBytesFullRequest::decode_in(arena, payload) {
        Ok(req) => req,
        Err(_) => return HandlerOutcome::GarbageArgs,
    };

    let mut bytes = vec![0u8; req.count as usize];
    if ctx.state.random_source.fill(&mut bytes).is_err() {
        return HandlerOutcome::SystemErr;
    }

    if ctx.state.random_source.status() != RngStatus::FullySeeded {
        return HandlerOutcome::SystemErr;
    }

    let resp = GetRandomResponse { bytes };
    let mut out = Vec::new();
    resp.encode_into(&mut out);
    HandlerOutcome::Success(out)
}

fn rng_reseed<S: AsFd>(ctx: &HandlerContext<S>, payload: &[u8], arena: &mut Arena) -> HandlerOutcome {
    if !ctx.is_caller_privileged() {
        return HandlerOutcome::SystemErr;
    }

    if EmptyRequest::decode_in(arena, payload).is_err() {
        return HandlerOutcome::GarbageArgs;
    }

    match ctx.state.random_source.reseed() {
        Ok(()) => HandlerOutcome::Success(Vec::new()),
        Err(_) => HandlerOutcome::SystemErr,
    }
}

/// Builds the unprivileged service table: `GetRandom`, `Status`. Handlers here MUST NOT require
/// privilege (§4.6).
pub fn unprivileged_table<S: AsFd>() -> ServiceTable<S> {
    ServiceTable::new(vec![
        Some(Descriptor {
            name: "GetRandom",
            handler: get_random,
        }),
        Some(Descriptor {
            name: "Status",
            handler: status,
        }),
    ])
}

/// Builds the privileged service table: `GetRandomBytesFull`, `RngReseed`.
pub fn privileged_table<S: AsFd>() -> ServiceTable<S> {
    ServiceTable::new(vec![
        Some(Descriptor {
            name: "GetRandomBytesFull",
            handler: get_random_bytes_full,
        }),
        Some(Descriptor {
            name: "RngReseed",
            handler: rng_reseed,
        }),
    ])
}
