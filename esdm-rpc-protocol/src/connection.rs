// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The connection handler (§4.4): one [`Connection`] owns one accepted stream end to end, reading
//! requests, dispatching them, and writing replies until the peer disconnects or an unrecoverable
//! I/O error occurs.
//!
//! Each connection carries its own fixed-size raw-frame buffer and its own [`Arena`] — sized once
//! at construction from the endpoint's `max_msg` — so a connection's worst-case memory footprint
//! is bounded independent of how many requests it serves.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;

use log::{debug, warn};

use crate::arena::Arena;
use crate::frame::{write_reply, ClientHeader, ServerHeader, CLIENT_HEADER_LEN};
use crate::service::{dispatch, ServiceState, ServiceTable};
use crate::{Error, HEADROOM};

/// Owns one accepted connection and the service table it was accepted against (§3 "two
/// independent service tables, one per endpoint").
pub struct Connection<'a, S> {
    stream: S,
    table: &'a ServiceTable<S>,
    state: &'a ServiceState,
    max_msg: u32,
    read_buf: Box<[u8]>,
    arena: Arena,
}

impl<'a, S: Read + Write + AsFd> Connection<'a, S> {
    pub fn new(
        stream: S,
        table: &'a ServiceTable<S>,
        state: &'a ServiceState,
        max_msg: u32,
    ) -> Self {
        let frame_buf_len = CLIENT_HEADER_LEN + max_msg as usize;
        Self {
            stream,
            table,
            state,
            max_msg,
            read_buf: vec![0u8; frame_buf_len].into_boxed_slice(),
            arena: Arena::with_capacity(max_msg as usize + HEADROOM),
        }
    }

    /// Serves requests until the peer disconnects cleanly or a fatal I/O error occurs. Per-request
    /// protocol errors (malformed frame, unknown method) are reported back to the peer and do not
    /// end the connection — only [`Error::Eof`] and raw I/O failures do (§4.4 step 5).
    pub fn serve(&mut self) {
        loop {
            match self.handle_one() {
                Ok(()) => continue,
                Err(Error::Eof) => {
                    debug!("connection closed by peer");
                    return;
                }
                Err(e) if e.reply_before_close() => {
                    warn!("request failed, continuing connection: {e}");
                    continue;
                }
                Err(e) => {
                    warn!("connection terminated: {e}");
                    return;
                }
            }
        }
    }

    /// Reads one request, dispatches it, and writes the reply. Returns the error instead of acting
    /// on it so [`serve`](Self::serve) can decide whether to keep the connection open.
    fn handle_one(&mut self) -> Result<(), Error> {
        self.read_exact(0, CLIENT_HEADER_LEN)?;
        let header = ClientHeader::decode(&self.read_buf[..CLIENT_HEADER_LEN]);
        let message_length = header.clamped_message_length(self.max_msg) as usize;

        self.read_exact(CLIENT_HEADER_LEN, message_length)?;
        let payload = &self.read_buf[CLIENT_HEADER_LEN..CLIENT_HEADER_LEN + message_length];

        let result = dispatch(
            self.table,
            self.state,
            &self.stream,
            header.method_index,
            header.request_id,
            payload,
            &mut self.arena,
        );

        let (reply_header, body) = match result {
            Ok(reply) => reply,
            Err(Error::UnknownMethod(m)) => {
                self.arena.reset();
                self.zero_read_buf(message_length);
                write_reply(
                    &mut self.stream,
                    &ServerHeader::service_failed(m, header.request_id),
                    &[],
                )?;
                return Err(Error::UnknownMethod(m));
            }
            Err(e) => return Err(e),
        };

        write_reply(&mut self.stream, &reply_header, &body)?;
        self.arena.reset();
        self.zero_read_buf(message_length);
        Ok(())
    }

    /// Zeroes the portion of the receive buffer used by the request just handled (§4.4 step 4:
    /// "zero the receive buffer and reset the scratch allocator"), so a later request on this
    /// connection never reads stale bytes left over from an earlier one's payload.
    fn zero_read_buf(&mut self, message_length: usize) {
        self.read_buf[..CLIENT_HEADER_LEN + message_length].fill(0);
    }

    /// Fills `self.read_buf[offset..offset + len]` from the stream, resuming across partial reads.
    /// A zero-length read at the very start of a frame (nothing buffered yet) is a clean
    /// disconnect; anywhere else it means the peer died mid-frame, which is `Eof` too but a
    /// protocol violation rather than a normal close.
    fn read_exact(&mut self, offset: usize, len: usize) -> Result<(), Error> {
        let mut filled = 0;
        while filled < len {
            match self.stream.read(&mut self.read_buf[offset + filled..offset + len]) {
                Ok(0) => return Err(Error::Eof),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(Error::Timeout)
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChaChaRandomSource, GetRandomRequest, Message};
    use crate::service;
    use std::sync::Arc;

    fn test_state() -> ServiceState {
        ServiceState {
            random_source: Arc::new(ChaChaRandomSource::default()),
        }
    }

    #[test]
    fn serves_one_request_and_returns_on_clean_close() {
        let table = service::unprivileged_table();
        let state = test_state();
        let (mut client, server) = crate::pipe::pipe().unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut conn = Connection::new(server, &table, &state, 4096);
                conn.serve();
            });

            let req = GetRandomRequest { count: 8 };
            let mut payload = Vec::new();
            req.encode_into(&mut payload);

            let mut frame = Vec::new();
            frame.extend_from_slice(&service::unpriv_method::GET_RANDOM.to_le_bytes());
            frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            frame.extend_from_slice(&1u32.to_le_bytes());
            frame.extend_from_slice(&payload);
            client.write_all(&frame).unwrap();

            let mut reply = [0u8; crate::frame::SERVER_HEADER_LEN];
            client.read_exact(&mut reply).unwrap();
            let header = ServerHeader::decode(&reply).unwrap();
            assert_eq!(header.status_code, crate::frame::StatusCode::Success);
            assert_eq!(header.request_id, 1);
            assert_eq!(header.message_length, 4 + 8);

            let mut body = vec![0u8; header.message_length as usize];
            client.read_exact(&mut body).unwrap();

            drop(client);
        });
    }

    #[test]
    fn unknown_method_gets_a_reply_and_connection_stays_open() {
        let table = service::unprivileged_table();
        let state = test_state();
        let (mut client, server) = crate::pipe::pipe().unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut conn = Connection::new(server, &table, &state, 4096);
                conn.serve();
            });

            let mut frame = Vec::new();
            frame.extend_from_slice(&999u32.to_le_bytes());
            frame.extend_from_slice(&0u32.to_le_bytes());
            frame.extend_from_slice(&5u32.to_le_bytes());
            client.write_all(&frame).unwrap();

            let mut reply = [0u8; crate::frame::SERVER_HEADER_LEN];
            client.read_exact(&mut reply).unwrap();
            let header = ServerHeader::decode(&reply).unwrap();
            assert_eq!(header.status_code, crate::frame::StatusCode::ServiceFailed);
            assert_eq!(header.request_id, 5);

            drop(client);
        });
    }
}
