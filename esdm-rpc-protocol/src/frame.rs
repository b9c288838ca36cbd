// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The length-framed binary envelope wrapping each serialized RPC message (§4.1 of the design).
//!
//! All four header fields are little-endian on the wire regardless of host byte order;
//! `to_le_bytes`/`from_le_bytes` already do the right thing on a big-endian host, so there is no
//! separate byte-swap path to get wrong.

use std::io::{self, Write};

/// Size, in bytes, of a client->server header: `method_index`, `message_length`, `request_id`.
pub const CLIENT_HEADER_LEN: usize = 4 * 3;

/// Size, in bytes, of a server->client header: `status_code`, `method_index`, `message_length`,
/// `request_id`.
pub const SERVER_HEADER_LEN: usize = 4 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    ServiceFailed,
}

impl StatusCode {
    fn to_wire(self) -> u32 {
        match self {
            StatusCode::Success => 0,
            StatusCode::ServiceFailed => 1,
        }
    }

    fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(StatusCode::Success),
            1 => Some(StatusCode::ServiceFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHeader {
    pub method_index: u32,
    pub message_length: u32,
    pub request_id: u32,
}

impl ClientHeader {
    /// Parses a header out of the first [`CLIENT_HEADER_LEN`] bytes of `buf`.
    ///
    /// Panics if `buf` is shorter than [`CLIENT_HEADER_LEN`]; callers only invoke this once that
    /// many bytes have actually been read off the wire.
    pub fn decode(buf: &[u8]) -> Self {
        let method_index = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let message_length = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let request_id = u32::from_le_bytes(buf[8..12].try_into().unwrap());

        Self {
            method_index,
            message_length,
            request_id,
        }
    }

    /// Returns `message_length` clamped to `max_msg`, per the invariant that the server never
    /// reads more payload than that regardless of what the client declared.
    pub fn clamped_message_length(&self, max_msg: u32) -> u32 {
        self.message_length.min(max_msg)
    }

    /// Encodes into the first [`CLIENT_HEADER_LEN`] bytes of `out`. Used by the client side; the
    /// server only ever decodes this header, never encodes one.
    pub fn encode(&self, out: &mut [u8; CLIENT_HEADER_LEN]) {
        out[0..4].copy_from_slice(&self.method_index.to_le_bytes());
        out[4..8].copy_from_slice(&self.message_length.to_le_bytes());
        out[8..12].copy_from_slice(&self.request_id.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHeader {
    pub status_code: StatusCode,
    pub method_index: u32,
    pub message_length: u32,
    pub request_id: u32,
}

impl ServerHeader {
    pub fn success(method_index: u32, request_id: u32, message_length: u32) -> Self {
        Self {
            status_code: StatusCode::Success,
            method_index,
            message_length,
            request_id,
        }
    }

    pub fn service_failed(method_index: u32, request_id: u32) -> Self {
        Self {
            status_code: StatusCode::ServiceFailed,
            method_index,
            message_length: 0,
            request_id,
        }
    }

    pub fn encode(&self, out: &mut [u8; SERVER_HEADER_LEN]) {
        out[0..4].copy_from_slice(&self.status_code.to_wire().to_le_bytes());
        out[4..8].copy_from_slice(&self.method_index.to_le_bytes());
        out[8..12].copy_from_slice(&self.message_length.to_le_bytes());
        out[12..16].copy_from_slice(&self.request_id.to_le_bytes());
    }

    /// Parses a header out of the first [`SERVER_HEADER_LEN`] bytes of `buf`. Used by the client
    /// side and by tests; the server never decodes its own header type.
    pub fn decode(buf: &[u8]) -> Result<Self, crate::DecodeError> {
        if buf.len() < SERVER_HEADER_LEN {
            return Err(crate::DecodeError::Truncated);
        }

        let status_code = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let status_code =
            StatusCode::from_wire(status_code).ok_or(crate::DecodeError::Malformed)?;
        let method_index = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let message_length = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let request_id = u32::from_le_bytes(buf[12..16].try_into().unwrap());

        Ok(Self {
            status_code,
            method_index,
            message_length,
            request_id,
        })
    }
}

/// Writes a complete reply frame (header followed by payload) to `stream` in one `write_all`
/// call. `write_all` already retries on short writes; an OS-level write failure here is fatal to
/// the connection (§4.1).
pub fn write_reply<W: Write>(
    stream: &mut W,
    header: &ServerHeader,
    payload: &[u8],
) -> io::Result<()> {
    debug_assert_eq!(header.message_length as usize, payload.len());

    let mut buf = Vec::with_capacity(SERVER_HEADER_LEN + payload.len());
    let mut header_bytes = [0u8; SERVER_HEADER_LEN];
    header.encode(&mut header_bytes);
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(payload);

    stream.write_all(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_header_round_trips_via_manual_fields() {
        let mut raw = [0u8; CLIENT_HEADER_LEN];
        raw[0..4].copy_from_slice(&7u32.to_le_bytes());
        raw[4..8].copy_from_slice(&128u32.to_le_bytes());
        raw[8..12].copy_from_slice(&42u32.to_le_bytes());

        let header = ClientHeader::decode(&raw);
        assert_eq!(header.method_index, 7);
        assert_eq!(header.message_length, 128);
        assert_eq!(header.request_id, 42);
    }

    #[test]
    fn clamps_oversized_message_length() {
        let header = ClientHeader {
            method_index: 0,
            message_length: 1_000_000,
            request_id: 0,
        };
        assert_eq!(header.clamped_message_length(65536), 65536);
        assert_eq!(header.clamped_message_length(2_000_000), 1_000_000);
    }

    #[test]
    fn client_header_encode_decode_round_trip() {
        let header = ClientHeader {
            method_index: 2,
            message_length: 55,
            request_id: 1001,
        };
        let mut bytes = [0u8; CLIENT_HEADER_LEN];
        header.encode(&mut bytes);
        assert_eq!(ClientHeader::decode(&bytes), header);
    }

    #[test]
    fn server_header_encode_decode_round_trip() {
        let header = ServerHeader::success(3, 99, 10);
        let mut bytes = [0u8; SERVER_HEADER_LEN];
        header.encode(&mut bytes);

        let decoded = ServerHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn service_failed_header_has_zero_length() {
        let header = ServerHeader::service_failed(3, 99);
        assert_eq!(header.status_code, StatusCode::ServiceFailed);
        assert_eq!(header.message_length, 0);
    }

    #[test]
    fn write_reply_writes_header_then_payload() {
        let mut out = Vec::new();
        let header = ServerHeader::success(1, 2, 3);
        write_reply(&mut out, &header, &[9, 9, 9]).unwrap();

        assert_eq!(out.len(), SERVER_HEADER_LEN + 3);
        assert_eq!(&out[SERVER_HEADER_LEN..], &[9, 9, 9]);
    }
}
