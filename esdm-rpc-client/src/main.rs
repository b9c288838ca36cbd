// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! `esdm-rpc-client`: a small interactive client exercising the RPC service plane by hand, in the
//! spirit of the retrieved suite's `rpcinfo` binary — it drives the wire protocol directly rather
//! than wrapping it behind a library a real application would link against.

use std::io;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::error;

use esdm_rpc_protocol::client;
use esdm_rpc_protocol::frame::StatusCode;
use esdm_rpc_protocol::messages::{
    EmptyRequest, GetRandomBytesFullRequest, GetRandomRequest, GetRandomResponse, Message,
    RngStatus, StatusResponse,
};
use esdm_rpc_protocol::service::{priv_method, unpriv_method};

#[derive(Parser)]
#[command(name = "esdm-rpc-client", about = "Exercise the ESDM RPC service plane by hand")]
struct Cli {
    /// Path of the unprivileged (world rw) socket. Defaults to the built-in path used by
    /// `esdm-rpcd` if not given.
    #[arg(long)]
    unpriv_socket: Option<PathBuf>,

    /// Path of the privileged (owner rw) socket. Defaults to the built-in path used by
    /// `esdm-rpcd` if not given.
    #[arg(long)]
    priv_socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// GetRandom on the unprivileged endpoint: `count` bytes, no minimum-entropy guarantee.
    GetRandom { count: u32 },
    /// Status on the unprivileged endpoint.
    Status,
    /// GetRandomBytesFull on the privileged endpoint: `count` bytes from the fully-seeded DRNG.
    /// Requires the caller to be uid 0 and able to open the 0600 socket.
    GetRandomBytesFull { count: u32 },
    /// RngReseed on the privileged endpoint.
    RngReseed,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let unpriv_socket = cli
        .unpriv_socket
        .unwrap_or_else(|| PathBuf::from(esdm_config::DEFAULT_UNPRIV_SOCKET));
    let priv_socket = cli
        .priv_socket
        .unwrap_or_else(|| PathBuf::from(esdm_config::DEFAULT_PRIV_SOCKET));

    let result = match &cli.command {
        Command::GetRandom { count } => get_random(&unpriv_socket, *count),
        Command::Status => status(&unpriv_socket),
        Command::GetRandomBytesFull { count } => get_random_bytes_full(&priv_socket, *count),
        Command::RngReseed => rng_reseed(&priv_socket),
    };

    if let Err(e) = result {
        error!("request failed: {e}");
        std::process::exit(1);
    }
}

fn get_random(socket: &PathBuf, count: u32) -> io::Result<()> {
    let mut stream = UnixStream::connect(socket)?;

    let req = GetRandomRequest { count };
    let mut payload = Vec::new();
    req.encode_into(&mut payload);

    let reply = client::call(&mut stream, unpriv_method::GET_RANDOM, &payload)
        .map_err(to_io_error)?;

    if reply.status != StatusCode::Success {
        println!("server reported SERVICE_FAILED");
        return Ok(());
    }

    let mut arena = esdm_rpc_protocol::arena::Arena::with_capacity(reply.payload.len() + 64);
    let resp = GetRandomResponse::decode_in(&mut arena, &reply.payload).map_err(to_io_error)?;
    println!("{}", hex_encode(&resp.bytes));
    Ok(())
}

fn status(socket: &PathBuf) -> io::Result<()> {
    let mut stream = UnixStream::connect(socket)?;

    let req = EmptyRequest;
    let mut payload = Vec::new();
    req.encode_into(&mut payload);

    let reply =
        client::call(&mut stream, unpriv_method::STATUS, &payload).map_err(to_io_error)?;

    if reply.status != StatusCode::Success {
        println!("server reported SERVICE_FAILED");
        return Ok(());
    }

    let mut arena = esdm_rpc_protocol::arena::Arena::with_capacity(reply.payload.len() + 64);
    let resp = StatusResponse::decode_in(&mut arena, &reply.payload).map_err(to_io_error)?;
    let status = match resp.status {
        RngStatus::FullySeeded => "fully-seeded",
        RngStatus::Seeding => "seeding",
    };
    println!("status={status} bytes_served={}", resp.bytes_served);
    Ok(())
}

fn get_random_bytes_full(socket: &PathBuf, count: u32) -> io::Result<()> {
    let mut stream = UnixStream::connect(socket)?;

    let req = GetRandomBytesFullRequest { count };
    let mut payload = Vec::new();
    req.encode_into(&mut payload);

    let reply = client::call(&mut stream, priv_method::GET_RANDOM_BYTES_FULL, &payload)
        .map_err(to_io_error)?;

    if reply.status != StatusCode::Success {
        println!("server reported SERVICE_FAILED (not privileged, or not yet fully seeded)");
        return Ok(());
    }

    let mut arena = esdm_rpc_protocol::arena::Arena::with_capacity(reply.payload.len() + 64);
    let resp = GetRandomResponse::decode_in(&mut arena, &reply.payload).map_err(to_io_error)?;
    println!("{}", hex_encode(&resp.bytes));
    Ok(())
}

fn rng_reseed(socket: &PathBuf) -> io::Result<()> {
    let mut stream = UnixStream::connect(socket)?;

    let req = EmptyRequest;
    let mut payload = Vec::new();
    req.encode_into(&mut payload);

    let reply =
        client::call(&mut stream, priv_method::RNG_RESEED, &payload).map_err(to_io_error)?;

    match reply.status {
        StatusCode::Success => println!("reseeded"),
        StatusCode::ServiceFailed => println!("server reported SERVICE_FAILED (not privileged?)"),
    }
    Ok(())
}

fn to_io_error(e: esdm_rpc_protocol::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
