//! Relay server core.
//!
//! Two interchangeable runtimes share the same building blocks:
//! - `mio`: single-threaded readiness loop (epoll on Linux, kqueue on macOS)
//! - `actor`: one coordinating tokio task that owns all connection state,
//!   fed by per-connection reader tasks
//!
//! Shared abstractions:
//! - `LineBuffer`: per-connection line framing
//! - `ConnectionRegistry`: slot table with name lookup
//! - `Router`: registration, broadcast and whisper decisions

pub mod actor;
pub mod buffer;
pub mod connection;
pub mod mio;
pub mod router;

use crate::config::{Config, RuntimeType};
use std::io;
use std::net::SocketAddr;

/// Run the server with the configured runtime.
pub fn run(config: Config) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let listener = create_listener(addr, config.backlog)?;

    match config.runtime {
        RuntimeType::Mio => mio::run(listener, &config),
        RuntimeType::Actor => actor::run(listener, &config),
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR set.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
