//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read syscalls. Output is written
//! inline while routing each line, so a line is fully delivered before the
//! loop waits again.
//!
//! Each ready socket gets one bounded read per turn so a busy peer cannot
//! starve the others. mio readiness is edge-triggered, so a socket that was
//! read from is carried into the next turn and polled again without
//! blocking, until it reports `WouldBlock`.

use crate::config::Config;
use crate::runtime::connection::{ConnId, ConnectionRegistry};
use crate::runtime::router::{Outbound, Router};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Largest single read.
const READ_CHUNK: usize = 4096;

const EVENTS_CAPACITY: usize = 256;

impl Outbound for TcpStream {
    fn deliver(&mut self, payload: &Bytes) -> io::Result<()> {
        let sent = send_all(self, payload)?;
        if sent < payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {sent} of {} bytes", payload.len()),
            ));
        }
        Ok(())
    }
}

/// Write `buf` until it is fully sent or the writer stops making progress.
///
/// Retries on `Interrupted`. Gives up on `WouldBlock` or a zero-length write
/// and returns the bytes sent so far; any other error is returned. Nothing
/// is buffered for a later attempt.
pub fn send_all<W: Write>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match writer.write(&buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Single-threaded relay loop.
///
/// Owns the listener, the poller and the connection registry; nothing else
/// touches them.
pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    registry: ConnectionRegistry<TcpStream>,
    router: Router,
    scratch: Vec<u8>,
}

impl EventLoop {
    /// Set up the poller around an already bound, non-blocking listener.
    pub fn new(listener: std::net::TcpListener, config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(
            addr = %listener.local_addr()?,
            max_clients = config.max_clients,
            line_capacity = config.line_capacity,
            "Starting mio runtime"
        );

        Ok(Self {
            poll,
            listener,
            registry: ConnectionRegistry::new(config.max_clients, config.line_buffer()),
            router: Router::new(config.max_name_len),
            scratch: vec![0u8; READ_CHUNK],
        })
    }

    /// Run forever. Only a poller failure ends the loop.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut ready: Vec<ConnId> = Vec::with_capacity(EVENTS_CAPACITY);
        // Sockets that may still hold unread bytes.
        let mut carry: Vec<ConnId> = Vec::new();

        loop {
            let timeout = if carry.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let mut accept = false;
            ready.clear();
            ready.append(&mut carry);
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => accept = true,
                    Token(conn_id) => ready.push(conn_id),
                }
            }

            if accept {
                self.accept_connections();
            }

            // Ascending slot order keeps dispatch deterministic.
            ready.sort_unstable();
            ready.dedup();
            for &conn_id in &ready {
                match self.handle_readable(conn_id) {
                    Ok(true) => carry.push(conn_id),
                    Ok(false) => {}
                    Err(e) => {
                        debug!(conn_id, error = %e, "Connection error");
                        self.close_connection(conn_id);
                    }
                }
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match self.registry.allocate(stream, peer) {
                    Ok(conn_id) => {
                        let Some(conn) = self.registry.get_mut(conn_id) else {
                            continue;
                        };
                        if let Err(e) = self.poll.registry().register(
                            &mut conn.transport,
                            Token(conn_id),
                            Interest::READABLE,
                        ) {
                            error!(peer = %peer, error = %e, "Failed to register connection");
                            self.registry.release(conn_id);
                            continue;
                        }
                        debug!(conn_id, peer = %peer, "Accepted connection");
                    }
                    Err(e) => {
                        // The stream was dropped by the registry, closing it.
                        warn!(peer = %peer, error = %e, "Rejecting connection");
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Do one bounded read on a connection and route the complete lines.
    ///
    /// Returns `Ok(true)` if the socket may still hold data and must be
    /// read again next turn. An `Err` means the connection must be closed.
    fn handle_readable(&mut self, conn_id: ConnId) -> io::Result<bool> {
        let Some(conn) = self.registry.get_mut(conn_id) else {
            return Ok(false);
        };

        let n = loop {
            match conn.transport.read(&mut self.scratch) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "EOF"));
                }
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        conn.buffer.append(&self.scratch[..n]);
        let lines: Vec<Bytes> = conn.buffer.drain_lines().collect();
        let overflowed = conn.buffer.is_overflowed();

        for line in lines {
            self.router.handle_line(&mut self.registry, conn_id, &line);
        }

        if overflowed {
            warn!(conn_id, "Line exceeds buffer capacity, closing connection");
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
        Ok(true)
    }

    fn close_connection(&mut self, conn_id: ConnId) {
        if let Some(mut conn) = self.registry.release(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.transport);
            match conn.name() {
                Some(name) => info!(name = %name, "client disconnected"),
                None => debug!(conn_id, peer = %conn.peer, "Unregistered connection closed"),
            }
            // Dropping the stream closes the socket.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::OverflowPolicy;
    use crate::runtime::testing::{bind, test_config, Client};
    use std::net::SocketAddr;
    use std::thread;

    fn spawn_server(config: Config) -> SocketAddr {
        let (listener, addr) = bind();
        let mut event_loop = EventLoop::new(listener, &config).unwrap();
        thread::spawn(move || event_loop.run());
        addr
    }

    #[test]
    fn test_send_all_writes_everything() {
        let mut out = Vec::new();
        assert_eq!(send_all(&mut out, b"alice: hello\n").unwrap(), 13);
        assert_eq!(out, b"alice: hello\n");
    }

    #[test]
    fn test_send_all_stops_on_zero_progress() {
        let mut slot = [0u8; 4];
        let mut writer = &mut slot[..];
        assert_eq!(send_all(&mut writer, b"alice: hello\n").unwrap(), 4);
        assert_eq!(&slot, b"alic");
    }

    #[test]
    fn test_broadcast_and_whisper() {
        let addr = spawn_server(test_config(16));
        let mut alice = Client::join(addr, "alice");
        let mut bob = Client::join(addr, "bob");

        alice.send("hello\n");
        assert_eq!(alice.line(), "alice: hello\n");
        assert_eq!(bob.line(), "alice: hello\n");

        alice.send("@bob hi\n");
        assert_eq!(bob.line(), "alice: @bob hi\n");
        alice.assert_silent();
    }

    #[test]
    fn test_whisper_hidden_from_third_party() {
        let addr = spawn_server(test_config(16));
        let mut alice = Client::join(addr, "Alice");
        let mut bob = Client::join(addr, "Bob");
        let mut charlie = Client::join(addr, "Charlie");

        alice.send("@Bob Secret\n");
        assert_eq!(bob.line(), "Alice: @Bob Secret\n");
        charlie.assert_silent();

        alice.send("@Nobody hello\n");
        alice.send("@Bob");
        alice.send("\n");
        assert_eq!(bob.line(), "Alice: @Bob\n");
        assert_eq!(charlie.line(), "Alice: @Bob\n");
        assert_eq!(alice.line(), "Alice: @Bob\n");
    }

    #[test]
    fn test_fragmented_and_fused_lines() {
        let addr = spawn_server(test_config(16));
        let mut bob = Client::join(addr, "bob");
        let mut alice = Client::connect(addr);

        alice.send("ali");
        thread::sleep(std::time::Duration::from_millis(50));
        alice.send("ce\r\n");
        alice.send("Line1\nLine2\n");

        assert_eq!(bob.line(), "alice: Line1\n");
        assert_eq!(bob.line(), "alice: Line2\n");
        assert_eq!(alice.line(), "alice: Line1\n");
        assert_eq!(alice.line(), "alice: Line2\n");
    }

    #[test]
    fn test_burst_larger_than_one_read_fully_relayed() {
        let addr = spawn_server(test_config(16));
        let mut bob = Client::join(addr, "bob");
        let mut alice = Client::join(addr, "alice");

        let burst: String = (0..1000).map(|i| format!("m{i}\n")).collect();
        assert!(burst.len() > READ_CHUNK);
        alice.send(&burst);

        for i in 0..1000 {
            assert_eq!(bob.line(), format!("alice: m{i}\n"));
        }
    }

    #[test]
    fn test_concurrent_senders_all_delivered() {
        let addr = spawn_server(test_config(16));
        let mut alice = Client::join(addr, "alice");
        let mut bob = Client::join(addr, "bob");
        let mut carol = Client::join(addr, "carol");

        let burst: String = (0..1000).map(|i| format!("@carol m{i}\n")).collect();
        alice.send(&burst);
        bob.send("@carol ping\n");

        let mut seen_ping = false;
        for _ in 0..1001 {
            if carol.line() == "bob: @carol ping\n" {
                seen_ping = true;
            }
        }
        assert!(seen_ping);
        carol.assert_silent();
    }

    #[test]
    fn test_seventeenth_client_rejected() {
        let addr = spawn_server(test_config(16));
        let mut clients: Vec<Client> = (0..16)
            .map(|i| Client::join(addr, &format!("user{i}")))
            .collect();

        let mut extra = Client::connect(addr);
        extra.assert_closed();

        clients[0].send("still sixteen\n");
        for client in &mut clients {
            assert_eq!(client.line(), "user0: still sixteen\n");
        }
    }

    #[test]
    fn test_disconnect_frees_slot() {
        let addr = spawn_server(test_config(1));
        let alice = Client::join(addr, "alice");
        drop(alice);

        // The slot frees once the server sees the close; until then a new
        // client is rejected.
        let mut bob = None;
        for _ in 0..20 {
            let mut client = Client::connect(addr);
            if client.try_send("bob\n@bob sync\n").is_ok()
                && client.try_line().ok().as_deref() == Some("bob: @bob sync\n")
            {
                bob = Some(client);
                break;
            }
            thread::sleep(std::time::Duration::from_millis(50));
        }

        let mut bob = bob.expect("slot never released");
        bob.send("hi\n");
        assert_eq!(bob.line(), "bob: hi\n");
    }

    #[test]
    fn test_disconnect_policy_closes_long_line() {
        let config = Config {
            line_capacity: 16,
            overflow: OverflowPolicy::Disconnect,
            ..test_config(4)
        };
        let addr = spawn_server(config);
        let mut alice = Client::join(addr, "alice");
        alice.send(&"x".repeat(64));
        alice.assert_closed();
    }

    #[test]
    fn test_truncate_policy_shortens_long_line() {
        let config = Config {
            line_capacity: 16,
            ..test_config(4)
        };
        let addr = spawn_server(config);
        let mut alice = Client::join(addr, "al");
        alice.send(&format!("{}\n", "y".repeat(40)));
        alice.send("after\n");
        assert_eq!(alice.line(), format!("al: {}\n", "y".repeat(15)));
        assert_eq!(alice.line(), "al: after\n");
    }
}
