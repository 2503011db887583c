//! Coordinator task and its per-connection helpers.

use crate::config::Config;
use crate::runtime::connection::{ConnId, ConnectionRegistry};
use crate::runtime::router::{Outbound, Router};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest single read.
const READ_CHUNK: usize = 4096;

/// Messages queued for one connection's writer. Deliveries beyond this are
/// abandoned.
const OUTBOX_CAPACITY: usize = 64;

/// Reader events waiting for the coordinator. Readers wait when it is full.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Sent by reader tasks to the coordinator.
#[derive(Debug)]
enum Event {
    /// Bytes received from the peer.
    Data {
        id: ConnId,
        session: u64,
        chunk: Bytes,
    },
    /// Peer closed the stream or a read failed.
    Closed { id: ConnId, session: u64 },
}

/// Coordinator-side handle to a connection's tasks.
///
/// Slot ids are reused, so every connection also gets a unique session
/// number; events carrying a stale session are ignored.
#[derive(Debug)]
struct Mailbox {
    session: u64,
    outbox: mpsc::Sender<Bytes>,
    reader: Option<JoinHandle<()>>,
}

impl Mailbox {
    fn new(session: u64, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbox, inbox) = mpsc::channel(capacity);
        let mailbox = Self {
            session,
            outbox,
            reader: None,
        };
        (mailbox, inbox)
    }
}

impl Outbound for Mailbox {
    fn deliver(&mut self, payload: &Bytes) -> io::Result<()> {
        self.outbox.try_send(payload.clone()).map_err(|e| match e {
            TrySendError::Full(_) => io::Error::new(io::ErrorKind::WouldBlock, "outbox full"),
            TrySendError::Closed(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, "writer task gone")
            }
        })
    }
}

/// Owner of all connection state in the actor runtime.
pub struct Coordinator {
    registry: ConnectionRegistry<Mailbox>,
    router: Router,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    next_session: u64,
}

impl Coordinator {
    pub fn new(config: &Config) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            registry: ConnectionRegistry::new(config.max_clients, config.line_buffer()),
            router: Router::new(config.max_name_len),
            events_tx,
            events_rx,
            next_session: 0,
        }
    }

    /// Accept connections and process reader events forever.
    ///
    /// Accept errors are logged and skipped; only a failure to query the
    /// listener's address ends the task.
    pub async fn run(mut self, listener: TcpListener) -> io::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            max_clients = self.registry.capacity(),
            "Starting actor runtime"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => error!("Accept error: {}", e),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let session = self.next_session;
        self.next_session += 1;

        let (mailbox, inbox) = Mailbox::new(session, OUTBOX_CAPACITY);

        let id = match self.registry.allocate(mailbox, peer) {
            Ok(id) => id,
            Err(e) => {
                // Dropping the stream closes it.
                warn!(peer = %peer, error = %e, "Rejecting connection");
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(write_loop(write_half, inbox));
        let reader = tokio::spawn(read_loop(read_half, id, session, self.events_tx.clone()));

        if let Some(conn) = self.registry.get_mut(id) {
            conn.transport.reader = Some(reader);
        }
        debug!(conn_id = id, peer = %peer, "Accepted connection");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Data { id, session, chunk } => self.handle_data(id, session, &chunk),
            Event::Closed { id, session } => {
                if self.is_current(id, session) {
                    self.close_connection(id);
                }
            }
        }
    }

    fn handle_data(&mut self, id: ConnId, session: u64, chunk: &[u8]) {
        if !self.is_current(id, session) {
            return;
        }
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };

        conn.buffer.append(chunk);
        let lines: Vec<Bytes> = conn.buffer.drain_lines().collect();
        let overflowed = conn.buffer.is_overflowed();

        for line in lines {
            self.router.handle_line(&mut self.registry, id, &line);
        }

        if overflowed {
            warn!(conn_id = id, "Line exceeds buffer capacity, closing connection");
            self.close_connection(id);
        }
    }

    fn is_current(&self, id: ConnId, session: u64) -> bool {
        self.registry
            .get(id)
            .is_some_and(|conn| conn.transport.session == session)
    }

    fn close_connection(&mut self, id: ConnId) {
        if let Some(conn) = self.registry.release(id) {
            // Stop reading. Dropping the mailbox ends the writer task, which
            // shuts the stream down.
            if let Some(reader) = &conn.transport.reader {
                reader.abort();
            }
            match conn.name() {
                Some(name) => info!(name = %name, "client disconnected"),
                None => debug!(conn_id = id, peer = %conn.peer, "Unregistered connection closed"),
            }
        }
    }
}

/// Forward everything the peer sends to the coordinator, then report the close.
async fn read_loop(
    mut reader: OwnedReadHalf,
    id: ConnId,
    session: u64,
    events: mpsc::Sender<Event>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = buf.split().freeze();
                if events.send(Event::Data { id, session, chunk }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(conn_id = id, error = %e, "Read error");
                break;
            }
        }
    }

    let _ = events.send(Event::Closed { id, session }).await;
}

/// Write queued payloads in order until the coordinator drops the sender.
async fn write_loop(mut writer: OwnedWriteHalf, mut inbox: mpsc::Receiver<Bytes>) {
    while let Some(payload) = inbox.recv().await {
        if let Err(e) = writer.write_all(&payload).await {
            debug!(error = %e, "delivery abandoned");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
