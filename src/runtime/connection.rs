//! Connection state and the connection registry.
//!
//! Each connection tracks its display name, peer address, and framing
//! buffer alongside whatever transport the runtime writes through
//! (a `mio` stream, or a channel to a writer task).

use crate::runtime::buffer::{LineBuffer, LineBufferConfig};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

/// Slot identifier. Doubles as the readiness token in the mio runtime.
pub type ConnId = usize;

/// Naming state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    /// No display name yet; the next non-empty line becomes one.
    Unregistered,
    /// Display name set. Never changes afterwards.
    Registered { name: String },
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<T> {
    /// Where outbound bytes for this client go.
    pub transport: T,
    /// Peer address, informational only.
    pub peer: SocketAddr,
    pub state: ConnState,
    /// Reassembles lines from the inbound byte stream.
    pub buffer: LineBuffer,
}

impl<T> Connection<T> {
    /// Create a new connection in the unregistered state.
    pub fn new(transport: T, peer: SocketAddr, buffer: LineBuffer) -> Self {
        Self {
            transport,
            peer,
            state: ConnState::Unregistered,
            buffer,
        }
    }

    /// Display name, if registered.
    pub fn name(&self) -> Option<&str> {
        match &self.state {
            ConnState::Registered { name } => Some(name),
            ConnState::Unregistered => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.state, ConnState::Registered { .. })
    }
}

/// Registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// Every slot is occupied.
    Full,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Full => write!(f, "connection registry is full"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Fixed-size table of active connections.
///
/// Slot ids are stable for the lifetime of a connection. A new connection
/// always takes the lowest free slot, and iteration is in slot order. A
/// secondary index maps display names to slots.
pub struct ConnectionRegistry<T> {
    slots: Vec<Option<Connection<T>>>,
    /// Vacant slot ids, lowest first.
    free: BTreeSet<ConnId>,
    /// Name -> slots holding it. Duplicates are allowed; lookups pick the
    /// lowest slot.
    names: HashMap<String, BTreeSet<ConnId>>,
    buffer_config: LineBufferConfig,
}

impl<T> ConnectionRegistry<T> {
    /// Create a registry holding at most `max_connections` connections.
    pub fn new(max_connections: usize, buffer_config: LineBufferConfig) -> Self {
        Self {
            slots: (0..max_connections).map(|_| None).collect(),
            free: (0..max_connections).collect(),
            names: HashMap::with_capacity(max_connections),
            buffer_config,
        }
    }

    /// Reserve the lowest free slot for a freshly accepted connection.
    ///
    /// Fails with `RegistryError::Full` when every slot is taken. The
    /// transport is dropped in that case, which closes a socket.
    pub fn allocate(&mut self, transport: T, peer: SocketAddr) -> Result<ConnId, RegistryError> {
        let id = self.free.pop_first().ok_or(RegistryError::Full)?;
        let buffer = LineBuffer::new(self.buffer_config);
        self.slots[id] = Some(Connection::new(transport, peer, buffer));
        Ok(id)
    }

    /// Free a slot, returning the connection that held it.
    ///
    /// Releasing a free slot is a no-op. The transport is handed back to the
    /// caller, who is responsible for closing it.
    pub fn release(&mut self, id: ConnId) -> Option<Connection<T>> {
        let conn = self.slots.get_mut(id)?.take()?;
        self.free.insert(id);
        if let ConnState::Registered { name } = &conn.state {
            if let Some(slots) = self.names.get_mut(name) {
                slots.remove(&id);
                if slots.is_empty() {
                    self.names.remove(name);
                }
            }
        }
        Some(conn)
    }

    /// Give an unregistered connection its display name.
    ///
    /// Returns `false` if the slot is free or already registered; names are
    /// never reassigned.
    pub fn register(&mut self, id: ConnId, name: String) -> bool {
        let Some(conn) = self.slots.get_mut(id).and_then(Option::as_mut) else {
            return false;
        };
        if conn.is_registered() || name.is_empty() {
            return false;
        }
        self.names.entry(name.clone()).or_default().insert(id);
        conn.state = ConnState::Registered { name };
        true
    }

    /// Find the registered connection with exactly this name.
    ///
    /// Case-sensitive. With duplicate names, the lowest slot wins.
    pub fn find_by_name(&self, name: &str) -> Option<ConnId> {
        self.names
            .get(name)
            .and_then(|slots| slots.iter().next().copied())
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: ConnId) -> Option<&Connection<T>> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<T>> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// Visit every registered connection in slot order.
    pub fn for_each_registered<F>(&mut self, mut visitor: F)
    where
        F: FnMut(ConnId, &mut T, &str),
    {
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if let Some(Connection {
                transport,
                state: ConnState::Registered { name },
                ..
            }) = slot
            {
                visitor(id, transport, name);
            }
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
