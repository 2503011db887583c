//! Message routing.
//!
//! Interprets one complete line in the context of the connection that sent
//! it and decides where the resulting output goes:
//!
//! ```text
//! unregistered  <line>          -> line becomes the display name, no output
//! registered    <text>          -> "<name>: <text>\n" to every registered client
//! registered    @<to> <text>    -> "<name>: @<to> <text>\n" to <to> only
//! registered    @<to>           -> no space: treated as a broadcast
//! ```
//!
//! A whisper to a name nobody holds is dropped silently. Empty lines are
//! ignored in both states.

use crate::runtime::connection::{ConnId, ConnectionRegistry};
use bytes::Bytes;
use std::io;
use tracing::{debug, info};

/// Default maximum display-name length in bytes.
pub const DEFAULT_MAX_NAME_LEN: usize = 49;

/// Something a formatted message can be delivered through.
pub trait Outbound {
    /// Deliver the whole payload or fail. Undelivered bytes are not retried.
    fn deliver(&mut self, payload: &Bytes) -> io::Result<()>;
}

/// Outcome of routing a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Empty line, or a line from a connection that no longer exists.
    Ignored,
    /// The line set the sender's display name.
    Registered { name: String },
    /// Deliver to every registered connection, sender included.
    Broadcast { payload: Bytes },
    /// Deliver to one connection.
    Whisper { target: ConnId, payload: Bytes },
    /// Whisper target not found; nothing is sent.
    Dropped { target: String },
}

/// Line router. Holds only naming limits; all connection state lives in the
/// registry passed to each call.
#[derive(Debug, Clone, Copy)]
pub struct Router {
    max_name_len: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NAME_LEN)
    }
}

impl Router {
    pub fn new(max_name_len: usize) -> Self {
        Self { max_name_len }
    }

    /// Route a line and deliver the result.
    pub fn handle_line<T: Outbound>(
        &self,
        registry: &mut ConnectionRegistry<T>,
        from: ConnId,
        line: &[u8],
    ) -> Route {
        let route = self.route(registry, from, line);
        deliver(registry, &route);
        route
    }

    /// Decide what a line means without sending anything.
    ///
    /// Registration is applied to the registry here, since it has no output.
    pub fn route<T>(&self, registry: &mut ConnectionRegistry<T>, from: ConnId, line: &[u8]) -> Route {
        if line.is_empty() {
            return Route::Ignored;
        }

        let Some(conn) = registry.get(from) else {
            return Route::Ignored;
        };

        let text = String::from_utf8_lossy(line);

        let Some(sender) = conn.name() else {
            let name = truncate_name(text.trim(), self.max_name_len);
            if name.is_empty() {
                return Route::Ignored;
            }
            let peer = conn.peer;
            let name = name.to_string();
            registry.register(from, name.clone());
            info!(name = %name, peer = %peer, "client registered");
            return Route::Registered { name };
        };

        let payload = Bytes::from(format!("{sender}: {text}\n"));

        let Some(rest) = text.strip_prefix('@') else {
            return Route::Broadcast { payload };
        };

        // No space after the target: lenient, falls back to broadcast.
        let Some(space) = rest.find(' ') else {
            return Route::Broadcast { payload };
        };

        let target = truncate_name(&rest[..space], self.max_name_len);
        match registry.find_by_name(target) {
            Some(id) => Route::Whisper {
                target: id,
                payload,
            },
            None => {
                debug!(from = %sender, to = %target, "whisper target not found");
                Route::Dropped {
                    target: target.to_string(),
                }
            }
        }
    }
}

/// Send a routed message to its recipients.
///
/// A failed delivery is logged and skipped; it never stops delivery to the
/// remaining recipients. Returns the number of successful deliveries.
pub fn deliver<T: Outbound>(registry: &mut ConnectionRegistry<T>, route: &Route) -> usize {
    match route {
        Route::Broadcast { payload } => {
            let mut delivered = 0;
            registry.for_each_registered(|id, transport, name| {
                match transport.deliver(payload) {
                    Ok(()) => delivered += 1,
                    Err(e) => debug!(conn_id = id, name = %name, error = %e, "delivery abandoned"),
                }
            });
            delivered
        }
        Route::Whisper { target, payload } => {
            let Some(conn) = registry.get_mut(*target) else {
                return 0;
            };
            match conn.transport.deliver(payload) {
                Ok(()) => 1,
                Err(e) => {
                    debug!(conn_id = *target, error = %e, "delivery abandoned");
                    0
                }
            }
        }
        Route::Ignored | Route::Registered { .. } | Route::Dropped { .. } => 0,
    }
}

/// Cut a name down to `max` bytes without splitting a UTF-8 character.
fn truncate_name(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::LineBufferConfig;
    use std::net::SocketAddr;

    /// Captures everything delivered to one client.
    #[derive(Debug, Default)]
    struct Inbox {
        received: Vec<u8>,
        broken: bool,
    }

    impl Outbound for Inbox {
        fn deliver(&mut self, payload: &Bytes) -> io::Result<()> {
            if self.broken {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            self.received.extend_from_slice(payload);
            Ok(())
        }
    }

    struct Harness {
        registry: ConnectionRegistry<Inbox>,
        router: Router,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                registry: ConnectionRegistry::new(16, LineBufferConfig::default()),
                router: Router::default(),
            }
        }

        fn connect(&mut self) -> ConnId {
            let peer = SocketAddr::from(([127, 0, 0, 1], 40000 + self.registry.len() as u16));
            self.registry.allocate(Inbox::default(), peer).unwrap()
        }

        fn join(&mut self, name: &str) -> ConnId {
            let id = self.connect();
            self.send(id, name);
            id
        }

        fn send(&mut self, id: ConnId, line: &str) -> Route {
            self.router.handle_line(&mut self.registry, id, line.as_bytes())
        }

        fn inbox(&self, id: ConnId) -> String {
            String::from_utf8(self.registry.get(id).unwrap().transport.received.clone()).unwrap()
        }
    }

    #[test]
    fn test_first_line_registers_without_output() {
        let mut h = Harness::new();
        let a = h.connect();

        let route = h.send(a, "  alice \r");
        assert_eq!(
            route,
            Route::Registered {
                name: "alice".to_string()
            }
        );
        assert_eq!(h.registry.get(a).unwrap().name(), Some("alice"));
        assert_eq!(h.inbox(a), "");
    }

    #[test]
    fn test_name_never_changes() {
        let mut h = Harness::new();
        let a = h.join("alice");
        h.send(a, "bob");
        assert_eq!(h.registry.get(a).unwrap().name(), Some("alice"));
        assert_eq!(h.registry.find_by_name("bob"), None);
        assert_eq!(h.inbox(a), "alice: bob\n");
    }

    #[test]
    fn test_empty_lines_ignored() {
        let mut h = Harness::new();
        let a = h.connect();
        assert_eq!(h.send(a, ""), Route::Ignored);
        assert_eq!(h.send(a, "   "), Route::Ignored);
        assert!(!h.registry.get(a).unwrap().is_registered());

        h.send(a, "alice");
        assert_eq!(h.send(a, ""), Route::Ignored);
        assert_eq!(h.inbox(a), "");
    }

    #[test]
    fn test_name_truncated() {
        let mut h = Harness::new();
        let a = h.connect();
        let long = "x".repeat(80);
        h.send(a, &long);
        assert_eq!(h.registry.get(a).unwrap().name().unwrap().len(), 49);
    }

    #[test]
    fn test_name_truncated_on_char_boundary() {
        assert_eq!(truncate_name("ab\u{e9}", 3), "ab");
        assert_eq!(truncate_name("ab\u{e9}", 4), "ab\u{e9}");
        assert_eq!(truncate_name("abc", 49), "abc");
    }

    #[test]
    fn test_broadcast_reaches_everyone_including_sender() {
        let mut h = Harness::new();
        let a = h.join("alice");
        let b = h.join("bob");
        let lurker = h.connect();

        h.send(a, "hello");

        assert_eq!(h.inbox(a), "alice: hello\n");
        assert_eq!(h.inbox(b), "alice: hello\n");
        assert_eq!(h.inbox(lurker), "");
    }

    #[test]
    fn test_whisper_reaches_target_only() {
        let mut h = Harness::new();
        let a = h.join("alice");
        let b = h.join("bob");
        let c = h.join("carol");

        let route = h.send(a, "@bob hi");
        assert!(matches!(route, Route::Whisper { target, .. } if target == b));

        assert_eq!(h.inbox(a), "");
        assert_eq!(h.inbox(b), "alice: @bob hi\n");
        assert_eq!(h.inbox(c), "");
    }

    #[test]
    fn test_whisper_to_self() {
        let mut h = Harness::new();
        let a = h.join("alice");
        let b = h.join("bob");
        h.send(a, "@alice note to self");
        assert_eq!(h.inbox(a), "alice: @alice note to self\n");
        assert_eq!(h.inbox(b), "");
    }

    #[test]
    fn test_whisper_unknown_target_dropped() {
        let mut h = Harness::new();
        let a = h.join("alice");
        let b = h.join("bob");

        let route = h.send(a, "@Bob hi");
        assert_eq!(
            route,
            Route::Dropped {
                target: "Bob".to_string()
            }
        );
        assert_eq!(h.inbox(a), "");
        assert_eq!(h.inbox(b), "");
    }

    #[test]
    fn test_whisper_without_space_broadcasts() {
        let mut h = Harness::new();
        let a = h.join("alice");
        let b = h.join("bob");

        h.send(a, "@bob");
        assert_eq!(h.inbox(a), "alice: @bob\n");
        assert_eq!(h.inbox(b), "alice: @bob\n");
    }

    #[test]
    fn test_whisper_to_unregistered_connection_dropped() {
        let mut h = Harness::new();
        let a = h.join("alice");
        let lurker = h.connect();

        assert!(matches!(h.send(a, "@ hi"), Route::Dropped { .. }));
        assert_eq!(h.inbox(lurker), "");
    }

    #[test]
    fn test_failed_recipient_does_not_stop_broadcast() {
        let mut h = Harness::new();
        let a = h.join("alice");
        let b = h.join("bob");
        let c = h.join("carol");
        h.registry.get_mut(b).unwrap().transport.broken = true;

        let route = h.send(a, "still here");
        assert!(matches!(route, Route::Broadcast { .. }));
        assert_eq!(h.inbox(a), "alice: still here\n");
        assert_eq!(h.inbox(c), "alice: still here\n");
    }

    #[test]
    fn test_line_from_released_slot_ignored() {
        let mut h = Harness::new();
        let a = h.join("alice");
        h.registry.release(a);
        assert_eq!(h.send(a, "hello"), Route::Ignored);
    }
}
