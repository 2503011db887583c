//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! Everything runs on the calling thread.

mod event_loop;

pub use event_loop::EventLoop;

use crate::config::Config;

/// Run the server using the mio backend until a fatal error occurs.
pub fn run(listener: std::net::TcpListener, config: &Config) -> std::io::Result<()> {
    EventLoop::new(listener, config)?.run()
}
