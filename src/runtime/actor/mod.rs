//! Task-per-connection runtime on tokio.
//!
//! One coordinator task owns the connection registry and is the only code
//! that mutates it. Every accepted stream gets two helper tasks:
//!
//! ```text
//!   reader task --Event::Data/Closed--> coordinator --Bytes--> writer task
//! ```
//!
//! Readers forward raw chunks; framing and routing happen in the
//! coordinator, so the observable protocol is identical to the mio loop.
//! Runs on a current-thread runtime.

mod coordinator;

pub use coordinator::Coordinator;

use crate::config::Config;
use std::io;
use tokio::net::TcpListener;

/// Run the server on a fresh current-thread tokio runtime.
pub fn run(listener: std::net::TcpListener, config: &Config) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let listener = TcpListener::from_std(listener)?;
        serve(listener, config).await
    })
}

/// Accept and relay forever on an existing tokio listener.
pub async fn serve(listener: TcpListener, config: &Config) -> io::Result<()> {
    Coordinator::new(config).run(listener).await
}
