//! relay-client: interactive terminal client for chat-relay.
//!
//! Sends the display name as soon as it connects, then relays each line
//! typed on stdin to the server and prints everything the server sends.
//! Typing `!exit` disconnects without sending the line.

use clap::Parser;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Local command that ends the session.
const EXIT_COMMAND: &str = "!exit";

#[derive(Parser, Debug)]
#[command(name = "relay-client")]
#[command(version = "0.1.0")]
#[command(about = "Terminal client for chat-relay", long_about = None)]
struct Args {
    /// Server host name or address
    host: String,

    /// Server port
    port: u16,

    /// Display name to register with
    name: String,
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The user typed `!exit`.
    Requested,
    /// Stdin reached end of file.
    InputClosed,
    /// The server closed the connection.
    ServerClosed,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let stream = TcpStream::connect((args.host.as_str(), args.port)).await?;
    info!(host = %args.host, port = args.port, name = %args.name, "Connected");

    let (server_rx, server_tx) = stream.into_split();
    let exit = relay(
        tokio::io::stdin(),
        tokio::io::stdout(),
        server_rx,
        server_tx,
        &args.name,
    )
    .await?;

    if exit == Exit::Requested {
        eprintln!("client exiting");
    }
    debug!(?exit, "Session ended");
    Ok(())
}

/// Run one session: register, then shuttle lines both ways until one side
/// is done.
async fn relay<I, O, R, W>(
    input: I,
    mut output: O,
    mut server_rx: R,
    mut server_tx: W,
    name: &str,
) -> io::Result<Exit>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    server_tx.write_all(format!("{name}\n").as_bytes()).await?;

    let mut lines = BufReader::new(input).lines();
    let mut buf = vec![0u8; 1024];

    loop {
        tokio::select! {
            n = server_rx.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    return Ok(Exit::ServerClosed);
                }
                output.write_all(&buf[..n]).await?;
                output.flush().await?;
            }
            line = lines.next_line() => match line? {
                None => {
                    let _ = server_tx.shutdown().await;
                    return Ok(Exit::InputClosed);
                }
                Some(line) if line.trim_end() == EXIT_COMMAND => {
                    let _ = server_tx.shutdown().await;
                    return Ok(Exit::Requested);
                }
                Some(line) => {
                    server_tx.write_all(format!("{line}\n").as_bytes()).await?;
                }
            },
        }
    }
}
