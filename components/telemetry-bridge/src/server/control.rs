//! Control port: one text command per connection.
//!
//! The only recognised command is `shutdown` (any case, surrounding
//! whitespace ignored). It is acknowledged with `OK\n` before the shutdown
//! latch fires; anything else gets `UNKNOWN\n`. The connection is closed
//! after the reply either way.

// Local crates
use crate::helpers::shutdown::{Shutdown, ShutdownReason};
use crate::metrics::metrics::CONTROL_COMMANDS_TOTAL;

// External crates
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

/// Longest command line accepted; anything beyond is not read.
pub const MAX_COMMAND_LEN: usize = 1024;

/// Sent before the shutdown latch fires.
pub const REPLY_OK: &[u8] = b"OK\n";
/// Sent for anything other than `shutdown`.
pub const REPLY_UNKNOWN: &[u8] = b"UNKNOWN\n";

/// A parsed control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `shutdown`, in any case, surrounding whitespace ignored.
    Shutdown,
    /// Anything else, trimmed.
    Unknown(String),
}

impl ControlCommand {
    /// Interpret raw bytes received on the control port. Invalid UTF-8 is
    /// replaced rather than rejected, so it simply parses as unknown.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        if line.eq_ignore_ascii_case("shutdown") {
            Self::Shutdown
        } else {
            Self::Unknown(line.to_string())
        }
    }

    /// Bytes written back to the client.
    pub fn reply(&self) -> &'static [u8] {
        match self {
            Self::Shutdown => REPLY_OK,
            Self::Unknown(_) => REPLY_UNKNOWN,
        }
    }
}

/// Failures while serving one control connection. None of them affect the
/// bridge; they are logged and the connection is dropped.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Read timeout elapsed before any byte arrived.
    #[error("client sent nothing within {0:?}")]
    Timeout(Duration),
    /// EOF before any byte arrived.
    #[error("client closed the connection without sending a command")]
    Empty,
    /// Socket error while reading or replying.
    #[error("control connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accept control connections on `listener` until `cancel` fires.
#[instrument(
    name = "bridge_server::control",
    target = "server::control",
    skip_all,
    level = "debug"
)]
pub async fn serve_control(
    listener: TcpListener,
    shutdown: Shutdown,
    read_timeout: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(control_addr = %addr, "Control server listening (send 'SHUTDOWN')");
    }

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Control server stopped accepting connections");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        match handle_control_connection(stream, &shutdown, read_timeout).await {
                            Ok(command) => {
                                tracing::debug!(%peer, ?command, "Control command handled");
                            }
                            Err(e) => tracing::warn!(%peer, error = %e, "Control connection failed"),
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept control connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Serve exactly one command on `stream`, then close it.
pub async fn handle_control_connection(
    mut stream: TcpStream,
    shutdown: &Shutdown,
    read_timeout: Duration,
) -> Result<ControlCommand, ControlError> {
    let line = read_command_line(&mut stream, read_timeout).await?;
    let command = ControlCommand::parse(&line);
    CONTROL_COMMANDS_TOTAL.inc();

    // Reply first so the client sees the acknowledgement before teardown
    // starts closing sockets.
    stream.write_all(command.reply()).await?;
    stream.flush().await?;

    match &command {
        ControlCommand::Shutdown => {
            tracing::info!("Shutdown command received on control port");
            shutdown.trigger(ShutdownReason::ControlCommand);
        }
        ControlCommand::Unknown(text) => {
            tracing::info!(command = %text, "Unknown control command");
        }
    }

    let _ = stream.shutdown().await;
    Ok(command)
}

/// Read until a newline, EOF, `MAX_COMMAND_LEN` bytes, or the timeout.
///
/// A timeout after some bytes arrived returns what was received, so clients
/// that omit the newline are still answered.
async fn read_command_line(
    stream: &mut TcpStream,
    read_timeout: Duration,
) -> Result<Vec<u8>, ControlError> {
    let mut line = Vec::with_capacity(64);
    let mut buf = [0u8; MAX_COMMAND_LEN];
    let deadline = tokio::time::Instant::now() + read_timeout;

    while line.len() < MAX_COMMAND_LEN && !line.contains(&b'\n') {
        let remaining = MAX_COMMAND_LEN - line.len();
        match tokio::time::timeout_at(deadline, stream.read(&mut buf[..remaining])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => line.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if line.is_empty() => return Err(ControlError::Timeout(read_timeout)),
            Err(_) => break,
        }
    }

    if line.is_empty() {
        return Err(ControlError::Empty);
    }

    if let Some(pos) = line.iter().position(|&b| b == b'\n') {
        line.truncate(pos);
    }
    Ok(line)
}

/// Send `shutdown` to a running bridge and return its reply line.
#[instrument(
    name = "bridge_client::request_shutdown",
    target = "server::control",
    skip(timeout),
    level = "debug"
)]
pub async fn request_shutdown(addr: SocketAddr, timeout: Duration) -> Result<String, ControlError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(b"SHUTDOWN\n").await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        Ok::<_, ControlError>(String::from_utf8_lossy(&reply).trim().to_string())
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ControlError::Timeout(timeout))?
}
