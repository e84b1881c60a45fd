//! Upstream notification source.
//!
//! The source is the one external producer in the system: it pushes raw
//! byte chunks with no alignment to frame boundaries. The bridge only needs
//! it to start and stop notifications and to disconnect; discovery and
//! pairing live outside this crate.
//!
//! ```text
//! NotificationSource -> mpsc<Bytes> -> decode pump -> Broadcaster -> sinks
//! ```

// Local crates
use crate::helpers::load_config::{SourceConfig, SourceKind};
use crate::source::{simulated::SimulatedSource, tcp::TcpSource};

// External crates
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::instrument;

/// Capacity of the chunk channel between a source and the decode pump.
pub const CHUNK_CHANNEL_CAPACITY: usize = 256;

/// Source error handling
/// - Startup variants (`NotConfigured`, `NotFound`, `ConnectFailed`,
///   `ConnectTimeout`) put the bridge in degraded mode instead of failing.
/// - Runtime variants are logged by the shutdown coordinator and never abort
///   teardown.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// `kind = "none"`, or a kind missing its address.
    #[error("no upstream source configured")]
    NotConfigured,
    /// The upstream address could not be resolved or reached.
    #[error("upstream source {target} not found")]
    NotFound { target: String },
    /// The upstream refused or reset the connection.
    #[error("failed to connect to upstream source {target}: {source}")]
    ConnectFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },
    /// No link within the connect timeout.
    #[error("timed out after {timeout:?} connecting to upstream source {target}")]
    ConnectTimeout { target: String, timeout: Duration },
    /// Operation needs a live link.
    #[error("upstream source is not connected")]
    NotConnected,
    /// `start_notify` called twice.
    #[error("notifications already started")]
    AlreadyNotifying,
    /// I/O on an established link.
    #[error("upstream source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Asynchronous producer of raw notification chunks.
#[async_trait]
pub trait NotificationSource: Send + fmt::Debug {
    /// Human readable identity for logs.
    fn describe(&self) -> String;

    /// Whether the upstream link is currently up.
    fn is_connected(&self) -> bool;

    /// Subscribe to notifications. Chunks arrive on the returned channel in
    /// the order the upstream delivered them; the channel closes when the
    /// source stops or the link drops.
    async fn start_notify(&mut self) -> Result<mpsc::Receiver<Bytes>, SourceError>;

    /// Stop an active subscription. Stopping an inactive one is a no-op.
    async fn stop_notify(&mut self) -> Result<(), SourceError>;

    /// Request disconnect from the upstream device.
    async fn disconnect(&mut self) -> Result<(), SourceError>;
}

/// Open the configured upstream source.
#[instrument(
    name = "bridge_source::connect",
    target = "source::source",
    skip_all,
    level = "debug"
)]
pub async fn connect(config: &SourceConfig) -> Result<Box<dyn NotificationSource>, SourceError> {
    match config.kind {
        SourceKind::None => Err(SourceError::NotConfigured),
        SourceKind::Tcp => {
            let addr = config.addr.as_deref().ok_or(SourceError::NotConfigured)?;
            tracing::info!(upstream = %addr, "Connecting to TCP upstream source");
            let source =
                TcpSource::connect(addr, config.connect_timeout(), config.read_chunk_size).await?;
            Ok(Box::new(source))
        }
        SourceKind::Simulated => {
            tracing::info!(rate_hz = config.rate_hz, "Using simulated upstream source");
            Ok(Box::new(SimulatedSource::new(config.rate_hz)))
        }
    }
}
