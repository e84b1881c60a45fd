// Local crates
use crate::source::async_read::StopOnCancelExt;
use crate::source::source::{CHUNK_CHANNEL_CAPACITY, NotificationSource, SourceError};

// External crates
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Upstream that delivers raw frame bytes over a TCP stream, e.g. a radio
/// relay or a serial-to-TCP bridge in front of the sensor board.
///
/// The read half is moved into a reader task on `start_notify`; the write
/// half stays here so `disconnect` can close the link.
#[derive(Debug)]
pub struct TcpSource {
    target: String,
    chunk_size: usize,
    read_half: Option<OwnedReadHalf>,
    write_half: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
    stop: CancellationToken,
    connected: Arc<AtomicBool>,
}

impl TcpSource {
    /// Connect to `target`, giving up after `timeout`.
    /// Open a TCP link to `target`, giving up after `timeout`.
    #[instrument(
        name = "bridge_source::tcp::connect",
        target = "source::tcp",
        skip(timeout, chunk_size),
        level = "debug"
    )]
    pub async fn connect(
        target: &str,
        timeout: Duration,
        chunk_size: usize,
    ) -> Result<Self, SourceError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::AddrNotAvailable) => {
                return Err(SourceError::NotFound {
                    target: target.to_string(),
                });
            }
            Ok(Err(e)) => {
                return Err(SourceError::ConnectFailed {
                    target: target.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                return Err(SourceError::ConnectTimeout {
                    target: target.to_string(),
                    timeout,
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on upstream stream");
        }

        let (read_half, write_half) = stream.into_split();
        tracing::info!(upstream = %target, "Connected to TCP upstream source");

        Ok(Self {
            target: target.to_string(),
            chunk_size: chunk_size.max(1),
            read_half: Some(read_half),
            write_half: Some(write_half),
            reader: None,
            stop: CancellationToken::new(),
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn join_reader(&mut self) {
        if let Some(handle) = self.reader.take() {
            self.stop.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Upstream reader task ended abnormally");
            }
        }
    }
}

#[async_trait]
impl NotificationSource for TcpSource {
    fn describe(&self) -> String {
        format!("tcp://{}", self.target)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_notify(&mut self) -> Result<mpsc::Receiver<Bytes>, SourceError> {
        if self.reader.is_some() {
            return Err(SourceError::AlreadyNotifying);
        }
        let read_half = self.read_half.take().ok_or(SourceError::NotConnected)?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        self.stop = CancellationToken::new();

        let handle = tokio::spawn(read_chunks(
            read_half,
            self.chunk_size,
            tx,
            self.stop.clone(),
            self.connected.clone(),
        ));
        self.reader = Some(handle);

        tracing::debug!(upstream = %self.target, "Upstream notifications started");
        Ok(rx)
    }

    async fn stop_notify(&mut self) -> Result<(), SourceError> {
        self.join_reader().await;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SourceError> {
        self.join_reader().await;
        self.read_half = None;

        let result = match self.write_half.take() {
            Some(mut write_half) => write_half.shutdown().await.map_err(SourceError::from),
            None => Ok(()),
        };

        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!(upstream = %self.target, "Upstream source disconnected");
        result
    }
}

/// Reader task: forwards every read as one chunk until EOF, a read error,
/// the pump going away, or `stop`.
async fn read_chunks(
    read_half: OwnedReadHalf,
    chunk_size: usize,
    tx: mpsc::Sender<Bytes>,
    stop: CancellationToken,
    connected: Arc<AtomicBool>,
) {
    let reader = read_half.stop_on(stop.clone());
    tokio::pin!(reader);

    let mut buffer = vec![0u8; chunk_size];

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                if !stop.is_cancelled() {
                    tracing::warn!("Upstream source closed the connection");
                    connected.store(false, Ordering::SeqCst);
                }
                break;
            }
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buffer[..n])).await.is_err() {
                    tracing::debug!("Decode pump dropped its receiver, stopping upstream reader");
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Upstream read failed");
                connected.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn forwards_upstream_bytes_as_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let upstream = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[1, 2, 3, 4]).await.unwrap();
            socket
        });

        let mut source = TcpSource::connect(&addr.to_string(), Duration::from_secs(1), 64)
            .await
            .unwrap();
        assert!(source.is_connected());

        let mut rx = source.start_notify().await.unwrap();
        let mut received = Vec::new();
        while received.len() < 4 {
            received.extend_from_slice(&rx.recv().await.unwrap());
        }
        assert_eq!(received, vec![1, 2, 3, 4]);

        source.stop_notify().await.unwrap();
        source.disconnect().await.unwrap();
        assert!(!source.is_connected());

        drop(upstream.await.unwrap());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _accept = tokio::spawn(async move { listener.accept().await });

        let mut source = TcpSource::connect(&addr.to_string(), Duration::from_secs(1), 64)
            .await
            .unwrap();

        let _rx = source.start_notify().await.unwrap();
        assert!(matches!(
            source.start_notify().await,
            Err(SourceError::AlreadyNotifying)
        ));
        source.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn upstream_eof_marks_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upstream = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut source = TcpSource::connect(&addr.to_string(), Duration::from_secs(1), 64)
            .await
            .unwrap();
        let mut rx = source.start_notify().await.unwrap();
        upstream.await.unwrap();

        assert!(rx.recv().await.is_none());
        assert!(!source.is_connected());
    }
}
