// Local crates
use crate::source::source::{NotificationSource, SourceError};

// External crates
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Source fed by an in-process channel.
///
/// Lets an embedding application (or a test) push raw notification chunks
/// through the bridge without a network upstream. Dropping the paired
/// sender looks like the upstream going away.
#[derive(Debug)]
pub struct ChannelSource {
    name: String,
    chunks: Option<mpsc::Receiver<Bytes>>,
    connected: Arc<AtomicBool>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it.
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::from_receiver(name, rx), tx)
    }

    /// Wrap an existing chunk receiver.
    pub fn from_receiver(name: impl Into<String>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            name: name.into(),
            chunks: Some(rx),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[async_trait]
impl NotificationSource for ChannelSource {
    fn describe(&self) -> String {
        format!("channel:{}", self.name)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_notify(&mut self) -> Result<mpsc::Receiver<Bytes>, SourceError> {
        if !self.is_connected() {
            return Err(SourceError::NotConnected);
        }
        self.chunks.take().ok_or(SourceError::AlreadyNotifying)
    }

    async fn stop_notify(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SourceError> {
        self.chunks = None;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hands_out_its_receiver_once() {
        let (mut source, tx) = ChannelSource::new("test", 4);

        let mut rx = source.start_notify().await.unwrap();
        tx.send(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"abc"));

        assert!(matches!(
            source.start_notify().await,
            Err(SourceError::AlreadyNotifying)
        ));
    }

    #[tokio::test]
    async fn disconnect_refuses_new_subscriptions() {
        let (mut source, _tx) = ChannelSource::new("test", 4);
        source.disconnect().await.unwrap();

        assert!(!source.is_connected());
        assert!(matches!(
            source.start_notify().await,
            Err(SourceError::NotConnected)
        ));
    }
}
