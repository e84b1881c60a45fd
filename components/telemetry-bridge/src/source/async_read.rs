use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf, Result as IoResult};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Turns a stop token into end-of-stream for a reader, so an upstream read
/// loop has a single exit path for "link closed" and "asked to stop".
pub trait StopOnCancelExt: AsyncRead + Sized {
    /// Wrap `self` so reads return EOF once `stop` is cancelled.
    fn stop_on(self, stop: CancellationToken) -> StopOnCancel<Self> {
        StopOnCancel {
            reader: self,
            stopped: stop.cancelled_owned(),
        }
    }
}

impl<S> StopOnCancelExt for S where S: AsyncRead {}

/// Reader returned by [`StopOnCancelExt::stop_on`].
#[derive(Debug)]
#[pin_project]
pub struct StopOnCancel<S> {
    #[pin]
    reader: S,
    #[pin]
    stopped: WaitForCancellationFutureOwned,
}

impl<S: AsyncRead> AsyncRead for StopOnCancel<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<IoResult<()>> {
        let this = self.project();

        // Bytes still in the socket after stop are never read.
        if this.stopped.poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        this.reader.poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn reads_until_stop_fires() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let stop = CancellationToken::new();

        let reader = reader.stop_on(stop.clone());
        tokio::pin!(reader);

        writer.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");

        stop.cancel();
        // Stop looks like EOF even though the writer is still open.
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        drop(writer);
    }

    #[tokio::test]
    async fn stop_wakes_a_blocked_read() {
        let (_writer, reader) = tokio::io::duplex(64);
        let stop = CancellationToken::new();

        let mut reader = Box::pin(reader.stop_on(stop.clone()));
        let read = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });

        tokio::task::yield_now().await;
        stop.cancel();
        assert_eq!(read.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn already_cancelled_token_reads_nothing() {
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"pending").await.unwrap();

        let stop = CancellationToken::new();
        stop.cancel();
        let mut reader = Box::pin(reader.stop_on(stop));

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
