//! Fan-out of validated payloads to every connected sink.
//!
//! The sink set is the only structure touched from several flows at once
//! (accept loop, publish path, connection teardown, shutdown). Every
//! mutation happens under one `parking_lot::Mutex`; `publish` copies the set
//! into a snapshot under that lock and performs the writes after releasing
//! it, so sinks may connect or disconnect while a payload is in flight.

// Local crates
use crate::broadcaster::sink::{Sink, SinkId};
use crate::decoder::frame::Payload;
use crate::metrics::metrics::{
    CONNECTED_SINKS, PAYLOADS_PUBLISHED_TOTAL, PUBLISH_DURATION_SECONDS,
    SINK_WRITE_FAILURES_TOTAL, observe_duration,
};

// External crates
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Owns the set of connected sinks.
#[derive(Debug, Default)]
pub struct Broadcaster {
    sinks: Mutex<HashMap<SinkId, Arc<dyn Sink>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    /// Create a broadcaster with no sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh identity for a sink about to be added.
    pub fn next_sink_id(&self) -> SinkId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a sink. A sink already present under the same id is replaced
    /// and closed.
    pub fn add_sink(&self, sink: Arc<dyn Sink>) {
        let id = sink.id();
        let previous = {
            let mut sinks = self.sinks.lock();
            let previous = sinks.insert(id, sink);
            CONNECTED_SINKS.set(sinks.len() as f64);
            previous
        };

        if let Some(previous) = previous {
            tracing::warn!(sink_id = id, "Replacing sink registered under the same id");
            previous.close();
        }

        tracing::debug!(sink_id = id, "Sink added");
    }

    /// Remove and close a sink. Returns `false` if it was not registered.
    pub fn remove_sink(&self, id: SinkId) -> bool {
        match self.detach(id) {
            Some(sink) => {
                sink.close();
                tracing::debug!(sink_id = id, "Sink removed");
                true
            }
            None => false,
        }
    }

    /// Write `payload` to every sink in a snapshot of the current set.
    ///
    /// A sink whose write fails is removed and closed; the remaining sinks
    /// still receive the payload. Returns the number of successful writes.
    pub fn publish(&self, payload: &Payload) -> usize {
        let start = Instant::now();
        let snapshot: Vec<Arc<dyn Sink>> = self.sinks.lock().values().cloned().collect();

        let mut delivered = 0;
        for sink in snapshot {
            match sink.try_write(payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        sink_id = sink.id(),
                        error = %e,
                        "Error sending payload to sink, dropping it"
                    );
                    SINK_WRITE_FAILURES_TOTAL.inc();
                    // The connection task may have removed it concurrently.
                    if self.detach(sink.id()).is_some() {
                        sink.close();
                    }
                }
            }
        }

        PAYLOADS_PUBLISHED_TOTAL.inc();
        observe_duration(&PUBLISH_DURATION_SECONDS, start);
        delivered
    }

    /// Remove and close every sink. Safe to call repeatedly; returns how
    /// many sinks this call closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<dyn Sink>> = {
            let mut sinks = self.sinks.lock();
            let drained = sinks.drain().map(|(_, sink)| sink).collect();
            CONNECTED_SINKS.set(0.0);
            drained
        };

        for sink in &drained {
            sink.close();
        }

        if !drained.is_empty() {
            tracing::debug!(closed = drained.len(), "Closed all remaining sinks");
        }
        drained.len()
    }

    /// Number of currently registered sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Identities of currently registered sinks, in no particular order.
    pub fn sink_ids(&self) -> Vec<SinkId> {
        self.sinks.lock().keys().copied().collect()
    }

    fn detach(&self, id: SinkId) -> Option<Arc<dyn Sink>> {
        let mut sinks = self.sinks.lock();
        let removed = sinks.remove(&id);
        CONNECTED_SINKS.set(sinks.len() as f64);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::sink::{ChannelSink, SinkError};
    use std::sync::atomic::AtomicBool;

    /// Sink that records writes and can be told to fail.
    #[derive(Debug)]
    struct RecordingSink {
        id: SinkId,
        fail: bool,
        written: Mutex<Vec<Payload>>,
        closed: AtomicBool,
    }

    impl RecordingSink {
        fn new(id: SinkId, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                fail,
                written: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl Sink for RecordingSink {
        fn id(&self) -> SinkId {
            self.id
        }

        fn try_write(&self, payload: &Payload) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Io(std::io::Error::from(
                    std::io::ErrorKind::BrokenPipe,
                )));
            }
            self.written.lock().push(*payload);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn publish_reaches_every_sink() {
        let broadcaster = Broadcaster::new();
        let sinks: Vec<_> = (0..3).map(|id| RecordingSink::new(id, false)).collect();
        for sink in &sinks {
            broadcaster.add_sink(sink.clone());
        }

        let payload = Payload::new([0x5a; 16]);
        assert_eq!(broadcaster.publish(&payload), 3);

        for sink in &sinks {
            assert_eq!(*sink.written.lock(), vec![payload]);
        }
    }

    #[test]
    fn failing_sink_is_removed_others_still_receive() {
        let broadcaster = Broadcaster::new();
        let good_a = RecordingSink::new(1, false);
        let bad = RecordingSink::new(2, true);
        let good_b = RecordingSink::new(3, false);
        broadcaster.add_sink(good_a.clone());
        broadcaster.add_sink(bad.clone());
        broadcaster.add_sink(good_b.clone());

        let payload = Payload::new([0x11; 16]);
        assert_eq!(broadcaster.publish(&payload), 2);

        assert_eq!(*good_a.written.lock(), vec![payload]);
        assert_eq!(*good_b.written.lock(), vec![payload]);
        assert!(bad.closed.load(Ordering::SeqCst));

        let mut ids = broadcaster.sink_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn remove_sink_closes_it() {
        let broadcaster = Broadcaster::new();
        let sink = RecordingSink::new(9, false);
        broadcaster.add_sink(sink.clone());

        assert!(broadcaster.remove_sink(9));
        assert!(!broadcaster.remove_sink(9));
        assert!(sink.closed.load(Ordering::SeqCst));
        assert_eq!(broadcaster.sink_count(), 0);
    }

    #[test]
    fn close_all_is_idempotent() {
        let broadcaster = Broadcaster::new();
        let a = RecordingSink::new(1, false);
        let b = RecordingSink::new(2, false);
        broadcaster.add_sink(a.clone());
        broadcaster.add_sink(b.clone());

        assert_eq!(broadcaster.close_all(), 2);
        assert_eq!(broadcaster.close_all(), 0);
        assert!(a.closed.load(Ordering::SeqCst));
        assert!(b.closed.load(Ordering::SeqCst));
        assert_eq!(broadcaster.sink_count(), 0);
    }

    #[test]
    fn publish_with_no_sinks() {
        let broadcaster = Broadcaster::new();
        assert_eq!(broadcaster.publish(&Payload::new([0; 16])), 0);
    }

    #[test]
    fn slow_channel_sink_is_dropped() {
        let broadcaster = Broadcaster::new();
        let (sink, _receiver) = ChannelSink::new(broadcaster.next_sink_id(), None, 1);
        broadcaster.add_sink(sink);

        let payload = Payload::new([1; 16]);
        assert_eq!(broadcaster.publish(&payload), 1);
        assert_eq!(broadcaster.publish(&payload), 0);
        assert_eq!(broadcaster.sink_count(), 0);
    }

    #[test]
    fn sink_ids_are_unique() {
        let broadcaster = Broadcaster::new();
        let a = broadcaster.next_sink_id();
        let b = broadcaster.next_sink_id();
        assert_ne!(a, b);
    }
}
