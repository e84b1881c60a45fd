//! Simulated sensor board.
//!
//! Emits well-formed frames at a fixed rate so consumers can be developed
//! without hardware attached. Each tick produces one frame, delivered split
//! into two chunks so the decode path sees realistic fragmentation.

// Local crates
use crate::decoder::frame::{Payload, encode_frame};
use crate::helpers::converters::SensorSample;
use crate::source::source::{CHUNK_CHANNEL_CAPACITY, NotificationSource, SourceError};

// External crates
use async_trait::async_trait;
use bytes::Bytes;
use std::f64::consts::TAU;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Resting heart rate used for the synthetic cardiac channels.
const HEART_RATE_HZ: f64 = 1.2;

/// Offset at which each synthetic frame is split across two chunks.
const SPLIT_AT: usize = 7;

/// Highest tick rate the simulated board supports.
pub const MAX_RATE_HZ: u32 = 10_000;

/// Deterministic waveform generator for [`SensorSample`]s.
#[derive(Debug, Clone)]
pub struct SampleGenerator {
    rate_hz: f64,
    tick: u64,
}

impl SampleGenerator {
    /// Generator advancing `rate_hz` samples per simulated second.
    pub fn new(rate_hz: u32) -> Self {
        Self {
            rate_hz: f64::from(rate_hz.max(1)),
            tick: 0,
        }
    }

    /// Produce the next sample and advance time by one tick.
    pub fn next_sample(&mut self) -> SensorSample {
        let t = self.tick as f64 / self.rate_hz;
        self.tick = self.tick.wrapping_add(1);

        let beat = (TAU * HEART_RATE_HZ * t).sin();
        let breath = (TAU * 0.25 * t).sin();

        SensorSample {
            bcg: (beat * 800.0 + breath * 200.0) as i16,
            ecg: (beat.powi(9) * 1_500.0) as i16,
            ppg_red: (120_000.0 + beat * 2_000.0) as u32,
            ppg_ir: (98_000.0 + beat * 1_500.0) as u32,
            temp_a: (15_000.0 + breath * 20.0) as u16,
            temp_b: 15_100,
        }
    }
}

/// [`NotificationSource`] backed by a [`SampleGenerator`] on a timer.
#[derive(Debug)]
pub struct SimulatedSource {
    rate_hz: u32,
    generator: Option<JoinHandle<()>>,
    stop: CancellationToken,
    connected: bool,
}

impl SimulatedSource {
    /// Source ticking at `rate_hz`, clamped to `1..=MAX_RATE_HZ`.
    pub fn new(rate_hz: u32) -> Self {
        Self {
            rate_hz: rate_hz.clamp(1, MAX_RATE_HZ),
            generator: None,
            stop: CancellationToken::new(),
            connected: true,
        }
    }
}

#[async_trait]
impl NotificationSource for SimulatedSource {
    fn describe(&self) -> String {
        format!("simulated@{}Hz", self.rate_hz)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn start_notify(&mut self) -> Result<mpsc::Receiver<Bytes>, SourceError> {
        if !self.connected {
            return Err(SourceError::NotConnected);
        }
        if self.generator.is_some() {
            return Err(SourceError::AlreadyNotifying);
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        self.stop = CancellationToken::new();
        let stop = self.stop.clone();
        let rate_hz = self.rate_hz;

        self.generator = Some(tokio::spawn(async move {
            let mut samples = SampleGenerator::new(rate_hz);
            let mut ticker =
                tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(rate_hz)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = encode_frame(&Payload::from(samples.next_sample()), 0);
                        let (head, tail) = frame.split_at(SPLIT_AT);
                        if tx.send(Bytes::copy_from_slice(head)).await.is_err()
                            || tx.send(Bytes::copy_from_slice(tail)).await.is_err()
                        {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Simulated source generator stopped");
        }));

        Ok(rx)
    }

    async fn stop_notify(&mut self) -> Result<(), SourceError> {
        if let Some(handle) = self.generator.take() {
            self.stop.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Simulated source generator ended abnormally");
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SourceError> {
        self.stop_notify().await?;
        self.connected = false;
        Ok(())
    }
}
