// Registration runs once per process; a failure means a duplicate metric
// name, which is a programming error.
#![allow(clippy::expect_used)]

// External crates
use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, Histogram, register_counter, register_gauge, register_histogram,
};
use std::time::Instant;

/// Helper to observe histogram duration
pub fn observe_duration(hist: &Histogram, start: Instant) {
    let elapsed = start.elapsed().as_secs_f64();
    hist.observe(elapsed);
}

lazy_static! {
    // ======== Frame Decoding Metrics ========

    /// Frames that passed SOF/EOF/checksum validation
    pub static ref FRAMES_DECODED_TOTAL: Counter = register_counter!(
        "bridge_frames_decoded_total",
        "Total number of validated frames cut from the receive buffer"
    )
    .expect("bridge_frames_decoded_total registered once");

    /// Windows dropped on checksum mismatch
    pub static ref CHECKSUM_ERRORS_TOTAL: Counter = register_counter!(
        "bridge_checksum_errors_total",
        "Total number of 20-byte windows dropped on checksum mismatch"
    )
    .expect("bridge_checksum_errors_total registered once");

    /// Bytes dropped while hunting for the next SOF
    pub static ref BYTES_DISCARDED_TOTAL: Counter = register_counter!(
        "bridge_bytes_discarded_total",
        "Total number of receive buffer bytes dropped while resynchronising"
    )
    .expect("bridge_bytes_discarded_total registered once");

    /// Raw upstream chunks fed to the decoder
    pub static ref CHUNKS_RECEIVED_TOTAL: Counter = register_counter!(
        "bridge_chunks_received_total",
        "Total number of raw notification chunks fed to the decoder"
    )
    .expect("bridge_chunks_received_total registered once");

    // ======== Broadcast Metrics ========

    /// Payloads handed to the broadcaster
    pub static ref PAYLOADS_PUBLISHED_TOTAL: Counter = register_counter!(
        "bridge_payloads_published_total",
        "Total number of payloads handed to the broadcaster"
    )
    .expect("bridge_payloads_published_total registered once");

    /// Sinks dropped after a failed write
    pub static ref SINK_WRITE_FAILURES_TOTAL: Counter = register_counter!(
        "bridge_sink_write_failures_total",
        "Total number of sinks removed after a failed write"
    )
    .expect("bridge_sink_write_failures_total registered once");

    /// Consumers currently attached
    pub static ref CONNECTED_SINKS: Gauge = register_gauge!(
        "bridge_connected_sinks",
        "Number of consumers currently receiving payloads"
    )
    .expect("bridge_connected_sinks registered once");

    /// Time spent fanning a single payload out to every sink
    pub static ref PUBLISH_DURATION_SECONDS: Histogram = register_histogram!(
        "bridge_publish_duration_seconds",
        "Histogram of per-payload broadcast durations in seconds",
        vec![0.000_01, 0.000_05, 0.0001, 0.0005, 0.001, 0.005]
    )
    .expect("bridge_publish_duration_seconds registered once");

    // ======== Lifecycle Metrics ========

    /// Control port commands, recognised or not
    pub static ref CONTROL_COMMANDS_TOTAL: Counter = register_counter!(
        "bridge_control_commands_total",
        "Total number of commands received on the control port"
    )
    .expect("bridge_control_commands_total registered once");

    /// Teardown runs
    pub static ref SHUTDOWN_INVOCATIONS_TOTAL: Counter = register_counter!(
        "bridge_shutdown_invocations_total",
        "Number of graceful shutdown invocations"
    )
    .expect("bridge_shutdown_invocations_total registered once");
}
