//! Sensor frame decoder and TCP fan-out bridge.
//!
//! One upstream [`NotificationSource`](source::source::NotificationSource)
//! delivers raw byte chunks. The [`FrameDecoder`](decoder::decoder::FrameDecoder)
//! reassembles and validates 20-byte frames, and every 16-byte payload is
//! published by the [`Broadcaster`](broadcaster::broadcaster::Broadcaster) to
//! all consumers connected to the data port. A one-line control port arms a
//! single-fire shutdown that tears the pipeline down in order.

pub mod broadcaster;
pub mod cli;
pub mod decoder;
pub mod helpers;
pub mod instrumentation;
pub mod metrics;
pub mod runtime;
pub mod server;
pub mod source;
