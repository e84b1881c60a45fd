pub mod async_read;
pub mod channel;
pub mod simulated;
pub mod source;
pub mod tcp;
