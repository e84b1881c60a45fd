pub mod coordinator;
pub mod runtime;
