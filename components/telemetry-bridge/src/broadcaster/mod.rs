pub mod broadcaster;
pub mod sink;
