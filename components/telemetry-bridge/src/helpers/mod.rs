pub mod converters;
pub mod load_config;
pub mod shutdown;
