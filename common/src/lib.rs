pub mod config;
pub mod filename;
pub mod frame;
