pub mod config;
pub mod package;
pub mod redis;
pub mod types;
