pub mod config;
pub mod mqtt;
