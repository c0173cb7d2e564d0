//! Port traits decoupling the domain from concrete implementations.

pub mod config_port;
pub mod data_port;
pub mod progress_port;
pub mod strategy_port;
