//! Keydrop Core - Shared functionality for the keydrop engine and binary
//!
//! Standard host locations, the engine configuration file, and output
//! formatting shared by the binary and the engine.

pub mod config;
pub mod format;
pub mod paths;

pub use config::Config;
pub use paths::Paths;
