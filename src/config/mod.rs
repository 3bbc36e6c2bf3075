//! Configuration Management Module
//!
//! Persistent application settings (tunnel ports, reconnect policy) stored as
//! JSON in the platform config directory.

pub mod storage;
pub mod types;

pub use storage::{config_dir, ConfigStorage, StorageError};
pub use types::{
    AppConfig, TunnelConfig, DEFAULT_LOCAL_PORT, DEFAULT_MAX_RECONNECT_DELAY,
    DEFAULT_RECONNECT_DELAY, DEFAULT_REMOTE_PORT,
};
