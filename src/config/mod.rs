//! Configuration Module
//!
//! Pool/heartbeat/reconnect tunables and their on-disk JSON form.

pub mod pool;
pub mod storage;

pub use pool::PoolConfig;
pub use storage::{config_dir, load_pool_config, pool_config_file, save_pool_config, ConfigError};
