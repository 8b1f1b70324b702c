pub mod config;
pub mod domain;
pub mod errors;
pub mod infrastructure;
pub mod retry;

pub use config::{Config, ConfigLoadError};
pub use errors::CoreError;
pub use infrastructure::kv::{KvError, KvStore, KvStoreExt, MemoryKvStore, RedisKvStore};
pub use retry::RetryPolicy;
