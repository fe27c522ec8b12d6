//! tiercache-adapter-redis - Redis 远程存储适配器

mod config;
mod connection;
mod store;

pub use config::RedisStoreConfig;
pub use connection::{create_client, create_connection_manager, map_redis_error};
pub use store::RedisStore;
