pub mod app_config;
pub mod database;
pub mod redis_repo;

pub use app_config::{Config, ConfigError, StoreBackend};
pub use database::PgSeatStore;
pub use redis_repo::RedisSeatStore;
