pub mod database;
pub mod http_service;
pub mod locks;
pub mod message_queue;
pub mod observability;

pub use database::{InMemoryItemRepository, SqliteItemRepository};
pub use http_service::HttpMediaService;
pub use locks::{InMemoryLockStore, RedisLockStore};
pub use message_queue::{InMemoryBrokerConfig, InMemoryJobBroker, RedisJobBroker};
pub use observability::MetricsRegistry;
