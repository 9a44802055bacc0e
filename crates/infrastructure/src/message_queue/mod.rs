pub mod memory;
pub mod redis_broker;

pub use memory::{InMemoryBrokerConfig, InMemoryJobBroker};
pub use redis_broker::RedisJobBroker;
