pub mod memory;
pub mod redis_lock;

pub use memory::InMemoryLockStore;
pub use redis_lock::RedisLockStore;
