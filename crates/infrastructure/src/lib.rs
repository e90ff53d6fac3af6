pub mod factory;
pub mod memory;
pub mod redis_store;

pub use factory::create_queue_store;
pub use memory::MemoryQueueStore;
pub use redis_store::RedisQueueStore;
