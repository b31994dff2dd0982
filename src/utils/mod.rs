pub use memory_pool::MemoryPool;

mod memory_pool;
