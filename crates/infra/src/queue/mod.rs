pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;
