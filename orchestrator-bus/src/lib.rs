//! ABOUTME: Concrete `MessageBus` adapters: in-process fan-out and Redis streams
//! ABOUTME: Both implement `orchestrator_core::ports::MessageBus` and are interchangeable

pub mod in_memory;
pub mod redis_bus;

pub use in_memory::{InMemoryBus, InMemoryBusConfig};
pub use redis_bus::{RedisBus, RedisBusConfig};
