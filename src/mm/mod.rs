//! Device memory: the per-device bump allocator and the views it hands out.

pub mod buffer;
pub mod manager;

pub use buffer::{Buffer, CallStack};
pub use manager::MemoryManager;
