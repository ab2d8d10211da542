//! Device memory management and kernel dispatch for accelerators behind
//! low-level vendor drivers.
//!
//! A [`Context`] owns one command queue and one [`MemoryManager`] per device.
//! Each manager carves a single device region into a call-stack area and a
//! bump-allocated heap. Copies, barriers and launches are recorded on the
//! device's command list and run when the list is flushed.

pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod kfd;
pub mod mm;
pub mod queue;
pub mod utils;

pub use config::{Config, NativeFailurePolicy};
pub use context::{Context, DeviceContext};
pub use device::Device;
pub use dispatch::{KernelDispatcher, KernelLaunchDescriptor, TaskMeta};
pub use driver::{DeviceHandle, DevicePtr, Driver, HostBuffer, KernelArg, NativeBoundary};
pub use error::{AccelError, AccelResult, NativeCallFailure, NativeStatus};
pub use mm::{Buffer, CallStack, MemoryManager};
pub use queue::{CommandQueue, ListState};
