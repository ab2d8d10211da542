//! Low-level access to the AMD KFD kernel driver: ioctls, sysfs topology,
//! GPU memory and AQL user-mode queues.

pub mod aql;
pub mod device;
pub mod ioctl;
pub mod memory;
pub mod queue;
pub mod sysfs;
