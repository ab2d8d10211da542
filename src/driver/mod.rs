//! The vendor driver boundary.
//!
//! Every call into a vendor runtime goes through [`Driver`]. Methods return the raw
//! [`NativeStatus`] on failure; [`NativeBoundary`] is the one place where those
//! statuses are turned into [`NativeCallFailure`]s and the failure policy is applied.

pub mod host;
pub mod kfd;

use crate::config::NativeFailurePolicy;
use crate::error::{AccelError, AccelResult, NativeCallFailure, NativeStatus};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

pub type NativeResult<T> = Result<T, NativeStatus>;

/// Opaque driver-side identifier of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// Absolute device virtual address of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

pub const QUEUE_GROUP_FLAG_COMPUTE: u32 = 1 << 0;
pub const QUEUE_GROUP_FLAG_COPY: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueGroupProperties {
    pub flags: u32,
    pub num_queues: u32,
}

impl QueueGroupProperties {
    #[must_use]
    pub const fn is_compute(&self) -> bool {
        self.flags & QUEUE_GROUP_FLAG_COMPUTE != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    HostToDevice,
    DeviceToHost,
}

/// Host memory that stays alive until the command list that references it has run.
///
/// Copies are recorded when enqueued but performed at execution time, so the host
/// side must be shared with the driver rather than borrowed.
#[derive(Debug, Clone, Default)]
pub struct HostBuffer(Arc<Mutex<Vec<u8>>>);

impl HostBuffer {
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(bytes)))
    }

    #[must_use]
    pub fn from_u32s(values: &[u32]) -> Self {
        Self::from_vec(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    #[must_use]
    pub fn from_f32s(values: &[f32]) -> Self {
        Self::from_vec(values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    #[must_use]
    pub fn to_u32s(&self) -> Vec<u32> {
        self.lock()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[must_use]
    pub fn to_f32s(&self) -> Vec<f32> {
        self.lock()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Locks the underlying bytes. A poisoned lock still yields the data: the
    /// buffer holds plain bytes with no invariant a panic could break.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// One host<->device transfer as handed to the driver.
#[derive(Debug, Clone)]
pub struct CopyCommand {
    pub direction: CopyDirection,
    /// Base of the device allocation.
    pub device_ptr: DevicePtr,
    /// Byte offset inside the device allocation.
    pub offset: u64,
    pub bytes: u64,
    pub host: HostBuffer,
    pub host_offset: u64,
}

/// A kernel argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    /// A device address, passed as a 64-bit pointer.
    Pointer(DevicePtr),
    /// Raw little-endian bytes of a by-value argument.
    Value(Vec<u8>),
}

impl KernelArg {
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Pointer(_) => 8,
            Self::Value(bytes) => bytes.len(),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Pointer(ptr) => ptr.0.to_le_bytes().to_vec(),
            Self::Value(bytes) => bytes.clone(),
        }
    }
}

macro_rules! kernel_arg_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KernelArg {
                fn from(value: $ty) -> Self {
                    Self::Value(value.to_le_bytes().to_vec())
                }
            }
        )*
    };
}

kernel_arg_from!(u32, i32, u64, i64, f32, f64);

impl From<DevicePtr> for KernelArg {
    fn from(ptr: DevicePtr) -> Self {
        Self::Pointer(ptr)
    }
}

/// Group size whose every dimension divides `global`, bounded per dimension by
/// `max_dims` and in total by `max_total`. Dimensions are filled x first.
#[must_use]
pub fn fit_group_size(global: [u32; 3], max_total: u32, max_dims: [u32; 3]) -> [u32; 3] {
    let mut budget = max_total.max(1);
    let mut group = [1u32; 3];
    for dim in 0..3 {
        let limit = budget.min(max_dims[dim]).min(global[dim]).max(1);
        group[dim] = (1..=limit)
            .rev()
            .find(|d| global[dim] % d == 0)
            .unwrap_or(1);
        budget /= group[dim];
    }
    group
}

/// Low-level command-list driver API implemented by each vendor backend.
///
/// Handles are plain integers; the backend owns the objects behind them. All
/// methods take `&self` so one driver can serve several devices driven from
/// different threads.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    fn device_name(&self, device: DeviceHandle) -> NativeResult<String>;

    fn command_queue_group_properties(
        &self,
        device: DeviceHandle,
    ) -> NativeResult<Vec<QueueGroupProperties>>;

    fn create_command_queue(&self, device: DeviceHandle, ordinal: u32)
    -> NativeResult<QueueHandle>;

    fn create_command_list(&self, device: DeviceHandle, ordinal: u32) -> NativeResult<ListHandle>;

    /// Host-visible memory shared between host and device.
    fn allocate_shared(&self, device: DeviceHandle, bytes: u64) -> NativeResult<DevicePtr>;

    /// Device-local memory.
    fn allocate_device(&self, device: DeviceHandle, bytes: u64) -> NativeResult<DevicePtr>;

    fn free(&self, device: DeviceHandle, ptr: DevicePtr) -> NativeResult<()>;

    fn append_memory_copy(&self, list: ListHandle, copy: &CopyCommand) -> NativeResult<()>;

    fn append_barrier(&self, list: ListHandle) -> NativeResult<()>;

    /// Appends a launch of `kernel` with `grid` work-groups per dimension, using
    /// the group size and arguments currently bound to the kernel.
    fn append_launch_kernel(
        &self,
        list: ListHandle,
        kernel: KernelHandle,
        grid: [u32; 3],
    ) -> NativeResult<()>;

    fn close_command_list(&self, list: ListHandle) -> NativeResult<()>;

    fn reset_command_list(&self, list: ListHandle) -> NativeResult<()>;

    fn execute_command_lists(&self, queue: QueueHandle, lists: &[ListHandle])
    -> NativeResult<()>;

    /// Blocks until every list submitted to `queue` has finished.
    fn synchronize(&self, queue: QueueHandle) -> NativeResult<()>;

    fn suggest_group_size(&self, kernel: KernelHandle, global: [u32; 3]) -> NativeResult<[u32; 3]>;

    fn set_group_size(&self, kernel: KernelHandle, group: [u32; 3]) -> NativeResult<()>;

    fn set_argument_value(&self, kernel: KernelHandle, index: u32, arg: &KernelArg)
    -> NativeResult<()>;
}

/// Per-device wrapper that crosses the driver boundary and applies the
/// configured failure policy.
#[derive(Debug, Clone)]
pub struct NativeBoundary {
    driver: Arc<dyn Driver>,
    policy: NativeFailurePolicy,
    failures: Vec<NativeCallFailure>,
}

impl NativeBoundary {
    #[must_use]
    pub fn new(driver: Arc<dyn Driver>, policy: NativeFailurePolicy) -> Self {
        Self {
            driver,
            policy,
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    #[must_use]
    pub const fn policy(&self) -> NativeFailurePolicy {
        self.policy
    }

    /// Converts a driver result and always propagates failures.
    ///
    /// # Errors
    /// Returns `AccelError::Native` when the driver reports a failure.
    pub fn check<T>(&self, call: &'static str, result: NativeResult<T>) -> AccelResult<T> {
        result.map_err(|status| {
            tracing::error!(call, %status, backend = self.driver.name(), "native call failed");
            AccelError::Native(NativeCallFailure { call, status })
        })
    }

    /// Converts a driver result according to the failure policy.
    ///
    /// Under `Continue`, a failure is logged and recorded and `Ok(None)` is
    /// returned so the caller can proceed with a fallback value.
    ///
    /// # Errors
    /// Returns `AccelError::Native` under the `Propagate` policy.
    pub fn guard<T>(&mut self, call: &'static str, result: NativeResult<T>) -> AccelResult<Option<T>> {
        match self.check(call, result) {
            Ok(value) => Ok(Some(value)),
            Err(AccelError::Native(failure)) if self.policy == NativeFailurePolicy::Continue => {
                self.failures.push(failure);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    #[must_use]
    pub fn failures(&self) -> &[NativeCallFailure] {
        &self.failures
    }

    pub fn take_failures(&mut self) -> Vec<NativeCallFailure> {
        std::mem::take(&mut self.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_args_encode_little_endian() {
        assert_eq!(KernelArg::from(1u32).to_bytes(), vec![1, 0, 0, 0]);
        assert_eq!(KernelArg::from(DevicePtr(0x10)).size(), 8);
        assert_eq!(
            KernelArg::from(DevicePtr(0x0102)).to_bytes(),
            vec![2, 1, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn fitted_group_divides_global_size() {
        let dims = [1024, 1024, 64];
        assert_eq!(fit_group_size([256, 1, 1], 256, dims), [256, 1, 1]);
        assert_eq!(fit_group_size([1000, 1, 1], 256, dims), [250, 1, 1]);
        assert_eq!(fit_group_size([64, 64, 1], 256, dims), [64, 4, 1]);
        assert_eq!(fit_group_size([97, 1, 1], 256, dims), [97, 1, 1]);
        assert_eq!(fit_group_size([0, 1, 1], 256, dims), [1, 1, 1]);
    }

    #[test]
    fn host_buffer_round_trips_words() {
        let buf = HostBuffer::from_u32s(&[1, 2, 0xdead_beef]);
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.to_u32s(), vec![1, 2, 0xdead_beef]);
    }

    #[test]
    fn guard_records_under_continue_and_raises_under_propagate() {
        let driver: Arc<dyn Driver> = Arc::new(host::HostDriver::new(vec![]));

        let mut boundary = NativeBoundary::new(driver.clone(), NativeFailurePolicy::Continue);
        let out = boundary
            .guard::<()>("append_barrier", Err(NativeStatus::ERROR_DEVICE_LOST))
            .unwrap();
        assert!(out.is_none());
        assert_eq!(boundary.failures().len(), 1);
        assert_eq!(boundary.take_failures()[0].call, "append_barrier");
        assert!(boundary.failures().is_empty());

        let mut boundary = NativeBoundary::new(driver, NativeFailurePolicy::Propagate);
        let err = boundary
            .guard::<()>("append_barrier", Err(NativeStatus::ERROR_DEVICE_LOST))
            .unwrap_err();
        assert!(matches!(err, AccelError::Native(f) if f.status == NativeStatus::ERROR_DEVICE_LOST));
    }
}
