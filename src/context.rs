//! The façade: one (queue, memory manager) pair per discovered device.

use crate::config::Config;
use crate::device::Device;
use crate::dispatch::{KernelDispatcher, KernelLaunchDescriptor, TaskMeta};
use crate::driver::kfd::KfdDriver;
use crate::driver::{
    CopyCommand, CopyDirection, DeviceHandle, DevicePtr, Driver, HostBuffer, NativeBoundary,
};
use crate::error::{AccelError, AccelResult, NativeCallFailure};
use crate::mm::{CallStack, MemoryManager};
use crate::queue::CommandQueue;
use std::sync::Arc;

/// Everything the runtime keeps for one device.
///
/// A `DeviceContext` is driven by one caller at a time; distinct devices are
/// independent and may be driven from different threads.
#[derive(Debug)]
pub struct DeviceContext {
    device: Device,
    boundary: NativeBoundary,
    queue: CommandQueue,
    memory: MemoryManager,
}

impl DeviceContext {
    fn create(
        driver: Arc<dyn Driver>,
        index: usize,
        handle: DeviceHandle,
        config: &Config,
    ) -> AccelResult<Self> {
        let boundary = NativeBoundary::new(driver, config.native_failure_policy);
        let device = Device::query(&boundary, index, handle)?;
        let queue = CommandQueue::create(&boundary, &device)?;
        let memory = MemoryManager::new(device.name(), config);
        Ok(Self {
            device,
            boundary,
            queue,
            memory,
        })
    }

    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub const fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryManager {
        &mut self.memory
    }

    #[must_use]
    pub const fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Driver failures recorded under the `Continue` policy.
    #[must_use]
    pub fn native_failures(&self) -> &[NativeCallFailure] {
        self.boundary.failures()
    }

    pub fn take_native_failures(&mut self) -> Vec<NativeCallFailure> {
        self.boundary.take_failures()
    }

    /// Allocates the device region of `num_bytes` and initializes the memory
    /// manager with its base address.
    ///
    /// # Errors
    /// `InvalidState` if the region already exists; allocation failures propagate.
    pub fn allocate_memory(&mut self, num_bytes: u64) -> AccelResult<DevicePtr> {
        if self.memory.is_initialized() {
            return Err(AccelError::InvalidState(format!(
                "device region on {} is already allocated",
                self.device.name()
            )));
        }
        let ptr =
            self.memory
                .allocate_device_memory_regions(&self.boundary, self.device.handle(), num_bytes)?;
        self.memory.init(ptr.0)?;
        Ok(ptr)
    }

    /// Device pointer of the region; argument 0 of every kernel.
    ///
    /// # Errors
    /// `InvalidState` before [`allocate_memory`](Self::allocate_memory).
    pub fn heap_base(&self) -> AccelResult<DevicePtr> {
        self.memory.to_buffer().ok_or_else(|| {
            AccelError::InvalidState(format!(
                "no device region allocated on {}",
                self.device.name()
            ))
        })
    }

    /// Appends a copy of `bytes` bytes at region offset `offset` into `host`
    /// at `host_offset`, followed by a barrier. The data is there after
    /// [`flush`](Self::flush).
    ///
    /// # Errors
    /// `InvalidArgument` for out-of-range copies, `InvalidState` on a closed
    /// list or missing region; driver failures per policy.
    pub fn read_buffer(
        &mut self,
        offset: u64,
        bytes: u64,
        host: &HostBuffer,
        host_offset: u64,
    ) -> AccelResult<()> {
        let copy = self.copy_command(CopyDirection::DeviceToHost, offset, bytes, host, host_offset)?;
        self.queue.enqueue_copy(&mut self.boundary, &copy)?;
        self.queue.enqueue_barrier(&mut self.boundary)
    }

    /// Appends a copy from `host` into the region, followed by a barrier.
    ///
    /// # Errors
    /// See [`read_buffer`](Self::read_buffer).
    pub fn enqueue_write_buffer(
        &mut self,
        offset: u64,
        bytes: u64,
        host: &HostBuffer,
        host_offset: u64,
    ) -> AccelResult<()> {
        let copy = self.copy_command(CopyDirection::HostToDevice, offset, bytes, host, host_offset)?;
        self.queue.enqueue_copy(&mut self.boundary, &copy)?;
        self.queue.enqueue_barrier(&mut self.boundary)
    }

    /// Writes the frame's header and pushed arguments to its call-stack slot.
    ///
    /// # Errors
    /// See [`read_buffer`](Self::read_buffer).
    pub fn enqueue_write_call_stack(&mut self, frame: &CallStack) -> AccelResult<()> {
        let bytes = frame.to_bytes();
        let len = bytes.len() as u64;
        self.enqueue_write_buffer(frame.offset(), len, &HostBuffer::from_vec(bytes), 0)
    }

    /// # Errors
    /// `InvalidState` on a closed list; driver failures per policy.
    pub fn enqueue_barrier(&mut self) -> AccelResult<()> {
        self.queue.enqueue_barrier(&mut self.boundary)
    }

    /// Sizes and enqueues `task`, passing the region base as argument 0.
    ///
    /// # Errors
    /// `InvalidState` on a closed list or missing region; driver failures per policy.
    pub fn launch(&mut self, task: &TaskMeta) -> AccelResult<KernelLaunchDescriptor> {
        let heap_base = self.heap_base()?;
        KernelDispatcher::new(&mut self.boundary, &mut self.queue).launch(heap_base, task)
    }

    /// Submits the list and waits for the device. The list is closed afterwards.
    ///
    /// # Errors
    /// `InvalidState` if already closed; driver failures per policy.
    pub fn flush(&mut self) -> AccelResult<()> {
        self.queue.flush(&mut self.boundary)
    }

    /// # Errors
    /// Driver failures per policy.
    pub fn reopen(&mut self) -> AccelResult<()> {
        self.queue.reopen(&mut self.boundary)
    }

    fn copy_command(
        &self,
        direction: CopyDirection,
        offset: u64,
        bytes: u64,
        host: &HostBuffer,
        host_offset: u64,
    ) -> AccelResult<CopyCommand> {
        let device_ptr = self.heap_base()?;
        let device_end = offset.checked_add(bytes);
        if device_end.is_none_or(|end| end > self.memory.heap_limit()) {
            return Err(AccelError::InvalidArgument(format!(
                "copy of {bytes} bytes at offset {offset} leaves the {}-byte region on {}",
                self.memory.heap_limit(),
                self.device.name()
            )));
        }
        let host_end = host_offset.checked_add(bytes);
        if host_end.is_none_or(|end| end > host.len() as u64) {
            return Err(AccelError::InvalidArgument(format!(
                "copy of {bytes} bytes at host offset {host_offset} leaves a {}-byte host buffer",
                host.len()
            )));
        }
        Ok(CopyCommand {
            direction,
            device_ptr,
            offset,
            bytes,
            host: host.clone(),
            host_offset,
        })
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        let Some(region) = self.memory.to_buffer() else {
            return;
        };
        let freed = self.boundary.driver().free(self.device.handle(), region);
        match self.boundary.check("free", freed) {
            Ok(()) => tracing::debug!(device = %self.device.name(), "released device region"),
            Err(err) => tracing::warn!(device = %self.device.name(), %err, "device region leaked"),
        }
    }
}

/// Owns every device's runtime state. Devices are addressed by index.
#[derive(Debug)]
pub struct Context {
    driver: Arc<dyn Driver>,
    config: Config,
    devices: Vec<DeviceContext>,
}

impl Context {
    /// Builds the queue, list and memory manager of every device up front.
    ///
    /// # Errors
    /// `Bailout` when `devices` is empty; invalid configuration or driver
    /// failures during setup propagate.
    pub fn new(driver: Arc<dyn Driver>, devices: &[DeviceHandle], config: Config) -> AccelResult<Self> {
        config.validate()?;
        if devices.is_empty() {
            return Err(AccelError::Bailout(format!(
                "no devices found on the {} backend",
                driver.name()
            )));
        }

        let devices = devices
            .iter()
            .enumerate()
            .map(|(index, &handle)| DeviceContext::create(driver.clone(), index, handle, &config))
            .collect::<AccelResult<Vec<_>>>()?;

        tracing::info!(backend = driver.name(), devices = devices.len(), "context created");
        Ok(Self {
            driver,
            config,
            devices,
        })
    }

    /// Context over every GPU the KFD driver exposes.
    ///
    /// # Errors
    /// `Io` when `/dev/kfd` or a render node cannot be opened, `Bailout` when
    /// there is no GPU.
    pub fn open_kfd(config: Config) -> AccelResult<Self> {
        let driver = KfdDriver::discover()?;
        let handles: Vec<_> = (0..driver.device_count() as u64).map(DeviceHandle).collect();
        Self::new(Arc::new(driver), &handles, config)
    }

    #[must_use]
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// # Errors
    /// `DeviceNotFound` for an out-of-range index.
    pub fn get_device_context(&self, index: usize) -> AccelResult<&DeviceContext> {
        let count = self.devices.len();
        self.devices
            .get(index)
            .ok_or(AccelError::DeviceNotFound { index, count })
    }

    /// # Errors
    /// `DeviceNotFound` for an out-of-range index.
    pub fn get_device_context_mut(&mut self, index: usize) -> AccelResult<&mut DeviceContext> {
        let count = self.devices.len();
        self.devices
            .get_mut(index)
            .ok_or(AccelError::DeviceNotFound { index, count })
    }

    /// All device contexts, for driving devices concurrently.
    pub fn device_contexts_mut(&mut self) -> &mut [DeviceContext] {
        &mut self.devices
    }

    /// The command queue bound to device `index`.
    ///
    /// # Errors
    /// `DeviceNotFound` for an out-of-range index.
    pub fn create_command_queue(&mut self, index: usize) -> AccelResult<&mut CommandQueue> {
        Ok(&mut self.get_device_context_mut(index)?.queue)
    }

    /// # Errors
    /// See [`DeviceContext::allocate_memory`].
    pub fn allocate_memory(&mut self, index: usize, num_bytes: u64) -> AccelResult<DevicePtr> {
        self.get_device_context_mut(index)?.allocate_memory(num_bytes)
    }

    /// # Errors
    /// See [`DeviceContext::read_buffer`].
    pub fn read_buffer(
        &mut self,
        index: usize,
        offset: u64,
        bytes: u64,
        host: &HostBuffer,
        host_offset: u64,
    ) -> AccelResult<()> {
        self.get_device_context_mut(index)?
            .read_buffer(offset, bytes, host, host_offset)
    }

    /// # Errors
    /// See [`DeviceContext::enqueue_write_buffer`].
    pub fn enqueue_write_buffer(
        &mut self,
        index: usize,
        offset: u64,
        bytes: u64,
        host: &HostBuffer,
        host_offset: u64,
    ) -> AccelResult<()> {
        self.get_device_context_mut(index)?
            .enqueue_write_buffer(offset, bytes, host, host_offset)
    }

    /// # Errors
    /// See [`DeviceContext::enqueue_write_call_stack`].
    pub fn enqueue_write_call_stack(&mut self, index: usize, frame: &CallStack) -> AccelResult<()> {
        self.get_device_context_mut(index)?
            .enqueue_write_call_stack(frame)
    }

    /// # Errors
    /// See [`DeviceContext::enqueue_barrier`].
    pub fn enqueue_barrier(&mut self, index: usize) -> AccelResult<()> {
        self.get_device_context_mut(index)?.enqueue_barrier()
    }

    /// # Errors
    /// See [`DeviceContext::launch`].
    pub fn launch(&mut self, index: usize, task: &TaskMeta) -> AccelResult<KernelLaunchDescriptor> {
        self.get_device_context_mut(index)?.launch(task)
    }

    /// # Errors
    /// See [`DeviceContext::flush`].
    pub fn flush(&mut self, index: usize) -> AccelResult<()> {
        self.get_device_context_mut(index)?.flush()
    }

    /// # Errors
    /// See [`DeviceContext::reopen`].
    pub fn reopen(&mut self, index: usize) -> AccelResult<()> {
        self.get_device_context_mut(index)?.reopen()
    }

    /// # Errors
    /// `DeviceNotFound` for an out-of-range index.
    pub fn native_failures(&self, index: usize) -> AccelResult<&[NativeCallFailure]> {
        Ok(self.get_device_context(index)?.native_failures())
    }

    /// # Errors
    /// `DeviceNotFound` for an out-of-range index.
    pub fn take_native_failures(&mut self, index: usize) -> AccelResult<Vec<NativeCallFailure>> {
        Ok(self.get_device_context_mut(index)?.take_native_failures())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NativeFailurePolicy;
    use crate::driver::host::{HostDeviceDesc, HostDriver};
    use crate::error::NativeStatus;
    use crate::queue::ListState;

    const MIB: u64 = 1 << 20;

    fn context(policy: NativeFailurePolicy) -> (Arc<HostDriver>, Context) {
        let driver = Arc::new(HostDriver::new(vec![
            HostDeviceDesc::new("host0"),
            HostDeviceDesc::new("host1"),
        ]));
        let config = Config::new()
            .heap_size(MIB)
            .call_stack_limit(4096)
            .native_failure_policy(policy);
        let ctx = Context::new(driver.clone(), &[DeviceHandle(0), DeviceHandle(1)], config).unwrap();
        (driver, ctx)
    }

    #[test]
    fn dropping_context_releases_device_regions() {
        let driver = Arc::new(HostDriver::new(vec![HostDeviceDesc::new("host0")]));
        for _ in 0..3 {
            let mut ctx =
                Context::new(driver.clone(), &[DeviceHandle(0)], Config::new().heap_size(MIB))
                    .unwrap();
            ctx.allocate_memory(0, MIB).unwrap();
            assert_eq!(driver.allocation_count(), 1);
        }
        assert_eq!(driver.allocation_count(), 0);
    }

    #[test]
    fn failed_release_on_drop_is_not_fatal() {
        let (driver, mut ctx) = context(NativeFailurePolicy::Propagate);
        ctx.allocate_memory(0, MIB).unwrap();
        ctx.allocate_memory(1, MIB).unwrap();

        driver.inject_failure("free", NativeStatus::ERROR_DEVICE_LOST);
        drop(ctx);
        // One free failed and leaked its region; the other device still released.
        assert_eq!(driver.allocation_count(), 1);
    }

    #[test]
    fn no_devices_is_a_bailout() {
        let driver = Arc::new(HostDriver::new(Vec::new()));
        let err = Context::new(driver, &[], Config::new()).unwrap_err();
        assert!(err.is_bailout());
    }

    #[test]
    fn kfd_without_driver_is_io_error() {
        if std::path::Path::new("/dev/kfd").exists() {
            return;
        }
        assert!(matches!(
            Context::open_kfd(Config::new()),
            Err(AccelError::Io(_))
        ));
    }

    #[test]
    fn out_of_range_index_is_device_not_found() {
        let (_, mut ctx) = context(NativeFailurePolicy::Continue);
        assert!(matches!(
            ctx.flush(2),
            Err(AccelError::DeviceNotFound { index: 2, count: 2 })
        ));
        assert!(ctx.get_device_context(5).is_err());
        assert!(ctx.create_command_queue(1).is_ok());
    }

    #[test]
    fn region_is_allocated_once() {
        let (driver, mut ctx) = context(NativeFailurePolicy::Continue);
        let ptr = ctx.allocate_memory(0, MIB).unwrap();
        let dc = ctx.get_device_context(0).unwrap();
        assert!(dc.memory().is_initialized());
        assert_eq!(dc.memory().device_buffer_address(), ptr.0);
        assert_eq!(dc.heap_base().unwrap(), ptr);

        assert!(matches!(
            ctx.allocate_memory(0, MIB),
            Err(AccelError::InvalidState(_))
        ));
        assert_eq!(driver.allocation_count(), 1);
    }

    #[test]
    fn write_then_read_round_trips_through_device() {
        let (_, mut ctx) = context(NativeFailurePolicy::Propagate);
        ctx.allocate_memory(0, MIB).unwrap();
        let buf = ctx
            .get_device_context_mut(0)
            .unwrap()
            .memory_mut()
            .allocate(16)
            .unwrap();

        let src = HostBuffer::from_u32s(&[1, 2, 3, 4]);
        let dst = HostBuffer::zeroed(16);
        ctx.enqueue_write_buffer(0, buf.offset(), 16, &src, 0).unwrap();
        ctx.read_buffer(0, buf.offset(), 16, &dst, 0).unwrap();
        assert_eq!(dst.to_u32s(), vec![0; 4]);

        ctx.flush(0).unwrap();
        assert_eq!(dst.to_u32s(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn copies_append_a_barrier() {
        use crate::queue::CommandKind;

        let (_, mut ctx) = context(NativeFailurePolicy::Propagate);
        ctx.allocate_memory(0, MIB).unwrap();
        ctx.enqueue_write_buffer(0, 4096, 8, &HostBuffer::zeroed(8), 0)
            .unwrap();
        let commands = ctx.get_device_context(0).unwrap().queue().commands();
        assert_eq!(
            commands,
            &[CommandKind::Copy(CopyDirection::HostToDevice), CommandKind::Barrier]
        );
    }

    #[test]
    fn copies_are_bounds_checked() {
        let (_, mut ctx) = context(NativeFailurePolicy::Continue);
        let host = HostBuffer::zeroed(8);
        assert!(matches!(
            ctx.enqueue_write_buffer(0, 0, 8, &host, 0),
            Err(AccelError::InvalidState(_))
        ));

        ctx.allocate_memory(0, MIB).unwrap();
        assert!(matches!(
            ctx.enqueue_write_buffer(0, MIB - 4, 8, &host, 0),
            Err(AccelError::InvalidArgument(_))
        ));
        assert!(matches!(
            ctx.enqueue_write_buffer(0, 4096, 8, &host, 4),
            Err(AccelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn call_stack_frame_lands_at_its_offset() {
        let (driver, mut ctx) = context(NativeFailurePolicy::Propagate);
        let base = ctx.allocate_memory(0, MIB).unwrap();

        let dc = ctx.get_device_context_mut(0).unwrap();
        dc.memory_mut().create_call_stack(2).unwrap();
        let mut frame = dc.memory_mut().create_call_stack(2).unwrap();
        frame.push_arg(0xaa).unwrap();
        frame.push_arg(0xbb).unwrap();

        dc.enqueue_write_call_stack(&frame).unwrap();
        dc.flush().unwrap();

        let bytes = driver.peek(base.0 + frame.offset(), frame.to_bytes().len() as u64);
        assert_eq!(bytes, Some(frame.to_bytes()));
        assert_eq!(frame.offset(), 128);
    }

    #[test]
    fn continue_policy_makes_failures_observable() {
        let (driver, mut ctx) = context(NativeFailurePolicy::Continue);
        driver.inject_failure("synchronize", NativeStatus::ERROR_DEVICE_LOST);

        ctx.flush(1).unwrap();
        let failures = ctx.take_native_failures(1).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status, NativeStatus::ERROR_DEVICE_LOST);
        assert!(ctx.native_failures(1).unwrap().is_empty());
        assert!(ctx.native_failures(0).unwrap().is_empty());
        assert_eq!(
            ctx.get_device_context(1).unwrap().queue().state(),
            ListState::Closed
        );
    }
}
