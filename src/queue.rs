//! The per-device command queue and its single in-order command list.

use crate::device::Device;
use crate::driver::{
    CopyCommand, CopyDirection, KernelHandle, ListHandle, NativeBoundary, QueueHandle,
};
use crate::error::{AccelError, AccelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    Open,
    Closed,
}

/// What has been appended to the list since it was last opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Copy(CopyDirection),
    Barrier,
    Launch { grid: [u32; 3] },
}

/// One execution queue plus one command list, bound to a device.
///
/// Enqueue calls append and return immediately. [`flush`](Self::flush) is the
/// only point where the caller waits for the device. Commands run in append
/// order; a barrier is needed for a later command to observe an earlier copy.
#[derive(Debug)]
pub struct CommandQueue {
    device: String,
    ordinal: u32,
    queue: QueueHandle,
    list: ListHandle,
    state: ListState,
    commands: Vec<CommandKind>,
}

impl CommandQueue {
    /// Creates the queue and list on the device's compute ordinal. The list starts open.
    ///
    /// # Errors
    /// `Bailout` for a device without queue groups; driver failures propagate.
    pub fn create(boundary: &NativeBoundary, device: &Device) -> AccelResult<Self> {
        let ordinal = device.command_queue_ordinal()?;
        let driver = boundary.driver();
        let queue = boundary.check(
            "create_command_queue",
            driver.create_command_queue(device.handle(), ordinal),
        )?;
        let list = boundary.check(
            "create_command_list",
            driver.create_command_list(device.handle(), ordinal),
        )?;
        Ok(Self {
            device: device.name().to_owned(),
            ordinal,
            queue,
            list,
            state: ListState::Open,
            commands: Vec::new(),
        })
    }

    #[must_use]
    pub const fn state(&self) -> ListState {
        self.state
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == ListState::Open
    }

    #[must_use]
    pub const fn ordinal(&self) -> u32 {
        self.ordinal
    }

    #[must_use]
    pub const fn queue_handle(&self) -> QueueHandle {
        self.queue
    }

    #[must_use]
    pub const fn list_handle(&self) -> ListHandle {
        self.list
    }

    /// Commands appended since the list was last opened.
    #[must_use]
    pub fn commands(&self) -> &[CommandKind] {
        &self.commands
    }

    /// # Errors
    /// `InvalidState` if the list is closed.
    pub fn ensure_open(&self) -> AccelResult<()> {
        match self.state {
            ListState::Open => Ok(()),
            ListState::Closed => Err(AccelError::InvalidState(format!(
                "command list on {} is closed; reopen it before enqueueing",
                self.device
            ))),
        }
    }

    /// # Errors
    /// `InvalidState` on a closed list; driver failures per the boundary policy.
    pub fn enqueue_copy(
        &mut self,
        boundary: &mut NativeBoundary,
        copy: &CopyCommand,
    ) -> AccelResult<()> {
        self.ensure_open()?;
        let result = boundary.driver().append_memory_copy(self.list, copy);
        if boundary.guard("append_memory_copy", result)?.is_some() {
            self.commands.push(CommandKind::Copy(copy.direction));
        }
        Ok(())
    }

    /// # Errors
    /// `InvalidState` on a closed list; driver failures per the boundary policy.
    pub fn enqueue_barrier(&mut self, boundary: &mut NativeBoundary) -> AccelResult<()> {
        self.ensure_open()?;
        let result = boundary.driver().append_barrier(self.list);
        if boundary.guard("append_barrier", result)?.is_some() {
            self.commands.push(CommandKind::Barrier);
        }
        Ok(())
    }

    /// Appends a launch of `kernel` with its currently bound group size and arguments.
    ///
    /// # Errors
    /// `InvalidState` on a closed list; driver failures per the boundary policy.
    pub fn enqueue_launch(
        &mut self,
        boundary: &mut NativeBoundary,
        kernel: KernelHandle,
        grid: [u32; 3],
    ) -> AccelResult<()> {
        self.ensure_open()?;
        let result = boundary.driver().append_launch_kernel(self.list, kernel, grid);
        if boundary.guard("append_launch_kernel", result)?.is_some() {
            self.commands.push(CommandKind::Launch { grid });
        }
        Ok(())
    }

    /// Closes the list, submits it and blocks until the device has finished.
    /// The list stays closed afterwards.
    ///
    /// # Errors
    /// `InvalidState` if already closed; driver failures per the boundary policy.
    pub fn flush(&mut self, boundary: &mut NativeBoundary) -> AccelResult<()> {
        self.ensure_open()?;
        tracing::debug!(
            device = %self.device,
            commands = self.commands.len(),
            "flushing command list"
        );

        let driver = boundary.driver();
        let closed = driver.close_command_list(self.list);
        self.state = ListState::Closed;
        boundary.guard("close_command_list", closed)?;

        let executed = boundary
            .driver()
            .execute_command_lists(self.queue, std::slice::from_ref(&self.list));
        boundary.guard("execute_command_lists", executed)?;

        let synced = boundary.driver().synchronize(self.queue);
        boundary.guard("synchronize", synced)?;
        Ok(())
    }

    /// Resets the list to open with no commands.
    ///
    /// # Errors
    /// Driver failures per the boundary policy.
    pub fn reopen(&mut self, boundary: &mut NativeBoundary) -> AccelResult<()> {
        let result = boundary.driver().reset_command_list(self.list);
        boundary.guard("reset_command_list", result)?;
        self.state = ListState::Open;
        self.commands.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NativeFailurePolicy;
    use crate::driver::host::{HostDeviceDesc, HostDriver};
    use crate::driver::{DeviceHandle, DevicePtr, Driver, HostBuffer};
    use crate::error::NativeStatus;
    use std::sync::Arc;

    fn setup(policy: NativeFailurePolicy) -> (Arc<HostDriver>, NativeBoundary, CommandQueue) {
        let driver = Arc::new(HostDriver::new(vec![HostDeviceDesc::new("host0")]));
        let boundary = NativeBoundary::new(driver.clone(), policy);
        let device = Device::query(&boundary, 0, DeviceHandle(0)).unwrap();
        let queue = CommandQueue::create(&boundary, &device).unwrap();
        (driver, boundary, queue)
    }

    fn write_of(ptr: DevicePtr, bytes: u64) -> CopyCommand {
        CopyCommand {
            direction: CopyDirection::HostToDevice,
            device_ptr: ptr,
            offset: 0,
            bytes,
            host: HostBuffer::zeroed(bytes as usize),
            host_offset: 0,
        }
    }

    #[test]
    fn uses_compute_ordinal() {
        let (_, _, queue) = setup(NativeFailurePolicy::Continue);
        // Default host groups: COPY first, then COMPUTE|COPY.
        assert_eq!(queue.ordinal(), 1);
        assert!(queue.is_open());
    }

    #[test]
    fn empty_flush_closes_and_blocks_further_enqueue() {
        let (driver, mut boundary, mut queue) = setup(NativeFailurePolicy::Propagate);
        queue.flush(&mut boundary).unwrap();
        assert_eq!(queue.state(), ListState::Closed);
        assert_eq!(driver.executed_lists(), 1);

        assert!(matches!(
            queue.enqueue_barrier(&mut boundary),
            Err(AccelError::InvalidState(_))
        ));
        assert!(matches!(
            queue.flush(&mut boundary),
            Err(AccelError::InvalidState(_))
        ));

        queue.reopen(&mut boundary).unwrap();
        queue.enqueue_barrier(&mut boundary).unwrap();
        assert_eq!(queue.commands(), &[CommandKind::Barrier]);
    }

    #[test]
    fn records_commands_in_order() {
        let (driver, mut boundary, mut queue) = setup(NativeFailurePolicy::Propagate);
        let ptr = driver.allocate_shared(DeviceHandle(0), 64).unwrap();
        queue.enqueue_copy(&mut boundary, &write_of(ptr, 64)).unwrap();
        queue.enqueue_barrier(&mut boundary).unwrap();

        assert_eq!(
            queue.commands(),
            &[CommandKind::Copy(CopyDirection::HostToDevice), CommandKind::Barrier]
        );
        assert_eq!(driver.recorded_commands(queue.list_handle()), Some(2));
    }

    #[test]
    fn continue_policy_records_failed_append() {
        let (driver, mut boundary, mut queue) = setup(NativeFailurePolicy::Continue);
        driver.inject_failure("append_barrier", NativeStatus::ERROR_DEVICE_LOST);

        queue.enqueue_barrier(&mut boundary).unwrap();
        assert!(queue.commands().is_empty());
        assert_eq!(boundary.failures().len(), 1);
        assert_eq!(boundary.failures()[0].call, "append_barrier");
    }

    #[test]
    fn propagate_policy_returns_failed_execute() {
        let (driver, mut boundary, mut queue) = setup(NativeFailurePolicy::Propagate);
        driver.inject_failure("execute_command_lists", NativeStatus::ERROR_DEVICE_LOST);

        let err = queue.flush(&mut boundary).unwrap_err();
        assert!(matches!(err, AccelError::Native(f) if f.call == "execute_command_lists"));
        assert_eq!(queue.state(), ListState::Closed);
    }
}
