use crate::driver::{DeviceHandle, NativeBoundary, QueueGroupProperties};
use crate::error::{AccelError, AccelResult};

/// One discovered accelerator. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    index: usize,
    handle: DeviceHandle,
    name: String,
    queue_groups: Vec<QueueGroupProperties>,
}

impl Device {
    #[must_use]
    pub fn new(
        index: usize,
        handle: DeviceHandle,
        name: impl Into<String>,
        queue_groups: Vec<QueueGroupProperties>,
    ) -> Self {
        Self {
            index,
            handle,
            name: name.into(),
            queue_groups,
        }
    }

    /// Reads the device's name and queue groups through the driver.
    ///
    /// # Errors
    /// Propagates any driver failure; a device that cannot describe itself is unusable.
    pub fn query(boundary: &NativeBoundary, index: usize, handle: DeviceHandle) -> AccelResult<Self> {
        let driver = boundary.driver();
        let name = boundary.check("device_name", driver.device_name(handle))?;
        let queue_groups = boundary.check(
            "command_queue_group_properties",
            driver.command_queue_group_properties(handle),
        )?;
        tracing::debug!(index, %name, groups = queue_groups.len(), "device discovered");
        Ok(Self::new(index, handle, name, queue_groups))
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn handle(&self) -> DeviceHandle {
        self.handle
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn queue_groups(&self) -> &[QueueGroupProperties] {
        &self.queue_groups
    }

    /// Ordinal of the queue group used for this device's command queue: the
    /// first group flagged compute.
    ///
    /// # Errors
    /// `Bailout` if the device reports no queue groups at all.
    pub fn command_queue_ordinal(&self) -> AccelResult<u32> {
        if self.queue_groups.is_empty() {
            return Err(AccelError::Bailout(format!(
                "number of queue groups is 0 for device: {}",
                self.name
            )));
        }
        match self.queue_groups.iter().position(QueueGroupProperties::is_compute) {
            Some(ordinal) => u32::try_from(ordinal)
                .map_err(|_| AccelError::Internal(format!("queue ordinal {ordinal} out of range"))),
            None => {
                tracing::warn!(device = %self.name, "no compute queue group, using ordinal 0");
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{QUEUE_GROUP_FLAG_COMPUTE, QUEUE_GROUP_FLAG_COPY};

    fn group(flags: u32) -> QueueGroupProperties {
        QueueGroupProperties {
            flags,
            num_queues: 1,
        }
    }

    #[test]
    fn picks_first_compute_group() {
        let dev = Device::new(
            0,
            DeviceHandle(0),
            "gpu",
            vec![
                group(QUEUE_GROUP_FLAG_COPY),
                group(QUEUE_GROUP_FLAG_COMPUTE | QUEUE_GROUP_FLAG_COPY),
                group(QUEUE_GROUP_FLAG_COMPUTE),
            ],
        );
        assert_eq!(dev.command_queue_ordinal().unwrap(), 1);
    }

    #[test]
    fn copy_only_device_falls_back_to_zero() {
        let dev = Device::new(0, DeviceHandle(0), "dma", vec![group(QUEUE_GROUP_FLAG_COPY)]);
        assert_eq!(dev.command_queue_ordinal().unwrap(), 0);
    }

    #[test]
    fn no_queue_groups_bails_out() {
        let dev = Device::new(0, DeviceHandle(0), "empty", Vec::new());
        assert!(dev.command_queue_ordinal().unwrap_err().is_bailout());
    }
}
