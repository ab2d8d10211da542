use crate::config::Config;
use crate::driver::{DeviceHandle, DevicePtr, NativeBoundary};
use crate::error::{AccelError, AccelResult};
use crate::mm::buffer::{Buffer, CallStack};
use crate::utils::{align, human_readable_bytes};

/// Call-stack frames start on this boundary.
pub const CALL_STACK_ALIGNMENT: u64 = 128;

/// Bump allocator over one device region.
///
/// The region is `[0, call_stack_limit)` for call-stack frames followed by
/// `[call_stack_limit, heap_limit)` for heap buffers. Offsets are relative to
/// the region base until translated with
/// [`to_absolute_device_address`](Self::to_absolute_device_address). Nothing
/// is freed individually; [`reset`](Self::reset) rewinds both regions.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    device_name: String,
    call_stack_limit: u64,
    call_stack_position: u64,
    heap_limit: u64,
    heap_position: u64,
    heap_alignment: u64,
    shared_memory: bool,
    device_heap_pointer: Option<DevicePtr>,
    device_buffer_address: u64,
    initialized: bool,
}

impl MemoryManager {
    #[must_use]
    pub fn new(device_name: impl Into<String>, config: &Config) -> Self {
        let mut mm = Self {
            device_name: device_name.into(),
            call_stack_limit: config.call_stack_limit,
            call_stack_position: 0,
            heap_limit: config.heap_size,
            heap_position: 0,
            heap_alignment: config.heap_alignment,
            shared_memory: config.shared_memory,
            device_heap_pointer: None,
            device_buffer_address: 0,
            initialized: false,
        };
        mm.reset();
        mm
    }

    /// Rewinds both regions. Every offset handed out before is invalid afterwards.
    pub fn reset(&mut self) {
        self.call_stack_position = 0;
        self.heap_position = self.call_stack_limit;
        tracing::debug!(
            base = format_args!("0x{:x}", self.device_buffer_address),
            size = %human_readable_bytes(self.heap_limit),
            device = %self.device_name,
            "reset heap"
        );
    }

    /// Reserves a frame for `max_args` arguments.
    ///
    /// # Errors
    /// `Bailout` when the call-stack region is exhausted; the caller should
    /// fall back to host execution.
    pub fn create_call_stack(&mut self, max_args: usize) -> AccelResult<CallStack> {
        let frame = CallStack::new(self.call_stack_position, max_args);
        let next = frame.as_ref().and_then(|frame| {
            self.call_stack_position
                .checked_add(frame.size())
                .filter(|&end| end < self.call_stack_limit)
                .and_then(|end| align(end, CALL_STACK_ALIGNMENT))
                .filter(|&next| next <= self.call_stack_limit)
        });

        match (frame, next) {
            (Some(frame), Some(next)) => {
                self.call_stack_position = next;
                Ok(frame)
            }
            _ => {
                tracing::debug!(
                    device = %self.device_name,
                    max_args,
                    remaining = self.call_stack_remaining(),
                    "call stack exhausted"
                );
                Err(AccelError::Bailout(
                    "[Deoptimizing] Out of call-stack memory".into(),
                ))
            }
        }
    }

    /// Reserves `bytes_to_allocate` bytes whose data (after a `header_size`
    /// byte header) starts on an `alignment` boundary. Returns the header offset.
    ///
    /// # Errors
    /// `OutOfMemory` when the heap cannot fit the request.
    pub fn try_allocate(
        &mut self,
        bytes_to_allocate: u64,
        header_size: u64,
        alignment: u64,
    ) -> AccelResult<u64> {
        let header_start = self
            .heap_position
            .checked_add(header_size)
            .and_then(|p| align(p, alignment))
            .map(|data_start| data_start - header_size);

        match header_start.and_then(|h| h.checked_add(bytes_to_allocate).map(|end| (h, end))) {
            Some((header_start, end)) if end < self.heap_limit => {
                self.heap_position = end;
                Ok(header_start)
            }
            _ => {
                let err = AccelError::OutOfMemory {
                    device: self.device_name.clone(),
                    required: bytes_to_allocate,
                    available: self.heap_remaining(),
                    limit: self.heap_limit,
                };
                tracing::warn!(device = %self.device_name, %err, "heap allocation failed");
                Err(err)
            }
        }
    }

    /// Heap buffer of `bytes` bytes using the configured alignment.
    ///
    /// # Errors
    /// See [`try_allocate`](Self::try_allocate).
    pub fn allocate(&mut self, bytes: u64) -> AccelResult<Buffer> {
        let offset = self.try_allocate(bytes, 0, self.heap_alignment)?;
        Ok(Buffer::new(offset, bytes))
    }

    /// View of `[offset, offset + bytes)` in the region. No allocation happens.
    ///
    /// # Errors
    /// `InvalidArgument` if the view leaves the region.
    pub fn sub_buffer(&self, offset: u64, bytes: u64) -> AccelResult<Buffer> {
        Buffer::new(0, self.heap_limit).sub_buffer(offset, bytes)
    }

    /// # Errors
    /// `InvalidState` before [`init`](Self::init); `Internal` if the sum
    /// would wrap around.
    pub fn to_absolute_device_address(&self, addr: u64) -> AccelResult<u64> {
        if !self.initialized {
            return Err(AccelError::InvalidState(format!(
                "device heap on {} is not initialized",
                self.device_name
            )));
        }
        addr.checked_add(self.device_buffer_address).ok_or_else(|| {
            AccelError::Internal(format!(
                "absolute address may have wrapped around: {addr} + {}",
                self.device_buffer_address
            ))
        })
    }

    /// Translates an absolute address inside `[base, base + heap_limit]` back
    /// to an offset; anything else is returned unchanged.
    #[must_use]
    pub const fn to_relative_device_address(&self, addr: u64) -> u64 {
        let base = self.device_buffer_address;
        match base.checked_add(self.heap_limit) {
            Some(limit) if addr >= base && addr <= limit => addr - base,
            None if addr >= base => addr - base,
            _ => addr,
        }
    }

    /// Records the absolute base address of the region.
    ///
    /// # Errors
    /// `InvalidState` if called twice.
    pub fn init(&mut self, base_address: u64) -> AccelResult<()> {
        if self.initialized {
            return Err(AccelError::InvalidState(format!(
                "device heap on {} already initialized at 0x{:x}",
                self.device_name, self.device_buffer_address
            )));
        }
        self.device_buffer_address = base_address;
        self.initialized = true;
        tracing::info!(
            base = format_args!("0x{base_address:x}"),
            size = %human_readable_bytes(self.heap_limit),
            device = %self.device_name,
            "located heap"
        );
        Ok(())
    }

    /// Allocates the region on `device`, shared or device-local as
    /// configured, and adopts `num_bytes` as the heap limit once the driver
    /// succeeds. Allocation failures always propagate.
    ///
    /// # Errors
    /// `InvalidArgument` if the call-stack region does not fit, or the
    /// driver failure.
    pub fn allocate_device_memory_regions(
        &mut self,
        boundary: &NativeBoundary,
        device: DeviceHandle,
        num_bytes: u64,
    ) -> AccelResult<DevicePtr> {
        if num_bytes < self.call_stack_limit {
            return Err(AccelError::InvalidArgument(format!(
                "region of {num_bytes} bytes cannot hold a {}-byte call stack",
                self.call_stack_limit
            )));
        }
        let driver = boundary.driver();
        let ptr = if self.shared_memory {
            boundary.check("allocate_shared", driver.allocate_shared(device, num_bytes))?
        } else {
            boundary.check("allocate_device", driver.allocate_device(device, num_bytes))?
        };
        self.heap_limit = num_bytes;
        self.heap_position = self.heap_position.max(self.call_stack_limit);
        self.device_heap_pointer = Some(ptr);
        Ok(ptr)
    }

    /// Device pointer of the region, once allocated.
    #[must_use]
    pub const fn to_buffer(&self) -> Option<DevicePtr> {
        self.device_heap_pointer
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub const fn uses_shared_memory(&self) -> bool {
        self.shared_memory
    }

    #[must_use]
    pub const fn device_buffer_address(&self) -> u64 {
        self.device_buffer_address
    }

    #[must_use]
    pub const fn call_stack_size(&self) -> u64 {
        self.call_stack_limit
    }

    #[must_use]
    pub const fn call_stack_allocated(&self) -> u64 {
        self.call_stack_position
    }

    #[must_use]
    pub const fn call_stack_remaining(&self) -> u64 {
        self.call_stack_limit.saturating_sub(self.call_stack_position)
    }

    #[must_use]
    pub const fn heap_limit(&self) -> u64 {
        self.heap_limit
    }

    #[must_use]
    pub const fn heap_position(&self) -> u64 {
        self.heap_position
    }

    /// Size of the heap region, excluding the call stack.
    #[must_use]
    pub const fn heap_size(&self) -> u64 {
        self.heap_limit.saturating_sub(self.call_stack_limit)
    }

    #[must_use]
    pub const fn heap_allocated(&self) -> u64 {
        self.heap_position.saturating_sub(self.call_stack_limit)
    }

    #[must_use]
    pub const fn heap_remaining(&self) -> u64 {
        self.heap_limit.saturating_sub(self.heap_position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NativeFailurePolicy;
    use crate::driver::Driver;
    use crate::driver::host::{HostDeviceDesc, HostDriver};
    use std::sync::Arc;

    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;

    fn manager(heap: u64, call_stack: u64) -> MemoryManager {
        let config = Config::new().heap_size(heap).call_stack_limit(call_stack);
        MemoryManager::new("test-device", &config)
    }

    #[test]
    fn fresh_manager_layout() {
        let mm = manager(MIB, 64 * KIB);
        assert_eq!(mm.call_stack_allocated(), 0);
        assert_eq!(mm.heap_position(), 64 * KIB);
        assert_eq!(mm.heap_size(), MIB - 64 * KIB);
        assert_eq!(mm.heap_allocated(), 0);
        assert!(!mm.is_initialized());
    }

    #[test]
    fn call_stack_advances_to_128_byte_boundary() {
        let mut mm = manager(MIB, 64 * KIB);
        let first = mm.create_call_stack(1).unwrap();
        assert_eq!(first.offset(), 0);
        assert_eq!(mm.call_stack_allocated(), 128);

        let second = mm.create_call_stack(20).unwrap();
        assert_eq!(second.offset(), 128);
        assert!(!first.buffer().overlaps(&second.buffer()));
        assert_eq!(mm.call_stack_allocated() % CALL_STACK_ALIGNMENT, 0);
    }

    #[test]
    fn call_stack_exhaustion_is_a_bailout() {
        let mut mm = manager(MIB, 1024);
        // A frame that ends exactly at the limit is rejected (strict bound).
        let slots = (1024 / 8) as usize - crate::mm::buffer::RESERVED_SLOTS;
        let err = mm.create_call_stack(slots).unwrap_err();
        assert!(err.is_bailout());
        assert_eq!(mm.call_stack_allocated(), 0);
        assert!(mm.create_call_stack(slots - 1).is_ok());
    }

    #[test]
    fn unaligned_limit_never_overshoots() {
        let mut mm = manager(MIB, 1000);
        // 992-byte frame fits, but rounding its end up to 128 would reach 1024.
        let err = mm.create_call_stack(121).unwrap_err();
        assert!(err.is_bailout());
        assert_eq!(mm.call_stack_allocated(), 0);
        assert_eq!(mm.call_stack_remaining(), 1000);

        mm.create_call_stack(100).unwrap();
        assert_eq!(mm.call_stack_allocated(), 896);
        assert!(mm.create_call_stack(0).is_err());
        assert!(mm.call_stack_allocated() <= mm.call_stack_size());
        assert_eq!(mm.call_stack_remaining(), 104);
    }

    #[test]
    fn unaddressable_frame_is_a_bailout() {
        let mut mm = manager(MIB, 64 * KIB);
        assert!(mm.create_call_stack(1 << 61).unwrap_err().is_bailout());
        assert!(mm.create_call_stack(usize::MAX).unwrap_err().is_bailout());
        assert_eq!(mm.call_stack_allocated(), 0);
    }

    #[test]
    fn try_allocate_aligns_data_after_header() {
        let mut mm = manager(MIB, 4096);
        let h = mm.try_allocate(100, 24, 64).unwrap();
        assert_eq!((h + 24) % 64, 0);
        assert_eq!(h, 4096 + 64 - 24);
        assert_eq!(mm.heap_position(), h + 100);

        let h2 = mm.try_allocate(8, 0, 24).unwrap();
        assert_eq!(h2 % 24, 0);
        assert!(h2 >= h + 100);
    }

    #[test]
    fn out_of_memory_reports_required_and_available() {
        let mut mm = manager(MIB, 64 * KIB);
        mm.create_call_stack(4096 - crate::mm::buffer::RESERVED_SLOTS)
            .unwrap();
        assert_eq!(mm.call_stack_allocated(), 32 * KIB);

        let err = mm.try_allocate(2 * MIB, 0, 64).unwrap_err();
        match err {
            AccelError::OutOfMemory {
                required,
                available,
                limit,
                ..
            } => {
                assert_eq!(required, 2_097_152);
                assert!(available <= 1_040_384);
                assert_eq!(limit, MIB);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mm.heap_position(), 64 * KIB);
    }

    #[test]
    fn reset_reproduces_first_offset() {
        let mut mm = manager(MIB, 8 * KIB);
        let first = mm.try_allocate(1000, 16, 256).unwrap();
        mm.try_allocate(5000, 0, 64).unwrap();
        mm.create_call_stack(4).unwrap();
        mm.reset();
        assert_eq!(mm.call_stack_allocated(), 0);
        assert_eq!(mm.try_allocate(1000, 16, 256).unwrap(), first);
    }

    #[test]
    fn address_translation() {
        let mut mm = manager(MIB, 8 * KIB);
        assert!(matches!(
            mm.to_absolute_device_address(0),
            Err(AccelError::InvalidState(_))
        ));

        mm.init(0x7000_0000).unwrap();
        assert!(matches!(mm.init(0x8000_0000), Err(AccelError::InvalidState(_))));

        assert_eq!(mm.to_absolute_device_address(0x40).unwrap(), 0x7000_0040);
        assert_eq!(mm.to_relative_device_address(0x7000_0040), 0x40);
        assert_eq!(mm.to_relative_device_address(0x7000_0000 + MIB), MIB);
        // Already relative or foreign addresses pass through.
        assert_eq!(mm.to_relative_device_address(0x40), 0x40);
        assert_eq!(mm.to_relative_device_address(0x7000_0000 + MIB + 1), 0x7000_0000 + MIB + 1);
    }

    #[test]
    fn absolute_address_overflow_is_internal() {
        let mut mm = manager(MIB, 8 * KIB);
        mm.init(u64::MAX - 4).unwrap();
        assert!(matches!(
            mm.to_absolute_device_address(16),
            Err(AccelError::Internal(_))
        ));
    }

    #[test]
    fn allocates_region_through_driver() {
        let driver = Arc::new(HostDriver::new(vec![HostDeviceDesc::new("host0")]));
        let boundary = NativeBoundary::new(driver.clone(), NativeFailurePolicy::Continue);
        let mut mm = manager(MIB, 8 * KIB);

        let ptr = mm
            .allocate_device_memory_regions(&boundary, DeviceHandle(0), 2 * MIB)
            .unwrap();
        assert_eq!(mm.heap_limit(), 2 * MIB);
        assert_eq!(mm.to_buffer(), Some(ptr));
        assert_eq!(driver.allocation_count(), 1);
        assert_eq!(driver.name(), "host");
    }

    #[test]
    fn region_allocation_failure_propagates_under_continue() {
        let driver = Arc::new(HostDriver::new(vec![HostDeviceDesc::new("host0")]));
        driver.inject_failure(
            "allocate_shared",
            crate::error::NativeStatus::ERROR_OUT_OF_DEVICE_MEMORY,
        );
        let boundary = NativeBoundary::new(driver, NativeFailurePolicy::Continue);
        let mut mm = manager(MIB, 8 * KIB);

        let err = mm
            .allocate_device_memory_regions(&boundary, DeviceHandle(0), 2 * MIB)
            .unwrap_err();
        assert!(matches!(err, AccelError::Native(_)));
        assert!(mm.to_buffer().is_none());
        assert_eq!(mm.heap_limit(), MIB);
        assert_eq!(mm.heap_position(), 8 * KIB);
    }
}
