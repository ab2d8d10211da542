//! `/dev/kfd` ioctl ABI, limited to what the runtime issues.
//!
//! Each argument struct is tied to its command number through [`KfdIoctl`],
//! so a call site cannot pair a struct with the wrong request.

use crate::utils::{ior, iow, iowr};

pub const KFD_IOCTL_BASE: u32 = 0x4B; // 'K'
pub const KFD_IOCTL_MAJOR_VERSION: u32 = 1;

pub const KFD_IOC_QUEUE_TYPE_COMPUTE_AQL: u32 = 0x2;
pub const KFD_MAX_QUEUE_PERCENTAGE: u32 = 100;

pub const KFD_IOC_ALLOC_MEM_FLAGS_VRAM: u32 = 1 << 0;
pub const KFD_IOC_ALLOC_MEM_FLAGS_GTT: u32 = 1 << 1;
pub const KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL: u32 = 1 << 3;
pub const KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED: u32 = 1 << 25;
pub const KFD_IOC_ALLOC_MEM_FLAGS_COHERENT: u32 = 1 << 26;
pub const KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE: u32 = 1 << 28;
pub const KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC: u32 = 1 << 29;
pub const KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE: u32 = 1 << 30;
pub const KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE: u32 = 1 << 31;

/// An ioctl argument struct together with its request number.
///
/// # Safety
/// `Self` must have exactly the layout the kernel expects for `REQUEST`.
pub unsafe trait KfdIoctl: Copy {
    const REQUEST: u32;
}

macro_rules! kfd_ioctl {
    ($(
        $(#[$meta:meta])*
        $name:ident = $dir:ident($nr:literal) { $($field:ident: $ty:ty),* $(,)? }
    )*) => {$(
        $(#[$meta])*
        #[repr(C)]
        #[derive(Debug, Default, Copy, Clone)]
        pub struct $name {
            $(pub $field: $ty),*
        }

        unsafe impl KfdIoctl for $name {
            const REQUEST: u32 = $dir::<$name>(KFD_IOCTL_BASE, $nr);
        }
    )*};
}

kfd_ioctl! {
    GetVersionArgs = ior(0x01) {
        major_version: u32,
        minor_version: u32,
    }

    /// The driver fills in `queue_id` and `doorbell_offset`.
    CreateQueueArgs = iowr(0x02) {
        ring_base_address: u64,
        write_pointer_address: u64,
        read_pointer_address: u64,
        doorbell_offset: u64,
        ring_size: u32,
        gpu_id: u32,
        queue_type: u32,
        queue_percentage: u32,
        queue_priority: u32,
        queue_id: u32,
        eop_buffer_address: u64,
        eop_buffer_size: u64,
        ctx_save_restore_address: u64,
        ctx_save_restore_size: u32,
        ctl_stack_size: u32,
        sdma_engine_id: u32,
        pad: u32,
    }

    DestroyQueueArgs = iowr(0x03) {
        queue_id: u32,
        pad: u32,
    }

    AcquireVmArgs = iow(0x15) {
        drm_fd: u32,
        gpu_id: u32,
    }

    /// The driver fills in `handle` and `mmap_offset`.
    AllocMemoryOfGpuArgs = iowr(0x16) {
        va_addr: u64,
        size: u64,
        handle: u64,
        mmap_offset: u64,
        gpu_id: u32,
        flags: u32,
    }

    FreeMemoryOfGpuArgs = iow(0x17) {
        handle: u64,
    }

    MapMemoryToGpuArgs = iowr(0x18) {
        handle: u64,
        device_ids_array_ptr: u64,
        n_devices: u32,
        n_success: u32,
    }

    UnmapMemoryFromGpuArgs = iowr(0x19) {
        handle: u64,
        device_ids_array_ptr: u64,
        n_devices: u32,
        n_success: u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers_match_kernel_headers() {
        // Values from <linux/kfd_ioctl.h> on x86_64.
        assert_eq!(GetVersionArgs::REQUEST, 0x8008_4B01);
        assert_eq!(CreateQueueArgs::REQUEST, 0xC060_4B02);
        assert_eq!(AcquireVmArgs::REQUEST, 0x4008_4B15);
        assert_eq!(AllocMemoryOfGpuArgs::REQUEST, 0xC028_4B16);
        assert_eq!(FreeMemoryOfGpuArgs::REQUEST, 0x4008_4B17);
        assert_eq!(MapMemoryToGpuArgs::REQUEST, 0xC018_4B18);
    }
}
