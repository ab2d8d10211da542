#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::kfd::device::KfdDevice;
use crate::kfd::ioctl::{
    AllocMemoryOfGpuArgs, KFD_IOC_ALLOC_MEM_FLAGS_COHERENT, KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL,
    KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE, KFD_IOC_ALLOC_MEM_FLAGS_GTT,
    KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE, KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC,
    KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED, KFD_IOC_ALLOC_MEM_FLAGS_VRAM,
    KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE,
};
use crate::utils::align_up;
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::Arc;

const PAGE_SIZE: u64 = 4096;

/// Flags controlling how a buffer is placed and mapped.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    pub vram: bool,
    pub gtt: bool,
    pub doorbell: bool,
    pub host_access: bool,
    pub read_only: bool,
    pub execute_access: bool,
    pub coherent: bool,
    pub uncached: bool,
    pub no_substitute: bool,
}

impl AllocFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn vram(mut self) -> Self {
        self.vram = true;
        self
    }

    /// System memory; always host-visible and coherent.
    #[must_use]
    pub const fn gtt(mut self) -> Self {
        self.gtt = true;
        self.host_access = true;
        self.coherent = true;
        self
    }

    #[must_use]
    pub const fn doorbell(mut self) -> Self {
        self.doorbell = true;
        self
    }

    #[must_use]
    pub const fn host_access(mut self) -> Self {
        self.host_access = true;
        self
    }

    #[must_use]
    pub const fn executable(mut self) -> Self {
        self.execute_access = true;
        self
    }

    #[must_use]
    pub const fn uncached(mut self) -> Self {
        self.uncached = true;
        self
    }

    #[must_use]
    pub const fn no_substitute(mut self) -> Self {
        self.no_substitute = true;
        self
    }

    /// Raw bitmask for `ALLOC_MEMORY_OF_GPU`.
    #[must_use]
    pub const fn to_kfd_ioctl_flags(self) -> u32 {
        let mut ioc_flags = 0;

        if self.vram {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_VRAM;
            if self.no_substitute {
                ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE;
            }
        }
        if self.gtt {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_GTT;
        }
        if self.doorbell {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL;
        }
        if self.host_access {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC;
        }
        if !self.read_only {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE;
        }
        if self.execute_access {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE;
        }
        if self.coherent {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_COHERENT;
        }
        if self.uncached {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED;
        }

        ioc_flags
    }
}

/// A buffer mapped into the GPU VM. With shared virtual addressing the CPU
/// mapping (when present) lives at the same address as the GPU one.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    /// CPU address, null if the buffer is not host-visible.
    pub ptr: *mut u8,
    pub size: usize,
    pub gpu_va: u64,
    pub handle: u64,
}

// The pointer is an address in this process's VM; ownership is tracked by `GpuMemory`.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    #[must_use]
    pub const fn is_host_visible(&self) -> bool {
        !self.ptr.is_null()
    }

    #[must_use]
    pub const fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.gpu_va
            && match (addr - self.gpu_va).checked_add(len) {
                Some(end) => end <= self.size as u64,
                None => false,
            }
    }
}

/// Per-GPU allocator: reserves a CPU virtual range, backs it with KFD memory,
/// maps it to the GPU, and (for host-visible memory) maps it back over the
/// reservation so CPU and GPU addresses coincide.
#[derive(Debug)]
pub struct GpuMemory {
    device: KfdDevice,
    gpu_id: u32,
    drm: Arc<File>,
    allocations: BTreeMap<u64, Allocation>,
}

impl GpuMemory {
    #[must_use]
    pub fn new(device: KfdDevice, gpu_id: u32, drm: Arc<File>) -> Self {
        Self {
            device,
            gpu_id,
            drm,
            allocations: BTreeMap::new(),
        }
    }

    /// # Errors
    /// Returns the OS error of the failing mmap or ioctl. Partially created
    /// resources are released before returning.
    pub fn allocate(&mut self, size: usize, flags: AllocFlags) -> io::Result<Allocation> {
        let size = align_up(size.max(1) as u64, PAGE_SIZE) as usize;
        let va_addr = reserve_va(size)?;

        let mut args = AllocMemoryOfGpuArgs {
            va_addr,
            size: size as u64,
            handle: 0,
            mmap_offset: 0,
            gpu_id: self.gpu_id,
            flags: flags.to_kfd_ioctl_flags(),
        };

        if let Err(e) = self.device.alloc_memory_of_gpu(&mut args) {
            tracing::debug!(size, flags = args.flags, error = %e, "KFD alloc failed");
            release_va(va_addr, size);
            return Err(e);
        }

        if let Err(e) = self.device.map_memory_to_gpu(args.handle, self.gpu_id) {
            self.device.free_memory_of_gpu(args.handle).ok();
            release_va(va_addr, size);
            return Err(e);
        }

        let mut cpu_ptr = ptr::null_mut();
        if flags.host_access || flags.doorbell {
            let fd = if flags.doorbell {
                self.device.as_raw_fd()
            } else {
                self.drm.as_raw_fd()
            };
            match map_fixed(va_addr, size, fd, args.mmap_offset) {
                Ok(p) => cpu_ptr = p,
                Err(e) => {
                    self.device
                        .unmap_memory_from_gpu(args.handle, self.gpu_id)
                        .ok();
                    self.device.free_memory_of_gpu(args.handle).ok();
                    release_va(va_addr, size);
                    return Err(e);
                }
            }
        }

        let allocation = Allocation {
            ptr: cpu_ptr,
            size,
            gpu_va: va_addr,
            handle: args.handle,
        };
        self.allocations.insert(va_addr, allocation);
        Ok(allocation)
    }

    /// Maps the doorbell page that contains `doorbell_offset`.
    ///
    /// # Errors
    /// Returns the OS error of the failing mmap or ioctl.
    pub fn map_doorbell(&mut self, doorbell_offset: u64, page_size: usize) -> io::Result<*mut u8> {
        let va_addr = reserve_va(page_size)?;
        let mut args = AllocMemoryOfGpuArgs {
            va_addr,
            size: page_size as u64,
            handle: 0,
            mmap_offset: 0,
            gpu_id: self.gpu_id,
            flags: KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL
                | KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE
                | KFD_IOC_ALLOC_MEM_FLAGS_COHERENT
                | KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE,
        };

        if let Err(e) = self.device.alloc_memory_of_gpu(&mut args) {
            release_va(va_addr, page_size);
            return Err(e);
        }

        let cpu_ptr = match map_fixed(va_addr, page_size, self.device.as_raw_fd(), doorbell_offset)
        {
            Ok(p) => p,
            Err(e) => {
                self.device.free_memory_of_gpu(args.handle).ok();
                release_va(va_addr, page_size);
                return Err(e);
            }
        };

        self.allocations.insert(
            va_addr,
            Allocation {
                ptr: cpu_ptr,
                size: page_size,
                gpu_va: va_addr,
                handle: args.handle,
            },
        );
        Ok(cpu_ptr)
    }

    /// Host pointer for `[addr, addr + len)`, if that range lies inside one
    /// host-visible allocation.
    #[must_use]
    pub fn host_range(&self, addr: u64, len: u64) -> Option<*mut u8> {
        let (_, alloc) = self.allocations.range(..=addr).next_back()?;
        if !alloc.is_host_visible() || !alloc.contains(addr, len) {
            return None;
        }
        // Offset is bounded by `alloc.size`.
        Some(unsafe { alloc.ptr.add((addr - alloc.gpu_va) as usize) })
    }

    /// # Errors
    /// `InvalidInput` if `gpu_va` is not the base of a live allocation.
    pub fn free(&mut self, gpu_va: u64) -> io::Result<()> {
        let alloc = self
            .allocations
            .remove(&gpu_va)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.release(&alloc);
        Ok(())
    }

    fn release(&self, alloc: &Allocation) {
        // Unmapping from the GPU fails for doorbells, which are never GPU-mapped.
        self.device
            .unmap_memory_from_gpu(alloc.handle, self.gpu_id)
            .ok();
        if let Err(e) = self.device.free_memory_of_gpu(alloc.handle) {
            tracing::warn!(gpu_va = alloc.gpu_va, error = %e, "KFD free failed");
        }
        release_va(alloc.gpu_va, alloc.size);
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }
}

impl Drop for GpuMemory {
    fn drop(&mut self) {
        for alloc in std::mem::take(&mut self.allocations).into_values() {
            self.release(&alloc);
        }
    }
}

fn reserve_va(size: usize) -> io::Result<u64> {
    let ret = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u64)
}

fn release_va(addr: u64, size: usize) {
    unsafe {
        libc::munmap(addr as *mut libc::c_void, size);
    }
}

fn map_fixed(addr: u64, size: usize, fd: i32, offset: u64) -> io::Result<*mut u8> {
    let ret = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ret.cast::<u8>())
}
