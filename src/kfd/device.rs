use crate::kfd::ioctl::{
    AcquireVmArgs, AllocMemoryOfGpuArgs, CreateQueueArgs, DestroyQueueArgs, FreeMemoryOfGpuArgs,
    GetVersionArgs, KFD_IOCTL_MAJOR_VERSION, KfdIoctl, MapMemoryToGpuArgs, UnmapMemoryFromGpuArgs,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

const KFD_PATH: &str = "/dev/kfd";

/// Shared handle to `/dev/kfd`. Clones keep the descriptor open.
#[derive(Clone, Debug)]
pub struct KfdDevice {
    file: Arc<File>,
}

impl KfdDevice {
    /// # Errors
    /// Fails if the KFD node cannot be opened (module not loaded, no permission).
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(KFD_PATH)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Issues the ioctl bound to `A`.
    ///
    /// # Errors
    /// The OS error reported by the kernel.
    pub fn call<A: KfdIoctl>(&self, args: &mut A) -> io::Result<()> {
        // `KfdIoctl` guarantees `A` matches the layout expected for `A::REQUEST`.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                A::REQUEST as _,
                std::ptr::from_mut(args),
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// # Errors
    /// `Unsupported` if the kernel speaks a different major ABI version.
    pub fn get_version(&self) -> io::Result<GetVersionArgs> {
        let mut args = GetVersionArgs::default();
        self.call(&mut args)?;
        if args.major_version != KFD_IOCTL_MAJOR_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("KFD ABI {}.{} not supported", args.major_version, args.minor_version),
            ));
        }
        Ok(args)
    }

    pub fn create_queue(&self, args: &mut CreateQueueArgs) -> io::Result<()> {
        self.call(args)
    }

    pub fn destroy_queue(&self, queue_id: u32) -> io::Result<()> {
        self.call(&mut DestroyQueueArgs { queue_id, pad: 0 })
    }

    /// Binds this process's KFD context to the VM of a render node.
    pub fn acquire_vm(&self, gpu_id: u32, drm_fd: u32) -> io::Result<()> {
        self.call(&mut AcquireVmArgs { drm_fd, gpu_id })
    }

    pub fn alloc_memory_of_gpu(&self, args: &mut AllocMemoryOfGpuArgs) -> io::Result<()> {
        self.call(args)
    }

    pub fn free_memory_of_gpu(&self, handle: u64) -> io::Result<()> {
        self.call(&mut FreeMemoryOfGpuArgs { handle })
    }

    pub fn map_memory_to_gpu(&self, handle: u64, gpu_id: u32) -> io::Result<()> {
        self.call(&mut MapMemoryToGpuArgs {
            handle,
            device_ids_array_ptr: &raw const gpu_id as u64,
            n_devices: 1,
            n_success: 0,
        })
    }

    pub fn unmap_memory_from_gpu(&self, handle: u64, gpu_id: u32) -> io::Result<()> {
        self.call(&mut UnmapMemoryFromGpuArgs {
            handle,
            device_ids_array_ptr: &raw const gpu_id as u64,
            n_devices: 1,
            n_success: 0,
        })
    }
}

impl AsRawFd for KfdDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
