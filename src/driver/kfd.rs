//! AMD KFD backend.
//!
//! Each GPU node gets its render node opened and its VM acquired. Lists are
//! recorded on the host and replayed on `execute`: launches become AQL
//! dispatch packets, barriers set the barrier bit of the next packet, and host
//! copies are done by the CPU through the shared-virtual mapping once every
//! earlier packet has completed.

use super::{
    CopyCommand, CopyDirection, DeviceHandle, DevicePtr, Driver, KernelArg, KernelHandle,
    ListHandle, NativeResult, QUEUE_GROUP_FLAG_COMPUTE, QUEUE_GROUP_FLAG_COPY, QueueGroupProperties,
    QueueHandle, fit_group_size,
};
use crate::error::NativeStatus;
use crate::kfd::aql::{KernelDispatchPacket, pack_kernargs};
use crate::kfd::device::KfdDevice;
use crate::kfd::memory::{AllocFlags, GpuMemory};
use crate::kfd::queue::{AqlQueue, QueueBuilder};
use crate::kfd::sysfs::{self, HsaNodeProperties};
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

const MAX_WORKGROUP_SIZE: u32 = 1024;
const SUGGESTED_WORKGROUP_SIZE: u32 = 256;

/// A kernel already resident in GPU memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KfdKernelObject {
    /// GPU address of the kernel descriptor.
    pub descriptor_va: u64,
    pub kernarg_size: u32,
    pub group_segment_size: u32,
    pub private_segment_size: u32,
}

#[derive(Debug, Clone)]
enum KfdCommand {
    Copy(CopyCommand),
    Barrier,
    Launch {
        object: KfdKernelObject,
        grid: [u32; 3],
        group: [u32; 3],
        args: Vec<KernelArg>,
    },
}

#[derive(Debug)]
struct KfdList {
    gpu: usize,
    closed: bool,
    commands: Vec<KfdCommand>,
}

#[derive(Debug)]
struct KfdKernel {
    gpu: usize,
    object: KfdKernelObject,
    group: [u32; 3],
    args: BTreeMap<u32, KernelArg>,
}

#[derive(Debug)]
struct KfdQueue {
    gpu: usize,
    aql: AqlQueue,
}

#[derive(Debug)]
struct KfdGpu {
    props: HsaNodeProperties,
    memory: GpuMemory,
}

#[derive(Debug, Default)]
struct KfdState {
    gpus: Vec<KfdGpu>,
    queues: HashMap<u64, KfdQueue>,
    lists: HashMap<u64, KfdList>,
    kernels: HashMap<u64, KfdKernel>,
    next_handle: u64,
}

impl KfdState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn gpu(&self, device: DeviceHandle) -> NativeResult<usize> {
        usize::try_from(device.0)
            .ok()
            .filter(|&i| i < self.gpus.len())
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)
    }

    fn open_list(&mut self, list: ListHandle) -> NativeResult<&mut KfdList> {
        let entry = self
            .lists
            .get_mut(&list.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
        if entry.closed {
            return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
        }
        Ok(entry)
    }

    fn allocate(
        &mut self,
        device: DeviceHandle,
        bytes: u64,
        flags: AllocFlags,
    ) -> NativeResult<DevicePtr> {
        let gpu = self.gpu(device)?;
        let size = usize::try_from(bytes).map_err(|_| NativeStatus::ERROR_OUT_OF_DEVICE_MEMORY)?;
        let alloc = self.gpus[gpu]
            .memory
            .allocate(size, flags)
            .map_err(|e| NativeStatus::from_io(&e))?;
        Ok(DevicePtr(alloc.gpu_va))
    }
}

/// The KFD driver.
#[derive(Debug)]
pub struct KfdDriver {
    device: KfdDevice,
    state: Mutex<KfdState>,
}

impl KfdDriver {
    /// Opens `/dev/kfd` and every GPU node in the system topology.
    ///
    /// # Errors
    /// Returns the OS error when KFD is missing or a render node cannot be
    /// opened. A system without GPU nodes yields a driver with no devices.
    pub fn discover() -> io::Result<Self> {
        let device = KfdDevice::open()?;
        let version = device.get_version()?;
        tracing::info!(
            major = version.major_version,
            minor = version.minor_version,
            "opened KFD"
        );

        let mut gpus = Vec::new();
        for props in sysfs::gpu_nodes()? {
            let Some(path) = props.render_node_path() else {
                tracing::warn!(node = props.node_id, "GPU node without render node, skipped");
                continue;
            };
            let drm = OpenOptions::new().read(true).write(true).open(&path)?;
            #[allow(clippy::cast_sign_loss)]
            device.acquire_vm(props.kfd_gpu_id, drm.as_raw_fd() as u32)?;

            tracing::info!(
                node = props.node_id,
                gpu_id = props.kfd_gpu_id,
                name = %props.marketing_name,
                isa = %props.isa_name(),
                "found GPU"
            );
            let memory = GpuMemory::new(device.clone(), props.kfd_gpu_id, Arc::new(drm));
            gpus.push(KfdGpu { props, memory });
        }

        Ok(Self {
            device,
            state: Mutex::new(KfdState {
                gpus,
                ..KfdState::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, KfdState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.lock().gpus.len()
    }

    /// Registers a kernel whose code object is already loaded on `device`.
    ///
    /// # Errors
    /// `ERROR_INVALID_NULL_HANDLE` for an unknown device.
    pub fn register_kernel(
        &self,
        device: DeviceHandle,
        object: KfdKernelObject,
    ) -> NativeResult<KernelHandle> {
        let mut state = self.lock();
        let gpu = state.gpu(device)?;
        let id = state.handle();
        state.kernels.insert(
            id,
            KfdKernel {
                gpu,
                object,
                group: [1, 1, 1],
                args: BTreeMap::new(),
            },
        );
        Ok(KernelHandle(id))
    }
}

fn run_copy(memory: &GpuMemory, copy: &CopyCommand) -> NativeResult<()> {
    let addr = copy
        .device_ptr
        .0
        .checked_add(copy.offset)
        .ok_or(NativeStatus::ERROR_INVALID_SIZE)?;
    let device_bytes = memory
        .host_range(addr, copy.bytes)
        .ok_or(NativeStatus::ERROR_INVALID_ARGUMENT)?;

    let start = usize::try_from(copy.host_offset).map_err(|_| NativeStatus::ERROR_INVALID_SIZE)?;
    let len = usize::try_from(copy.bytes).map_err(|_| NativeStatus::ERROR_INVALID_SIZE)?;
    let mut host = copy.host.lock();
    let host_bytes = host
        .get_mut(start..start.saturating_add(len))
        .ok_or(NativeStatus::ERROR_INVALID_SIZE)?;

    // `host_range` guarantees `len` mapped bytes at `device_bytes`.
    unsafe {
        match copy.direction {
            CopyDirection::HostToDevice => {
                ptr::copy_nonoverlapping(host_bytes.as_ptr(), device_bytes, len);
            }
            CopyDirection::DeviceToHost => {
                ptr::copy_nonoverlapping(device_bytes, host_bytes.as_mut_ptr(), len);
            }
        }
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn dims_of(grid: [u32; 3], group: [u32; 3]) -> u16 {
    if grid[2] * group[2] > 1 {
        3
    } else if grid[1] * group[1] > 1 {
        2
    } else {
        1
    }
}

impl Driver for KfdDriver {
    fn name(&self) -> &str {
        "kfd"
    }

    fn device_name(&self, device: DeviceHandle) -> NativeResult<String> {
        let state = self.lock();
        let gpu = state.gpu(device)?;
        Ok(state.gpus[gpu].props.marketing_name.clone())
    }

    fn command_queue_group_properties(
        &self,
        device: DeviceHandle,
    ) -> NativeResult<Vec<QueueGroupProperties>> {
        self.lock().gpu(device)?;
        Ok(vec![QueueGroupProperties {
            flags: QUEUE_GROUP_FLAG_COMPUTE | QUEUE_GROUP_FLAG_COPY,
            num_queues: 1,
        }])
    }

    fn create_command_queue(
        &self,
        device: DeviceHandle,
        ordinal: u32,
    ) -> NativeResult<QueueHandle> {
        if ordinal != 0 {
            return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
        }
        let mut state = self.lock();
        let gpu = state.gpu(device)?;
        let KfdGpu { props, memory } = &mut state.gpus[gpu];
        let aql = QueueBuilder::new(&self.device, memory, props)
            .create()
            .map_err(|e| NativeStatus::from_io(&e))?;

        let id = state.handle();
        state.queues.insert(id, KfdQueue { gpu, aql });
        Ok(QueueHandle(id))
    }

    fn create_command_list(&self, device: DeviceHandle, ordinal: u32) -> NativeResult<ListHandle> {
        if ordinal != 0 {
            return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
        }
        let mut state = self.lock();
        let gpu = state.gpu(device)?;
        let id = state.handle();
        state.lists.insert(
            id,
            KfdList {
                gpu,
                closed: false,
                commands: Vec::new(),
            },
        );
        Ok(ListHandle(id))
    }

    fn allocate_shared(&self, device: DeviceHandle, bytes: u64) -> NativeResult<DevicePtr> {
        self.lock().allocate(device, bytes, AllocFlags::new().gtt())
    }

    fn allocate_device(&self, device: DeviceHandle, bytes: u64) -> NativeResult<DevicePtr> {
        // Host-visible VRAM so host copies can stay CPU copies.
        self.lock()
            .allocate(device, bytes, AllocFlags::new().vram().host_access())
    }

    fn free(&self, device: DeviceHandle, ptr: DevicePtr) -> NativeResult<()> {
        let mut state = self.lock();
        let gpu = state.gpu(device)?;
        state.gpus[gpu]
            .memory
            .free(ptr.0)
            .map_err(|_| NativeStatus::ERROR_INVALID_ARGUMENT)
    }

    fn append_memory_copy(&self, list: ListHandle, copy: &CopyCommand) -> NativeResult<()> {
        let mut state = self.lock();
        let gpu = state
            .lists
            .get(&list.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?
            .gpu;
        let addr = copy
            .device_ptr
            .0
            .checked_add(copy.offset)
            .ok_or(NativeStatus::ERROR_INVALID_SIZE)?;
        if state.gpus[gpu].memory.host_range(addr, copy.bytes).is_none() {
            return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
        }
        state
            .open_list(list)?
            .commands
            .push(KfdCommand::Copy(copy.clone()));
        Ok(())
    }

    fn append_barrier(&self, list: ListHandle) -> NativeResult<()> {
        self.lock()
            .open_list(list)?
            .commands
            .push(KfdCommand::Barrier);
        Ok(())
    }

    fn append_launch_kernel(
        &self,
        list: ListHandle,
        kernel: KernelHandle,
        grid: [u32; 3],
    ) -> NativeResult<()> {
        let mut state = self.lock();
        let entry = state
            .kernels
            .get(&kernel.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
        let arg_count = entry.args.keys().next_back().map_or(0, |&max| max + 1);
        let args = (0..arg_count)
            .map(|i| entry.args.get(&i).cloned())
            .collect::<Option<Vec<_>>>()
            .ok_or(NativeStatus::ERROR_INVALID_ARGUMENT)?;
        let command = KfdCommand::Launch {
            object: entry.object,
            grid,
            group: entry.group,
            args,
        };
        let kernel_gpu = entry.gpu;

        let target = state.open_list(list)?;
        if target.gpu != kernel_gpu {
            return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
        }
        target.commands.push(command);
        Ok(())
    }

    fn close_command_list(&self, list: ListHandle) -> NativeResult<()> {
        self.lock().open_list(list)?.closed = true;
        Ok(())
    }

    fn reset_command_list(&self, list: ListHandle) -> NativeResult<()> {
        let mut state = self.lock();
        let entry = state
            .lists
            .get_mut(&list.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
        entry.closed = false;
        entry.commands.clear();
        Ok(())
    }

    fn execute_command_lists(
        &self,
        queue: QueueHandle,
        lists: &[ListHandle],
    ) -> NativeResult<()> {
        let mut guard = self.lock();
        let KfdState {
            gpus,
            queues,
            lists: recorded,
            ..
        } = &mut *guard;
        let queue = queues
            .get_mut(&queue.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
        let memory = &gpus[queue.gpu].memory;

        for list in lists {
            let entry = recorded
                .get(&list.0)
                .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
            if !entry.closed || entry.gpu != queue.gpu {
                return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
            }

            let mut barrier = false;
            for command in &entry.commands {
                match command {
                    KfdCommand::Copy(copy) => {
                        queue.aql.wait_idle();
                        run_copy(memory, copy)?;
                    }
                    KfdCommand::Barrier => barrier = true,
                    KfdCommand::Launch {
                        object,
                        grid,
                        group,
                        args,
                    } => {
                        let mut kernargs =
                            pack_kernargs(&args.iter().map(KernelArg::to_bytes).collect::<Vec<_>>());
                        kernargs.resize(kernargs.len().max(object.kernarg_size as usize), 0);
                        let kernarg_address = queue
                            .aql
                            .push_kernargs(&kernargs)
                            .map_err(|_| NativeStatus::ERROR_INVALID_SIZE)?;

                        let mut packet =
                            KernelDispatchPacket::new(dims_of(*grid, *group), *group, *grid);
                        packet.kernel_object = object.descriptor_va;
                        packet.kernarg_address = kernarg_address;
                        packet.group_segment_size = object.group_segment_size;
                        packet.private_segment_size = object.private_segment_size;
                        queue.aql.submit(packet, barrier);
                        barrier = false;
                    }
                }
            }
        }
        Ok(())
    }

    fn synchronize(&self, queue: QueueHandle) -> NativeResult<()> {
        let mut state = self.lock();
        let queue = state
            .queues
            .get_mut(&queue.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
        queue.aql.wait_idle();
        Ok(())
    }

    fn suggest_group_size(&self, kernel: KernelHandle, global: [u32; 3]) -> NativeResult<[u32; 3]> {
        self.lock()
            .kernels
            .get(&kernel.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
        Ok(fit_group_size(
            global,
            SUGGESTED_WORKGROUP_SIZE,
            [MAX_WORKGROUP_SIZE; 3],
        ))
    }

    fn set_group_size(&self, kernel: KernelHandle, group: [u32; 3]) -> NativeResult<()> {
        let total = group.iter().map(|&g| u64::from(g)).product::<u64>();
        if group.contains(&0) || total > u64::from(MAX_WORKGROUP_SIZE) {
            return Err(NativeStatus::ERROR_INVALID_GROUP_SIZE_DIMENSION);
        }
        self.lock()
            .kernels
            .get_mut(&kernel.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?
            .group = group;
        Ok(())
    }

    fn set_argument_value(
        &self,
        kernel: KernelHandle,
        index: u32,
        arg: &KernelArg,
    ) -> NativeResult<()> {
        self.lock()
            .kernels
            .get_mut(&kernel.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?
            .args
            .insert(index, arg.clone());
        Ok(())
    }
}

impl Drop for KfdDriver {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, mut queue) in state.queues.drain() {
            queue.aql.wait_idle();
            if let Some(gpu) = state.gpus.get_mut(queue.gpu) {
                queue.aql.release(&mut gpu.memory);
            }
        }
    }
}
