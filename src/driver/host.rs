//! In-process software device.
//!
//! Device memory is plain host memory addressed through synthetic device
//! addresses, command lists are recorded and replayed in order on `execute`,
//! and kernels are Rust closures run once per work-item. Used as the test
//! device and as the fallback target when no accelerator is present.

use super::{
    CopyCommand, CopyDirection, DeviceHandle, DevicePtr, Driver, KernelArg, KernelHandle,
    ListHandle, NativeResult, QUEUE_GROUP_FLAG_COMPUTE, QUEUE_GROUP_FLAG_COPY,
    QueueGroupProperties, QueueHandle, fit_group_size,
};
use crate::error::NativeStatus;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

const BASE_ADDRESS: u64 = 0x1000_0000;
const PAGE_SIZE: u64 = 4096;

/// Kernel body: invoked once per work-item.
pub type KernelFn = Arc<dyn Fn(&mut WorkItem<'_>) + Send + Sync>;

/// Static description of one simulated device.
#[derive(Debug, Clone)]
pub struct HostDeviceDesc {
    pub name: String,
    pub queue_groups: Vec<QueueGroupProperties>,
    pub max_group_size: u32,
    pub max_group_size_dims: [u32; 3],
}

impl HostDeviceDesc {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_groups: vec![
                QueueGroupProperties {
                    flags: QUEUE_GROUP_FLAG_COPY,
                    num_queues: 2,
                },
                QueueGroupProperties {
                    flags: QUEUE_GROUP_FLAG_COMPUTE | QUEUE_GROUP_FLAG_COPY,
                    num_queues: 1,
                },
            ],
            max_group_size: 256,
            max_group_size_dims: [256, 256, 64],
        }
    }

    #[must_use]
    pub fn with_queue_groups(mut self, groups: Vec<QueueGroupProperties>) -> Self {
        self.queue_groups = groups;
        self
    }

    #[must_use]
    pub const fn with_max_group_size(mut self, max: u32) -> Self {
        self.max_group_size = max;
        self
    }
}

/// Simulated device memory: allocations keyed by their base address.
#[derive(Debug, Default)]
pub struct DeviceMemory {
    allocations: BTreeMap<u64, Vec<u8>>,
    fault: Option<u64>,
}

impl DeviceMemory {
    fn resolve(&mut self, addr: u64, len: u64) -> Option<&mut [u8]> {
        let (&base, bytes) = self.allocations.range_mut(..=addr).next_back()?;
        let start = usize::try_from(addr - base).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        bytes.get_mut(start..end)
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        self.allocations
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, bytes)| {
                (addr - base)
                    .checked_add(len)
                    .is_some_and(|end| end <= bytes.len() as u64)
            })
    }

    /// Reads `N` bytes at `addr`; out-of-range reads record a fault and yield zeros.
    pub fn read<const N: usize>(&mut self, addr: u64) -> [u8; N] {
        let mut out = [0u8; N];
        match self.resolve(addr, N as u64) {
            Some(src) => out.copy_from_slice(src),
            None => self.fault = self.fault.or(Some(addr)),
        }
        out
    }

    /// Writes `bytes` at `addr`; out-of-range writes record a fault and are dropped.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        match self.resolve(addr, bytes.len() as u64) {
            Some(dst) => dst.copy_from_slice(bytes),
            None => self.fault = self.fault.or(Some(addr)),
        }
    }
}

/// Execution context handed to a kernel body for one work-item.
pub struct WorkItem<'a> {
    pub global_id: [u32; 3],
    pub local_id: [u32; 3],
    pub group_id: [u32; 3],
    pub global_size: [u32; 3],
    args: &'a [KernelArg],
    memory: &'a mut DeviceMemory,
}

impl WorkItem<'_> {
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&KernelArg> {
        self.args.get(index)
    }

    /// Pointer argument at `index`, or null if the argument is not a pointer.
    #[must_use]
    pub fn arg_ptr(&self, index: usize) -> u64 {
        match self.args.get(index) {
            Some(KernelArg::Pointer(ptr)) => ptr.0,
            _ => 0,
        }
    }

    #[must_use]
    pub fn arg_u32(&self, index: usize) -> u32 {
        match self.args.get(index) {
            Some(KernelArg::Value(bytes)) if bytes.len() >= 4 => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            _ => 0,
        }
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        u32::from_le_bytes(self.memory.read::<4>(addr))
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.memory.write(addr, &value.to_le_bytes());
    }

    pub fn read_f32(&mut self, addr: u64) -> f32 {
        f32::from_le_bytes(self.memory.read::<4>(addr))
    }

    pub fn write_f32(&mut self, addr: u64, value: f32) {
        self.memory.write(addr, &value.to_le_bytes());
    }

    pub fn read_u64(&mut self, addr: u64) -> u64 {
        u64::from_le_bytes(self.memory.read::<8>(addr))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.memory.write(addr, &value.to_le_bytes());
    }
}

#[derive(Clone)]
enum HostCommand {
    Copy(CopyCommand),
    Barrier,
    Launch {
        func: KernelFn,
        grid: [u32; 3],
        group: [u32; 3],
        args: Vec<KernelArg>,
    },
}

#[derive(Debug)]
struct HostQueue {
    device: usize,
}

struct HostList {
    device: usize,
    closed: bool,
    commands: Vec<HostCommand>,
}

struct HostKernel {
    name: String,
    device: usize,
    func: KernelFn,
    group: [u32; 3],
    args: BTreeMap<u32, KernelArg>,
}

#[derive(Default)]
struct HostState {
    devices: Vec<HostDeviceDesc>,
    memory: DeviceMemory,
    owners: HashMap<u64, usize>,
    next_address: u64,
    next_handle: u64,
    queues: HashMap<u64, HostQueue>,
    lists: HashMap<u64, HostList>,
    kernels: HashMap<u64, HostKernel>,
    injected: HashMap<&'static str, NativeStatus>,
    executed_lists: u64,
    executed_launches: u64,
}

impl HostState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn device(&self, device: DeviceHandle) -> NativeResult<usize> {
        let index = usize::try_from(device.0).map_err(|_| NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
        if index < self.devices.len() {
            Ok(index)
        } else {
            Err(NativeStatus::ERROR_INVALID_NULL_HANDLE)
        }
    }

    fn injected(&mut self, call: &'static str) -> NativeResult<()> {
        self.injected.remove(call).map_or(Ok(()), Err)
    }

    fn open_list(&mut self, list: ListHandle) -> NativeResult<&mut HostList> {
        let entry = self
            .lists
            .get_mut(&list.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
        if entry.closed {
            return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
        }
        Ok(entry)
    }

    fn allocate(&mut self, device: DeviceHandle, bytes: u64) -> NativeResult<DevicePtr> {
        let index = self.device(device)?;
        if bytes == 0 {
            return Err(NativeStatus::ERROR_INVALID_SIZE);
        }
        let len = usize::try_from(bytes).map_err(|_| NativeStatus::ERROR_OUT_OF_DEVICE_MEMORY)?;

        if self.next_address == 0 {
            self.next_address = BASE_ADDRESS;
        }
        let addr = self.next_address;
        // One unmapped page between allocations so overruns fault instead of aliasing.
        self.next_address = crate::utils::align_up(addr + bytes, PAGE_SIZE) + PAGE_SIZE;

        self.memory.allocations.insert(addr, vec![0; len]);
        self.owners.insert(addr, index);
        Ok(DevicePtr(addr))
    }

    fn run_copy(&mut self, copy: &CopyCommand) -> NativeResult<()> {
        let host_start =
            usize::try_from(copy.host_offset).map_err(|_| NativeStatus::ERROR_INVALID_SIZE)?;
        let len = usize::try_from(copy.bytes).map_err(|_| NativeStatus::ERROR_INVALID_SIZE)?;
        let host_end = host_start
            .checked_add(len)
            .ok_or(NativeStatus::ERROR_INVALID_SIZE)?;
        let addr = copy
            .device_ptr
            .0
            .checked_add(copy.offset)
            .ok_or(NativeStatus::ERROR_INVALID_SIZE)?;

        let mut host = copy.host.lock();
        let host_bytes = host
            .get_mut(host_start..host_end)
            .ok_or(NativeStatus::ERROR_INVALID_SIZE)?;
        let device_bytes = self
            .memory
            .resolve(addr, copy.bytes)
            .ok_or(NativeStatus::ERROR_INVALID_SIZE)?;

        match copy.direction {
            CopyDirection::HostToDevice => device_bytes.copy_from_slice(host_bytes),
            CopyDirection::DeviceToHost => host_bytes.copy_from_slice(device_bytes),
        }
        Ok(())
    }

    fn run_launch(
        &mut self,
        func: &KernelFn,
        grid: [u32; 3],
        group: [u32; 3],
        args: &[KernelArg],
    ) -> NativeResult<()> {
        let global_size = [
            grid[0] * group[0],
            grid[1] * group[1],
            grid[2] * group[2],
        ];

        for gz in 0..grid[2] {
            for gy in 0..grid[1] {
                for gx in 0..grid[0] {
                    for lz in 0..group[2] {
                        for ly in 0..group[1] {
                            for lx in 0..group[0] {
                                let mut item = WorkItem {
                                    global_id: [
                                        gx * group[0] + lx,
                                        gy * group[1] + ly,
                                        gz * group[2] + lz,
                                    ],
                                    local_id: [lx, ly, lz],
                                    group_id: [gx, gy, gz],
                                    global_size,
                                    args,
                                    memory: &mut self.memory,
                                };
                                func(&mut item);
                            }
                        }
                    }
                }
            }
        }

        self.executed_launches += 1;
        match self.memory.fault.take() {
            Some(addr) => {
                tracing::error!(addr = format_args!("0x{addr:x}"), "host kernel faulted");
                Err(NativeStatus::ERROR_DEVICE_LOST)
            }
            None => Ok(()),
        }
    }
}

/// The software device driver.
pub struct HostDriver {
    state: Mutex<HostState>,
}

impl fmt::Debug for HostDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("HostDriver")
            .field("devices", &state.devices)
            .field("allocations", &state.memory.allocations.len())
            .field("kernels", &state.kernels.len())
            .finish()
    }
}

impl HostDriver {
    #[must_use]
    pub fn new(devices: Vec<HostDeviceDesc>) -> Self {
        Self {
            state: Mutex::new(HostState {
                devices,
                ..HostState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of devices this driver exposes; handles are `0..count`.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }

    /// Registers a kernel body on `device`.
    ///
    /// # Errors
    /// Returns `ERROR_INVALID_NULL_HANDLE` for an unknown device.
    pub fn register_kernel<F>(
        &self,
        device: DeviceHandle,
        name: impl Into<String>,
        body: F,
    ) -> NativeResult<KernelHandle>
    where
        F: Fn(&mut WorkItem<'_>) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let index = state.device(device)?;
        let id = state.handle();
        state.kernels.insert(
            id,
            HostKernel {
                name: name.into(),
                device: index,
                func: Arc::new(body),
                group: [1, 1, 1],
                args: BTreeMap::new(),
            },
        );
        Ok(KernelHandle(id))
    }

    #[must_use]
    pub fn kernel_name(&self, kernel: KernelHandle) -> Option<String> {
        self.lock().kernels.get(&kernel.0).map(|k| k.name.clone())
    }

    #[must_use]
    pub fn kernel_group_size(&self, kernel: KernelHandle) -> Option<[u32; 3]> {
        self.lock().kernels.get(&kernel.0).map(|k| k.group)
    }

    /// Makes the next call named `call` fail with `status`.
    pub fn inject_failure(&self, call: &'static str, status: NativeStatus) {
        self.lock().injected.insert(call, status);
    }

    /// Reads device memory directly, bypassing command lists.
    #[must_use]
    pub fn peek(&self, addr: u64, len: u64) -> Option<Vec<u8>> {
        self.lock().memory.resolve(addr, len).map(|s| s.to_vec())
    }

    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.lock().memory.allocations.len()
    }

    #[must_use]
    pub fn executed_lists(&self) -> u64 {
        self.lock().executed_lists
    }

    #[must_use]
    pub fn executed_launches(&self) -> u64 {
        self.lock().executed_launches
    }

    #[must_use]
    pub fn recorded_commands(&self, list: ListHandle) -> Option<usize> {
        self.lock().lists.get(&list.0).map(|l| l.commands.len())
    }
}

impl Driver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn device_name(&self, device: DeviceHandle) -> NativeResult<String> {
        let state = self.lock();
        let index = state.device(device)?;
        Ok(state.devices[index].name.clone())
    }

    fn command_queue_group_properties(
        &self,
        device: DeviceHandle,
    ) -> NativeResult<Vec<QueueGroupProperties>> {
        let mut state = self.lock();
        state.injected("command_queue_group_properties")?;
        let index = state.device(device)?;
        Ok(state.devices[index].queue_groups.clone())
    }

    fn create_command_queue(
        &self,
        device: DeviceHandle,
        ordinal: u32,
    ) -> NativeResult<QueueHandle> {
        let mut state = self.lock();
        state.injected("create_command_queue")?;
        let index = state.device(device)?;
        if ordinal as usize >= state.devices[index].queue_groups.len() {
            return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
        }
        let id = state.handle();
        state.queues.insert(id, HostQueue { device: index });
        Ok(QueueHandle(id))
    }

    fn create_command_list(&self, device: DeviceHandle, ordinal: u32) -> NativeResult<ListHandle> {
        let mut state = self.lock();
        state.injected("create_command_list")?;
        let index = state.device(device)?;
        if ordinal as usize >= state.devices[index].queue_groups.len() {
            return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
        }
        let id = state.handle();
        state.lists.insert(
            id,
            HostList {
                device: index,
                closed: false,
                commands: Vec::new(),
            },
        );
        Ok(ListHandle(id))
    }

    fn allocate_shared(&self, device: DeviceHandle, bytes: u64) -> NativeResult<DevicePtr> {
        let mut state = self.lock();
        state.injected("allocate_shared")?;
        state.allocate(device, bytes)
    }

    fn allocate_device(&self, device: DeviceHandle, bytes: u64) -> NativeResult<DevicePtr> {
        let mut state = self.lock();
        state.injected("allocate_device")?;
        state.allocate(device, bytes)
    }

    fn free(&self, device: DeviceHandle, ptr: DevicePtr) -> NativeResult<()> {
        let mut state = self.lock();
        state.injected("free")?;
        let index = state.device(device)?;
        if state.owners.get(&ptr.0) != Some(&index) {
            return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
        }
        state.owners.remove(&ptr.0);
        state.memory.allocations.remove(&ptr.0);
        Ok(())
    }

    fn append_memory_copy(&self, list: ListHandle, copy: &CopyCommand) -> NativeResult<()> {
        let mut state = self.lock();
        state.injected("append_memory_copy")?;
        let addr = copy
            .device_ptr
            .0
            .checked_add(copy.offset)
            .ok_or(NativeStatus::ERROR_INVALID_SIZE)?;
        if !state.memory.contains(addr, copy.bytes) {
            return Err(NativeStatus::ERROR_INVALID_SIZE);
        }
        state
            .open_list(list)?
            .commands
            .push(HostCommand::Copy(copy.clone()));
        Ok(())
    }

    fn append_barrier(&self, list: ListHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.injected("append_barrier")?;
        state.open_list(list)?.commands.push(HostCommand::Barrier);
        Ok(())
    }

    fn append_launch_kernel(
        &self,
        list: ListHandle,
        kernel: KernelHandle,
        grid: [u32; 3],
    ) -> NativeResult<()> {
        let mut state = self.lock();
        state.injected("append_launch_kernel")?;

        let entry = state
            .kernels
            .get(&kernel.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
        let arg_count = entry.args.keys().next_back().map_or(0, |&max| max + 1);
        let args = (0..arg_count)
            .map(|i| entry.args.get(&i).cloned())
            .collect::<Option<Vec<_>>>()
            .ok_or(NativeStatus::ERROR_INVALID_ARGUMENT)?;
        let command = HostCommand::Launch {
            func: entry.func.clone(),
            grid,
            group: entry.group,
            args,
        };
        let kernel_device = entry.device;

        let target = state.open_list(list)?;
        if target.device != kernel_device {
            return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
        }
        target.commands.push(command);
        Ok(())
    }

    fn close_command_list(&self, list: ListHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.injected("close_command_list")?;
        state.open_list(list)?.closed = true;
        Ok(())
    }

    fn reset_command_list(&self, list: ListHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.injected("reset_command_list")?;
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
        let mut state = self.lock();
        state.injected("execute_command_lists")?;
        let queue_device = state
            .queues
            .get(&queue.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?
            .device;

        for list in lists {
            let entry = state
                .lists
                .get(&list.0)
                .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?;
            if !entry.closed || entry.device != queue_device {
                return Err(NativeStatus::ERROR_INVALID_ARGUMENT);
            }
            let commands = entry.commands.clone();

            // Commands run in append order, so barriers are satisfied trivially.
            for command in &commands {
                match command {
                    HostCommand::Copy(copy) => state.run_copy(copy)?,
                    HostCommand::Barrier => {}
                    HostCommand::Launch {
                        func,
                        grid,
                        group,
                        args,
                    } => state.run_launch(func, *grid, *group, args)?,
                }
            }
            state.executed_lists += 1;
        }
        Ok(())
    }

    fn synchronize(&self, queue: QueueHandle) -> NativeResult<()> {
        let mut state = self.lock();
        state.injected("synchronize")?;
        if state.queues.contains_key(&queue.0) {
            Ok(())
        } else {
            Err(NativeStatus::ERROR_INVALID_NULL_HANDLE)
        }
    }

    fn suggest_group_size(&self, kernel: KernelHandle, global: [u32; 3]) -> NativeResult<[u32; 3]> {
        let mut state = self.lock();
        state.injected("suggest_group_size")?;
        let device = state
            .kernels
            .get(&kernel.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?
            .device;
        let desc = &state.devices[device];
        Ok(fit_group_size(
            global,
            desc.max_group_size,
            desc.max_group_size_dims,
        ))
    }

    fn set_group_size(&self, kernel: KernelHandle, group: [u32; 3]) -> NativeResult<()> {
        let mut state = self.lock();
        state.injected("set_group_size")?;
        let device = state
            .kernels
            .get(&kernel.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?
            .device;
        let desc = &state.devices[device];

        let total = group.iter().map(|&g| u64::from(g)).product::<u64>();
        let within_dims = group
            .iter()
            .zip(desc.max_group_size_dims)
            .all(|(&g, max)| g >= 1 && g <= max);
        if !within_dims || total > u64::from(desc.max_group_size) {
            return Err(NativeStatus::ERROR_INVALID_GROUP_SIZE_DIMENSION);
        }

        if let Some(entry) = state.kernels.get_mut(&kernel.0) {
            entry.group = group;
        }
        Ok(())
    }

    fn set_argument_value(
        &self,
        kernel: KernelHandle,
        index: u32,
        arg: &KernelArg,
    ) -> NativeResult<()> {
        let mut state = self.lock();
        state.injected("set_argument_value")?;
        state
            .kernels
            .get_mut(&kernel.0)
            .ok_or(NativeStatus::ERROR_INVALID_NULL_HANDLE)?
            .args
            .insert(index, arg.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HostBuffer;

    fn driver() -> HostDriver {
        HostDriver::new(vec![HostDeviceDesc::new("host0")])
    }

    #[test]
    fn suggested_group_respects_device_limits() {
        let d = HostDriver::new(vec![HostDeviceDesc::new("small").with_max_group_size(64)]);
        let k = d.register_kernel(DeviceHandle(0), "noop", |_| {}).unwrap();

        assert_eq!(d.suggest_group_size(k, [256, 1, 1]).unwrap(), [64, 1, 1]);
        assert_eq!(d.suggest_group_size(k, [16, 16, 1]).unwrap(), [16, 4, 1]);
        d.set_group_size(k, [64, 1, 1]).unwrap();
        assert_eq!(
            d.set_group_size(k, [128, 1, 1]),
            Err(NativeStatus::ERROR_INVALID_GROUP_SIZE_DIMENSION)
        );
    }

    #[test]
    fn copies_run_only_when_executed() {
        let d = driver();
        let dev = DeviceHandle(0);
        let ptr = d.allocate_shared(dev, 64).unwrap();
        let queue = d.create_command_queue(dev, 1).unwrap();
        let list = d.create_command_list(dev, 1).unwrap();

        let copy = CopyCommand {
            direction: CopyDirection::HostToDevice,
            device_ptr: ptr,
            offset: 8,
            bytes: 4,
            host: HostBuffer::from_u32s(&[0xcafe_f00d]),
            host_offset: 0,
        };
        d.append_memory_copy(list, &copy).unwrap();
        assert_eq!(d.peek(ptr.0 + 8, 4).unwrap(), vec![0; 4]);

        d.close_command_list(list).unwrap();
        d.execute_command_lists(queue, &[list]).unwrap();
        assert_eq!(d.peek(ptr.0 + 8, 4).unwrap(), 0xcafe_f00du32.to_le_bytes());
    }

    #[test]
    fn closed_list_rejects_appends() {
        let d = driver();
        let list = d.create_command_list(DeviceHandle(0), 0).unwrap();
        d.close_command_list(list).unwrap();
        assert_eq!(
            d.append_barrier(list),
            Err(NativeStatus::ERROR_INVALID_ARGUMENT)
        );
        d.reset_command_list(list).unwrap();
        assert!(d.append_barrier(list).is_ok());
    }

    #[test]
    fn out_of_range_kernel_access_reports_device_lost() {
        let d = driver();
        let dev = DeviceHandle(0);
        let ptr = d.allocate_shared(dev, 16).unwrap();
        let k = d
            .register_kernel(dev, "overrun", |item| {
                let base = item.arg_ptr(0);
                item.write_u32(base + 64, 1);
            })
            .unwrap();
        d.set_argument_value(k, 0, &KernelArg::Pointer(ptr)).unwrap();

        let queue = d.create_command_queue(dev, 1).unwrap();
        let list = d.create_command_list(dev, 1).unwrap();
        d.append_launch_kernel(list, k, [1, 1, 1]).unwrap();
        d.close_command_list(list).unwrap();
        assert_eq!(
            d.execute_command_lists(queue, &[list]),
            Err(NativeStatus::ERROR_DEVICE_LOST)
        );
    }

    #[test]
    fn injected_failures_fire_once() {
        let d = driver();
        d.inject_failure("allocate_shared", NativeStatus::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(
            d.allocate_shared(DeviceHandle(0), 8),
            Err(NativeStatus::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert!(d.allocate_shared(DeviceHandle(0), 8).is_ok());
    }
}
