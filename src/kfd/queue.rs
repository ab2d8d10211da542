#![allow(clippy::cast_possible_truncation)]

use crate::kfd::aql::{self, AQL_PACKET_SIZE, AmdSignal, AmdSignalKind, KernelDispatchPacket};
use crate::kfd::device::KfdDevice;
use crate::kfd::ioctl::{CreateQueueArgs, KFD_IOC_QUEUE_TYPE_COMPUTE_AQL, KFD_MAX_QUEUE_PERCENTAGE};
use crate::kfd::memory::{AllocFlags, Allocation, GpuMemory};
use crate::kfd::sysfs::HsaNodeProperties;
use crate::utils::align_up;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

const PAGE_SIZE: u32 = 4096;
const HWREG_SIZE_PER_CU: u32 = 0x1000;
const DEBUGGER_BYTES_PER_WAVE: u32 = 32;
const DEBUGGER_BYTES_ALIGN: u32 = 64;

const KERNARG_ALIGN: u64 = 64;
const SPINS_BEFORE_YIELD: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePriority {
    Low,
    Normal,
    High,
}

impl QueuePriority {
    const fn to_kfd(self) -> u32 {
        match self {
            Self::Low => 3,
            Self::Normal => 7,
            Self::High => 11,
        }
    }
}

// ===============================================================================================
// Context save/restore sizing
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct ContextSaveAreaHeader {
    control_stack_offset: u32,
    control_stack_size: u32,
    wave_state_offset: u32,
    wave_state_size: u32,
    debug_offset: u32,
    debug_size: u32,
    error_reason: u64,
    error_event_id: u32,
    reserved1: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CwsrSizes {
    pub ctl_stack_size: u32,
    pub wg_data_size: u32,
    pub debug_memory_size: u32,
    pub ctx_save_restore_size: u32,
    pub total_mem_alloc_size: u32,
}

const fn gfx_parts(gfx_version: u32) -> (u32, u32, u32) {
    (
        (gfx_version / 10000) % 100,
        (gfx_version / 100) % 100,
        gfx_version % 100,
    )
}

const fn vgpr_size_per_cu(gfx_version: u32) -> u32 {
    let (major, minor, step) = gfx_parts(gfx_version);

    // Arcturus, the Aldebaran/Aqua Vanjaram family and GFX950.
    let large_vgpr_gfx9 =
        major == 9 && ((minor == 0 && step == 8) || minor == 4 || (minor == 5 && step == 0));

    if large_vgpr_gfx9 {
        0x80000
    } else if major >= 11 {
        0x60000
    } else {
        0x40000
    }
}

const fn cntl_stack_bytes_per_wave(gfx_version: u32) -> u32 {
    if gfx_parts(gfx_version).0 >= 10 { 12 } else { 8 }
}

/// CWSR buffer sizes for a node, or `None` when the ASIC has no CWSR support.
#[must_use]
pub fn cwsr_sizes(props: &HsaNodeProperties) -> Option<CwsrSizes> {
    if props.gfx_target_version < 80000 || props.simd_count == 0 || props.simd_per_cu == 0 {
        return None;
    }

    let num_xcc = props.num_xcc.max(1);
    let cu_num = props.simd_count / props.simd_per_cu / num_xcc;

    let wave_num = if props.gfx_target_version < 100_100 {
        let max_waves_se = if props.simd_arrays_per_engine > 0 {
            (props.num_shader_banks / props.simd_arrays_per_engine) * 512
        } else {
            u32::MAX
        };
        (cu_num * 40).min(max_waves_se)
    } else {
        cu_num * 32
    };

    let ctl_stack_bytes = wave_num * cntl_stack_bytes_per_wave(props.gfx_target_version) + 8;
    let mut ctl_stack_size = align_up(
        u64::from(mem::size_of::<ContextSaveAreaHeader>() as u32 + ctl_stack_bytes),
        u64::from(PAGE_SIZE),
    ) as u32;

    // Navi10 firmware limit.
    if props.gfx_target_version == 100_100 {
        ctl_stack_size = ctl_stack_size.min(0x7000);
    }

    let wg_data_size_per_cu = vgpr_size_per_cu(props.gfx_target_version)
        + props.sgpr_size_per_cu
        + props.lds_size_in_kb * 1024
        + HWREG_SIZE_PER_CU;
    let wg_data_size = cu_num * wg_data_size_per_cu;

    let debug_memory_size = align_up(
        u64::from(wave_num * DEBUGGER_BYTES_PER_WAVE),
        u64::from(DEBUGGER_BYTES_ALIGN),
    ) as u32;
    let ctx_save_restore_size =
        ctl_stack_size + align_up(u64::from(wg_data_size), u64::from(PAGE_SIZE)) as u32;
    let total_mem_alloc_size = (ctx_save_restore_size + debug_memory_size) * num_xcc;

    Some(CwsrSizes {
        ctl_stack_size,
        wg_data_size,
        debug_memory_size,
        ctx_save_restore_size,
        total_mem_alloc_size,
    })
}

/// Writes one save-area header per XCC. Each header points at the shared
/// debug area that follows the last XCC block.
///
/// # Safety
/// `ptr` must be writable for `sizes.total_mem_alloc_size` bytes.
unsafe fn init_cwsr_headers(ptr: *mut u8, sizes: &CwsrSizes, num_xcc: u32) {
    let num_xcc = num_xcc.max(1);
    for i in 0..num_xcc {
        let header = ContextSaveAreaHeader {
            debug_offset: (num_xcc - i) * sizes.ctx_save_restore_size,
            debug_size: sizes.debug_memory_size * num_xcc,
            ..ContextSaveAreaHeader::default()
        };
        unsafe {
            ptr.add((i * sizes.ctx_save_restore_size) as usize)
                .cast::<ContextSaveAreaHeader>()
                .write_unaligned(header);
        }
    }
}

/// EOP buffer size per ASIC generation.
const fn eop_size(gfx_version: u32) -> usize {
    if gfx_parts(gfx_version).0 >= 8 { 4096 } else { 0 }
}

// ===============================================================================================
// AQL queue
// ===============================================================================================

/// A user-mode AQL compute queue plus everything it submits through: ring,
/// doorbell, completion signal and a kernarg pool.
///
/// Buffers are owned by the node's `GpuMemory`; dropping the queue destroys
/// the hardware queue and returns the buffers to it via [`AqlQueue::release`].
#[derive(Debug)]
pub struct AqlQueue {
    pub queue_id: u32,
    device: KfdDevice,

    ring: Allocation,
    slots: u64,
    pointers: Allocation,
    doorbell: *mut u8,
    doorbell_is_64bit: bool,

    signal: Allocation,
    kernargs: Allocation,
    kernarg_offset: u64,

    eop: Option<Allocation>,
    cwsr: Option<Allocation>,
    destroyed: bool,
}

// Raw pointers reference process-wide mappings owned by this queue.
unsafe impl Send for AqlQueue {}

pub struct QueueBuilder<'a> {
    device: &'a KfdDevice,
    memory: &'a mut GpuMemory,
    props: &'a HsaNodeProperties,
    ring_bytes: usize,
    kernarg_bytes: usize,
    priority: QueuePriority,
}

impl<'a> QueueBuilder<'a> {
    pub fn new(
        device: &'a KfdDevice,
        memory: &'a mut GpuMemory,
        props: &'a HsaNodeProperties,
    ) -> Self {
        Self {
            device,
            memory,
            props,
            ring_bytes: 64 * 1024,
            kernarg_bytes: 1024 * 1024,
            priority: QueuePriority::Normal,
        }
    }

    #[must_use]
    pub const fn with_ring_bytes(mut self, bytes: usize) -> Self {
        self.ring_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_kernarg_bytes(mut self, bytes: usize) -> Self {
        self.kernarg_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, p: QueuePriority) -> Self {
        self.priority = p;
        self
    }

    /// Allocates the queue's buffers and registers the queue with KFD.
    ///
    /// # Errors
    /// Returns the OS error of the first failing allocation or ioctl.
    pub fn create(self) -> io::Result<AqlQueue> {
        let gfx_version = self.props.gfx_target_version;
        let host = AllocFlags::new().gtt();

        let ring = self.memory.allocate(self.ring_bytes, host.executable())?;
        let slots = (ring.size / AQL_PACKET_SIZE) as u64;
        unsafe { aql::invalidate_ring(ring.ptr, slots as usize) };

        let pointers = self.memory.allocate(PAGE_SIZE as usize, host)?;
        unsafe { ptr::write_bytes(pointers.ptr, 0, pointers.size) };

        let signal = self
            .memory
            .allocate(mem::size_of::<AmdSignal>(), host.uncached())?;
        unsafe {
            signal.ptr.cast::<AmdSignal>().write(AmdSignal {
                kind: AmdSignalKind::User as i64,
                value: AtomicI64::new(0),
                event_mailbox_ptr: 0,
                event_id: 0,
                reserved1: 0,
                start_ts: 0,
                end_ts: 0,
                queue_ptr: 0,
                reserved3: [0; 2],
            });
        }

        let kernargs = self.memory.allocate(self.kernarg_bytes, host)?;

        let eop = match eop_size(gfx_version) {
            0 => None,
            size => {
                let alloc = self
                    .memory
                    .allocate(size, AllocFlags::new().vram().host_access())
                    .or_else(|_| self.memory.allocate(size, host))?;
                unsafe { ptr::write_bytes(alloc.ptr, 0, size) };
                Some(alloc)
            }
        };

        let cwsr_sizes = cwsr_sizes(self.props);
        let cwsr = match &cwsr_sizes {
            Some(sizes) => {
                let alloc = self
                    .memory
                    .allocate(sizes.total_mem_alloc_size as usize, host)?;
                unsafe { init_cwsr_headers(alloc.ptr, sizes, self.props.num_xcc) };
                Some(alloc)
            }
            None => None,
        };

        let mut args = CreateQueueArgs {
            gpu_id: self.props.kfd_gpu_id,
            ring_base_address: ring.gpu_va,
            ring_size: ring.size as u32,
            read_pointer_address: pointers.gpu_va,
            write_pointer_address: pointers.gpu_va + 8,
            queue_type: KFD_IOC_QUEUE_TYPE_COMPUTE_AQL,
            queue_percentage: KFD_MAX_QUEUE_PERCENTAGE,
            queue_priority: self.priority.to_kfd(),
            ..Default::default()
        };
        if let Some(eop) = &eop {
            args.eop_buffer_address = eop.gpu_va;
            args.eop_buffer_size = eop.size as u64;
        }
        if let (Some(cwsr), Some(sizes)) = (&cwsr, &cwsr_sizes) {
            args.ctx_save_restore_address = cwsr.gpu_va;
            args.ctx_save_restore_size = sizes.ctx_save_restore_size;
            args.ctl_stack_size = sizes.ctl_stack_size;
        }

        self.device.create_queue(&mut args).inspect_err(|e| {
            tracing::error!(gpu_id = self.props.kfd_gpu_id, error = %e, "KFD create queue failed");
        })?;

        let is_soc15 = gfx_version >= 90000;
        let doorbell_page = if is_soc15 { 8 * 1024 } else { 4 * 1024 };
        let mask = doorbell_page as u64 - 1;
        let (mmap_offset, in_page) = if is_soc15 {
            (args.doorbell_offset & !mask, args.doorbell_offset & mask)
        } else {
            (args.doorbell_offset, 0)
        };
        let page = match self.memory.map_doorbell(mmap_offset, doorbell_page) {
            Ok(page) => page,
            Err(e) => {
                self.device.destroy_queue(args.queue_id).ok();
                return Err(e);
            }
        };

        tracing::debug!(
            queue_id = args.queue_id,
            gpu_id = self.props.kfd_gpu_id,
            slots,
            "AQL queue created"
        );

        Ok(AqlQueue {
            queue_id: args.queue_id,
            device: self.device.clone(),
            ring,
            slots,
            pointers,
            doorbell: unsafe { page.add(in_page as usize) },
            doorbell_is_64bit: is_soc15,
            signal,
            kernargs,
            kernarg_offset: 0,
            eop,
            cwsr,
            destroyed: false,
        })
    }
}

impl AqlQueue {
    fn read_index(&self) -> &AtomicU64 {
        unsafe { &*self.pointers.ptr.cast::<AtomicU64>() }
    }

    fn write_index(&self) -> &AtomicU64 {
        unsafe { &*self.pointers.ptr.add(8).cast::<AtomicU64>() }
    }

    fn signal(&self) -> &AmdSignal {
        unsafe { &*self.signal.ptr.cast::<AmdSignal>() }
    }

    /// Copies `bytes` into the kernarg pool and returns their GPU address.
    /// Drains the queue first when the pool is exhausted.
    ///
    /// # Errors
    /// `InvalidInput` if `bytes` can never fit in the pool.
    pub fn push_kernargs(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let len = bytes.len() as u64;
        if len > self.kernargs.size as u64 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let mut offset = align_up(self.kernarg_offset, KERNARG_ALIGN);
        if offset + len > self.kernargs.size as u64 {
            self.wait_idle();
            offset = 0;
        }
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.kernargs.ptr.add(offset as usize),
                bytes.len(),
            );
        }
        self.kernarg_offset = offset + len.max(1);
        Ok(self.kernargs.gpu_va + offset)
    }

    /// Submits one dispatch packet. The completion signal is attached and
    /// incremented; the packet processor decrements it on completion.
    pub fn submit(&mut self, mut packet: KernelDispatchPacket, barrier: bool) {
        let index = self.write_index().load(Ordering::Relaxed);
        while index - self.read_index().load(Ordering::Acquire) >= self.slots {
            std::hint::spin_loop();
        }

        packet.completion_signal = self.signal.gpu_va;
        self.signal().value.fetch_add(1, Ordering::AcqRel);

        let slot = ((index % self.slots) as usize) * AQL_PACKET_SIZE;
        unsafe { packet.publish(self.ring.ptr.add(slot), aql::dispatch_header(barrier)) };

        self.write_index().store(index + 1, Ordering::Release);
        std::sync::atomic::fence(Ordering::SeqCst);
        unsafe {
            if self.doorbell_is_64bit {
                #[allow(clippy::cast_ptr_alignment)]
                self.doorbell.cast::<u64>().write_volatile(index);
            } else {
                #[allow(clippy::cast_ptr_alignment)]
                self.doorbell.cast::<u32>().write_volatile(index as u32);
            }
        }
    }

    #[must_use]
    pub fn outstanding(&self) -> i64 {
        self.signal().value.load(Ordering::Acquire)
    }

    /// Blocks until every submitted packet has completed. There is no timeout.
    pub fn wait_idle(&mut self) {
        let mut spins = 0u32;
        while self.outstanding() > 0 {
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        self.kernarg_offset = 0;
    }

    /// Destroys the hardware queue and frees its buffers.
    pub fn release(&mut self, memory: &mut GpuMemory) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Err(e) = self.device.destroy_queue(self.queue_id) {
            tracing::warn!(queue_id = self.queue_id, error = %e, "KFD destroy queue failed");
        }
        let buffers = [
            Some(self.ring),
            Some(self.pointers),
            Some(self.signal),
            Some(self.kernargs),
            self.eop,
            self.cwsr,
        ];
        for alloc in buffers.into_iter().flatten() {
            memory.free(alloc.gpu_va).ok();
        }
    }
}

impl Drop for AqlQueue {
    fn drop(&mut self) {
        if !self.destroyed
            && let Err(e) = self.device.destroy_queue(self.queue_id)
        {
            tracing::warn!(queue_id = self.queue_id, error = %e, "KFD destroy queue failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gfx90a() -> HsaNodeProperties {
        HsaNodeProperties {
            simd_count: 440,
            simd_per_cu: 4,
            num_xcc: 1,
            lds_size_in_kb: 64,
            gfx_target_version: 90010,
            simd_arrays_per_engine: 1,
            num_shader_banks: 8,
            sgpr_size_per_cu: 32 * 1024,
            ..HsaNodeProperties::default()
        }
    }

    #[test]
    fn cwsr_sizes_for_gfx9() {
        let sizes = cwsr_sizes(&gfx90a()).unwrap();
        // 110 CUs * 40 waves, capped at 8 shader banks * 512 = 4096 waves of 8 bytes.
        let ctl = align_up((mem::size_of::<ContextSaveAreaHeader>() + 4096 * 8 + 8) as u64, 4096);
        assert_eq!(sizes.debug_memory_size, 4096 * 32);
        assert_eq!(u64::from(sizes.ctl_stack_size), ctl);
        assert_eq!(sizes.wg_data_size, 110 * (0x40000 + 32 * 1024 + 64 * 1024 + 0x1000));
        assert_eq!(sizes.ctx_save_restore_size % 4096, 0);
        assert_eq!(
            sizes.total_mem_alloc_size,
            sizes.ctx_save_restore_size + sizes.debug_memory_size
        );
    }

    #[test]
    fn no_cwsr_before_gfx8() {
        let props = HsaNodeProperties {
            gfx_target_version: 70002,
            ..gfx90a()
        };
        assert!(cwsr_sizes(&props).is_none());
        assert_eq!(eop_size(70002), 0);
        assert_eq!(eop_size(110000), 4096);
    }

    #[test]
    fn vgpr_sizes_follow_generation() {
        assert_eq!(vgpr_size_per_cu(90008), 0x80000);
        assert_eq!(vgpr_size_per_cu(90402), 0x80000);
        assert_eq!(vgpr_size_per_cu(90000), 0x40000);
        assert_eq!(vgpr_size_per_cu(110000), 0x60000);
    }
}
