//! AQL packet formats and the completion-signal ABI block.

use std::mem;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

pub const AQL_PACKET_SIZE: usize = 64;

pub const HSA_PACKET_TYPE_INVALID: u16 = 1;
pub const HSA_PACKET_TYPE_KERNEL_DISPATCH: u16 = 2;

const HSA_PACKET_HEADER_BARRIER: u16 = 8;
const HSA_PACKET_HEADER_ACQUIRE_FENCE_SCOPE: u16 = 9;
const HSA_PACKET_HEADER_RELEASE_FENCE_SCOPE: u16 = 11;
const HSA_FENCE_SCOPE_SYSTEM: u16 = 2;

const HSA_KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS: u16 = 0;

#[repr(i64)]
#[derive(Debug, Copy, Clone)]
pub enum AmdSignalKind {
    Invalid = 0,
    User = 1,
}

/// Signal ABI block read and decremented by the command processor.
#[repr(C, align(64))]
pub struct AmdSignal {
    pub kind: i64,
    pub value: AtomicI64,
    pub event_mailbox_ptr: u64,
    pub event_id: u32,
    pub reserved1: u32,
    pub start_ts: u64,
    pub end_ts: u64,
    pub queue_ptr: u64,
    pub reserved3: [u32; 2],
}

const _: () = assert!(mem::size_of::<AmdSignal>() == 64);
const _: () = assert!(mem::align_of::<AmdSignal>() == 64);

/// `hsa_kernel_dispatch_packet_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelDispatchPacket {
    pub header: u16,
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub reserved2: u64,
    pub completion_signal: u64,
}

const _: () = assert!(mem::size_of::<KernelDispatchPacket>() == AQL_PACKET_SIZE);

/// Header for a dispatch packet with system-scope acquire and release fences.
#[must_use]
pub const fn dispatch_header(barrier: bool) -> u16 {
    let mut header = HSA_PACKET_TYPE_KERNEL_DISPATCH;
    if barrier {
        header |= 1 << HSA_PACKET_HEADER_BARRIER;
    }
    header |= HSA_FENCE_SCOPE_SYSTEM << HSA_PACKET_HEADER_ACQUIRE_FENCE_SCOPE;
    header |= HSA_FENCE_SCOPE_SYSTEM << HSA_PACKET_HEADER_RELEASE_FENCE_SCOPE;
    header
}

impl KernelDispatchPacket {
    /// Builds a dispatch body. `group` is the work-group size and `grid` the
    /// number of work-groups; AQL wants the grid in work-items.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(dims: u16, group: [u32; 3], grid: [u32; 3]) -> Self {
        Self {
            header: HSA_PACKET_TYPE_INVALID,
            setup: dims << HSA_KERNEL_DISPATCH_PACKET_SETUP_DIMENSIONS,
            workgroup_size_x: group[0] as u16,
            workgroup_size_y: group[1] as u16,
            workgroup_size_z: group[2] as u16,
            reserved0: 0,
            grid_size_x: grid[0] * group[0],
            grid_size_y: grid[1] * group[1],
            grid_size_z: grid[2] * group[2],
            private_segment_size: 0,
            group_segment_size: 0,
            kernel_object: 0,
            kernarg_address: 0,
            reserved2: 0,
            completion_signal: 0,
        }
    }

    /// Writes the packet into a ring slot and publishes it.
    ///
    /// Everything but the first 32 bits is written first; the header and setup
    /// words are then stored together with release ordering so the packet
    /// processor never observes a valid header over a partial body.
    ///
    /// # Safety
    /// `slot` must point to a writable, 64-byte aligned ring slot.
    pub unsafe fn publish(&self, slot: *mut u8, header: u16) {
        unsafe {
            let mut body = *self;
            body.header = HSA_PACKET_TYPE_INVALID;
            slot.cast::<Self>().write_volatile(body);

            let word = u32::from(header) | (u32::from(self.setup) << 16);
            #[allow(clippy::cast_ptr_alignment)]
            (*slot.cast::<AtomicU32>()).store(word, Ordering::Release);
        }
    }
}

/// Marks every slot of a fresh ring as invalid so the packet processor idles.
///
/// # Safety
/// `ring` must be writable for `slots * AQL_PACKET_SIZE` bytes.
pub unsafe fn invalidate_ring(ring: *mut u8, slots: usize) {
    for i in 0..slots {
        unsafe {
            let slot = ring.add(i * AQL_PACKET_SIZE);
            std::ptr::write_bytes(slot, 0, AQL_PACKET_SIZE);
            slot.cast::<u16>().write_volatile(HSA_PACKET_TYPE_INVALID);
        }
    }
}

/// Packs kernel arguments the way the kernarg segment expects: each argument
/// aligned to its natural size (capped at 16 bytes).
#[must_use]
pub fn pack_kernargs(args: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for arg in args {
        let align = arg.len().next_power_of_two().clamp(1, 16);
        let padded = out.len().div_ceil(align) * align;
        out.resize(padded, 0);
        out.extend_from_slice(arg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_header_sets_type_fences_and_barrier() {
        let plain = dispatch_header(false);
        assert_eq!(plain & 0xff, HSA_PACKET_TYPE_KERNEL_DISPATCH);
        assert_eq!(plain & (1 << 8), 0);
        assert_eq!((plain >> 9) & 0b11, 2);
        assert_eq!((plain >> 11) & 0b11, 2);
        assert_ne!(dispatch_header(true) & (1 << 8), 0);
    }

    #[test]
    fn packet_grid_is_in_work_items() {
        let pkt = KernelDispatchPacket::new(2, [64, 4, 1], [4, 8, 1]);
        assert_eq!(pkt.setup, 2);
        assert_eq!((pkt.grid_size_x, pkt.grid_size_y, pkt.grid_size_z), (256, 32, 1));
        assert_eq!(pkt.workgroup_size_x, 64);
    }

    #[test]
    fn publish_writes_header_last() {
        #[repr(C, align(64))]
        struct Slot([u8; 64]);
        let mut slot = Slot([0xff; 64]);

        let mut pkt = KernelDispatchPacket::new(1, [64, 1, 1], [4, 1, 1]);
        pkt.kernel_object = 0xdead_0000;
        unsafe { pkt.publish(slot.0.as_mut_ptr(), dispatch_header(true)) };

        let written = unsafe { slot.0.as_ptr().cast::<KernelDispatchPacket>().read() };
        assert_eq!(written.header, dispatch_header(true));
        assert_eq!(written.setup, 1);
        assert_eq!(written.kernel_object, 0xdead_0000);
        assert_eq!(written.grid_size_x, 256);
    }

    #[test]
    fn kernargs_are_naturally_aligned() {
        let packed = pack_kernargs(&[
            vec![1, 0, 0, 0],
            vec![2, 0, 0, 0, 0, 0, 0, 0],
            vec![3, 0],
        ]);
        assert_eq!(packed.len(), 18);
        assert_eq!(packed[0], 1);
        assert_eq!(&packed[4..8], &[0, 0, 0, 0]);
        assert_eq!(packed[8], 2);
        assert_eq!(packed[16], 3);
    }
}
