//! Work-group sizing and kernel launch.

use crate::driver::{DevicePtr, KernelArg, KernelHandle, NativeBoundary};
use crate::error::{AccelError, AccelResult};
use crate::queue::CommandQueue;

/// What a task declares about one launch: the kernel, its problem size in
/// 1 to 3 dimensions, and its arguments (not counting the implicit heap base).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMeta {
    kernel: KernelHandle,
    dims: usize,
    global_work: [u32; 3],
    args: Vec<KernelArg>,
}

impl TaskMeta {
    /// # Errors
    /// `InvalidArgument` unless `global_work` has 1 to 3 non-zero entries.
    pub fn new(kernel: KernelHandle, global_work: &[u32]) -> AccelResult<Self> {
        if !(1..=3).contains(&global_work.len()) {
            return Err(AccelError::InvalidArgument(format!(
                "task dimensionality must be 1, 2 or 3, got {}",
                global_work.len()
            )));
        }
        if global_work.contains(&0) {
            return Err(AccelError::InvalidArgument(format!(
                "global work size has an empty dimension: {global_work:?}"
            )));
        }
        let mut padded = [1u32; 3];
        padded[..global_work.len()].copy_from_slice(global_work);
        Ok(Self {
            kernel,
            dims: global_work.len(),
            global_work: padded,
            args: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<KernelArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub const fn kernel(&self) -> KernelHandle {
        self.kernel
    }

    #[must_use]
    pub const fn dims(&self) -> usize {
        self.dims
    }

    /// Global work size with unused trailing dimensions set to 1.
    #[must_use]
    pub const fn global_work(&self) -> [u32; 3] {
        self.global_work
    }

    #[must_use]
    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }
}

/// Geometry of one dispatch. Every group dimension divides the global size,
/// so `dispatch_grid * group_size == global_work` exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLaunchDescriptor {
    pub global_work: [u32; 3],
    pub group_size: [u32; 3],
    pub dispatch_grid: [u32; 3],
}

impl KernelLaunchDescriptor {
    /// Reduces each suggested dimension to `gcd(global, suggested)` and derives the grid.
    ///
    /// The grid never over-covers the global size, at the cost of occupancy:
    /// a global size coprime to the suggestion (any large prime, say) ends up
    /// with single-item groups. Pad the global size on the caller side when
    /// that matters.
    #[must_use]
    pub fn compute(global_work: [u32; 3], suggested: [u32; 3]) -> Self {
        let mut group_size = [1u32; 3];
        let mut dispatch_grid = [1u32; 3];
        for dim in 0..3 {
            group_size[dim] = gcd(global_work[dim], suggested[dim].max(1)).max(1);
            dispatch_grid[dim] = global_work[dim] / group_size[dim];
        }
        Self {
            global_work,
            group_size,
            dispatch_grid,
        }
    }

    #[must_use]
    pub fn total_work_items(&self) -> u64 {
        self.global_work.iter().map(|&g| u64::from(g)).product()
    }
}

#[must_use]
pub const fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Sizes, binds and enqueues kernel launches on one device's command list.
pub struct KernelDispatcher<'a> {
    boundary: &'a mut NativeBoundary,
    queue: &'a mut CommandQueue,
}

impl<'a> KernelDispatcher<'a> {
    pub fn new(boundary: &'a mut NativeBoundary, queue: &'a mut CommandQueue) -> Self {
        Self { boundary, queue }
    }

    /// Binds `heap_base` as argument 0 and the task's arguments from index 1,
    /// then appends the launch. Nothing runs until the queue is flushed.
    ///
    /// # Errors
    /// `InvalidState` on a closed list; driver failures per the boundary policy.
    pub fn launch(
        &mut self,
        heap_base: DevicePtr,
        task: &TaskMeta,
    ) -> AccelResult<KernelLaunchDescriptor> {
        self.queue.ensure_open()?;
        let kernel = task.kernel();
        let global = task.global_work();

        let suggested = self
            .boundary
            .driver()
            .suggest_group_size(kernel, global);
        let suggested = self
            .boundary
            .guard("suggest_group_size", suggested)?
            .unwrap_or([1, 1, 1]);

        let launch = KernelLaunchDescriptor::compute(global, suggested);
        let bound = self.boundary.driver().set_group_size(kernel, launch.group_size);
        self.boundary.guard("set_group_size", bound)?;

        self.set_arg(kernel, 0, &KernelArg::Pointer(heap_base))?;
        for (index, arg) in (1u32..).zip(task.args()) {
            self.set_arg(kernel, index, arg)?;
        }

        tracing::debug!(
            dims = task.dims(),
            global = ?launch.global_work,
            group = ?launch.group_size,
            grid = ?launch.dispatch_grid,
            "enqueue kernel launch"
        );
        self.queue
            .enqueue_launch(self.boundary, kernel, launch.dispatch_grid)?;
        Ok(launch)
    }

    fn set_arg(&mut self, kernel: KernelHandle, index: u32, arg: &KernelArg) -> AccelResult<()> {
        let result = self.boundary.driver().set_argument_value(kernel, index, arg);
        self.boundary.guard("set_argument_value", result)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_trailing_dimensions() {
        let task = TaskMeta::new(KernelHandle(1), &[128, 4]).unwrap();
        assert_eq!(task.dims(), 2);
        assert_eq!(task.global_work(), [128, 4, 1]);

        assert!(TaskMeta::new(KernelHandle(1), &[]).is_err());
        assert!(TaskMeta::new(KernelHandle(1), &[1, 2, 3, 4]).is_err());
        assert!(TaskMeta::new(KernelHandle(1), &[16, 0]).is_err());
    }

    #[test]
    fn grid_divides_exactly() {
        let launch = KernelLaunchDescriptor::compute([256, 1, 1], [64, 1, 1]);
        assert_eq!(launch.dispatch_grid, [4, 1, 1]);

        // 100 is not a multiple of 64; the group shrinks to gcd(100, 64) = 4.
        let launch = KernelLaunchDescriptor::compute([100, 6, 1], [64, 4, 1]);
        assert_eq!(launch.group_size, [4, 2, 1]);
        assert_eq!(launch.dispatch_grid, [25, 3, 1]);
        assert_eq!(launch.total_work_items(), 600);
    }

    #[test]
    fn zero_suggestion_means_one() {
        let launch = KernelLaunchDescriptor::compute([7, 1, 1], [0, 0, 0]);
        assert_eq!(launch.group_size, [1, 1, 1]);
        assert_eq!(launch.dispatch_grid, [7, 1, 1]);
    }

    #[test]
    fn prime_global_size_falls_back_to_single_item_groups() {
        let launch = KernelLaunchDescriptor::compute([1_000_003, 1, 1], [256, 1, 1]);
        assert_eq!(launch.group_size, [1, 1, 1]);
        assert_eq!(launch.dispatch_grid, [1_000_003, 1, 1]);
    }

    #[test]
    fn gcd_basics() {
        assert_eq!(gcd(256, 64), 64);
        assert_eq!(gcd(100, 64), 4);
        assert_eq!(gcd(17, 5), 1);
        assert_eq!(gcd(9, 0), 9);
    }
}
