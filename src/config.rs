use crate::error::{AccelError, AccelResult};
use crate::utils::parse_byte_size;
use std::env;

pub const ENV_HEAP_ALLOCATION: &str = "ACCEL_HEAP_ALLOCATION";
pub const ENV_CALL_STACK_LIMIT: &str = "ACCEL_CALL_STACK_LIMIT";
pub const ENV_SHARED_MEMORY_ALLOCATOR: &str = "ACCEL_SHARED_MEMORY_ALLOCATOR";
pub const ENV_NATIVE_FAILURES: &str = "ACCEL_NATIVE_FAILURES";

const DEFAULT_HEAP_SIZE: u64 = 1 << 30;
const DEFAULT_CALL_STACK_LIMIT: u64 = 8192;
const DEFAULT_HEAP_ALIGNMENT: u64 = 64;

/// What happens when a driver call reports a non-success status on an
/// enqueue/launch/flush path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NativeFailurePolicy {
    /// Log, record the failure on the device context, and keep going.
    #[default]
    Continue,
    /// Return the failure to the caller as `AccelError::Native`.
    Propagate,
}

/// Options consumed by the memory manager and the per-device queues.
///
/// Read once when a device context is built; later changes to the environment
/// have no effect on an existing `Context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Total bytes of the device region (call stack + heap).
    pub heap_size: u64,
    /// Bytes reserved at the front of the region for call-stack frames.
    pub call_stack_limit: u64,
    /// Use host-visible shared memory instead of device-local memory.
    pub shared_memory: bool,
    pub native_failure_policy: NativeFailurePolicy,
    /// Alignment applied by `MemoryManager::allocate`.
    pub heap_alignment: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            call_stack_limit: DEFAULT_CALL_STACK_LIMIT,
            shared_memory: true,
            native_failure_policy: NativeFailurePolicy::Continue,
            heap_alignment: DEFAULT_HEAP_ALIGNMENT,
        }
    }

    #[must_use]
    pub const fn heap_size(mut self, bytes: u64) -> Self {
        self.heap_size = bytes;
        self
    }

    #[must_use]
    pub const fn call_stack_limit(mut self, bytes: u64) -> Self {
        self.call_stack_limit = bytes;
        self
    }

    #[must_use]
    pub const fn shared_memory(mut self, shared: bool) -> Self {
        self.shared_memory = shared;
        self
    }

    #[must_use]
    pub const fn native_failure_policy(mut self, policy: NativeFailurePolicy) -> Self {
        self.native_failure_policy = policy;
        self
    }

    #[must_use]
    pub const fn heap_alignment(mut self, alignment: u64) -> Self {
        self.heap_alignment = alignment;
        self
    }

    /// Builds a configuration from the `ACCEL_*` environment variables,
    /// falling back to the defaults for anything unset.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if a variable is set to an unparsable value or
    /// the resulting configuration is inconsistent.
    pub fn from_env() -> AccelResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`], reading values through `lookup`.
    ///
    /// # Errors
    /// See [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> AccelResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(raw) = lookup(ENV_HEAP_ALLOCATION) {
            config.heap_size = parse_size(ENV_HEAP_ALLOCATION, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CALL_STACK_LIMIT) {
            config.call_stack_limit = parse_size(ENV_CALL_STACK_LIMIT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SHARED_MEMORY_ALLOCATOR) {
            config.shared_memory = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(AccelError::InvalidArgument(format!(
                        "{ENV_SHARED_MEMORY_ALLOCATOR}: expected a boolean, got '{other}'"
                    )));
                }
            };
        }
        if let Some(raw) = lookup(ENV_NATIVE_FAILURES) {
            config.native_failure_policy = match raw.trim().to_ascii_lowercase().as_str() {
                "continue" => NativeFailurePolicy::Continue,
                "propagate" => NativeFailurePolicy::Propagate,
                other => {
                    return Err(AccelError::InvalidArgument(format!(
                        "{ENV_NATIVE_FAILURES}: expected 'continue' or 'propagate', got '{other}'"
                    )));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `InvalidArgument` if the call-stack region does not fit in the heap.
    pub fn validate(&self) -> AccelResult<()> {
        if self.call_stack_limit > self.heap_size {
            return Err(AccelError::InvalidArgument(format!(
                "call-stack limit ({}) exceeds heap size ({})",
                self.call_stack_limit, self.heap_size
            )));
        }
        Ok(())
    }
}

fn parse_size(key: &str, raw: &str) -> AccelResult<u64> {
    parse_byte_size(raw).ok_or_else(|| {
        AccelError::InvalidArgument(format!("{key}: cannot parse size '{raw}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::new());
        assert!(config.shared_memory);
        assert_eq!(config.native_failure_policy, NativeFailurePolicy::Continue);
    }

    #[test]
    fn reads_every_option() {
        let config = Config::from_lookup(lookup(&[
            (ENV_HEAP_ALLOCATION, "2GB"),
            (ENV_CALL_STACK_LIMIT, "64KB"),
            (ENV_SHARED_MEMORY_ALLOCATOR, "false"),
            (ENV_NATIVE_FAILURES, "propagate"),
        ]))
        .unwrap();

        assert_eq!(config.heap_size, 2 << 30);
        assert_eq!(config.call_stack_limit, 64 << 10);
        assert!(!config.shared_memory);
        assert_eq!(config.native_failure_policy, NativeFailurePolicy::Propagate);
    }

    #[test]
    fn rejects_malformed_values() {
        let err = Config::from_lookup(lookup(&[(ENV_HEAP_ALLOCATION, "lots")])).unwrap_err();
        assert!(matches!(err, AccelError::InvalidArgument(_)));

        let err =
            Config::from_lookup(lookup(&[(ENV_SHARED_MEMORY_ALLOCATOR, "maybe")])).unwrap_err();
        assert!(matches!(err, AccelError::InvalidArgument(_)));
    }

    #[test]
    fn call_stack_must_fit_in_heap() {
        let err = Config::from_lookup(lookup(&[
            (ENV_HEAP_ALLOCATION, "4KB"),
            (ENV_CALL_STACK_LIMIT, "8KB"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AccelError::InvalidArgument(_)));
    }
}
