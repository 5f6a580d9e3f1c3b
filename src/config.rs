use crate::err::Error;
use crate::types::MAX_DESCRIPTOR_SLOTS;
use core::time::Duration;

/// The largest number of targets a single descriptor may hold.
pub const MAX_TARGETS_LIMIT: usize = 64;

/// Geometry and contention behavior of a [crate::Pool].
///
/// `capacity`, `descriptor_slots` and `max_targets` are part of the persistent layout: a pool file
/// can only be reopened with the values it was created with. The remaining fields only affect the
/// running process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    /// The number of persistent words available to applications.
    pub capacity: usize,
    /// The number of descriptor slots, which bounds the number of in-flight operations.
    pub descriptor_slots: usize,
    /// The largest number of targets one descriptor may stage.
    pub max_targets: usize,
    /// Busy-spin iterations before a waiting thread starts yielding or sleeping.
    pub spin_retries: usize,
    /// How long a waiting thread sleeps once spinning did not help. Zero means yield instead.
    pub backoff: Duration,
    /// How many times [crate::Session::descriptor] retries before reporting an exhausted pool.
    pub allocation_retries: usize,
}

impl PoolConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn with_descriptor_slots(mut self, descriptor_slots: usize) -> Self {
        self.descriptor_slots = descriptor_slots;
        self
    }

    pub fn with_max_targets(mut self, max_targets: usize) -> Self {
        self.max_targets = max_targets;
        self
    }

    pub fn with_spin_retries(mut self, spin_retries: usize) -> Self {
        self.spin_retries = spin_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_allocation_retries(mut self, allocation_retries: usize) -> Self {
        self.allocation_retries = allocation_retries;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be at least 1"));
        }
        if self.max_targets == 0 || self.max_targets > MAX_TARGETS_LIMIT {
            return Err(Error::InvalidConfig("max_targets must be between 1 and 64"));
        }
        if self.descriptor_slots == 0 || self.descriptor_slots >= MAX_DESCRIPTOR_SLOTS {
            return Err(Error::InvalidConfig(
                "descriptor_slots must be at least 1 and below 2^22",
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            descriptor_slots: 1024,
            max_targets: 8,
            spin_retries: 10,
            backoff: Duration::from_micros(10),
            allocation_retries: 1000,
        }
    }
}
