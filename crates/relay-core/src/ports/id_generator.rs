//! IdGenerator port.
//!
//! # Implementations
//! - **UlidGenerator**: ULID based, timestamp taken from a `Clock`.

use ulid::Ulid;

use crate::domain::TaskId;
use crate::ports::Clock;

/// Generates task ids without coordination.
///
/// ULIDs sort by creation time, are 128-bit, and need no central counter.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID generator reading its timestamp from a clock, so ids created under a
/// `FixedClock` share a deterministic time component.
#[derive(Debug, Clone, Default)]
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::from(ulid)
    }
}
