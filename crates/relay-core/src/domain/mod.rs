//! Domain model (ids, priorities, statuses, records, decisions, errors).

pub mod decision;
pub mod errors;
pub mod ids;
pub mod priority;
pub mod spec;
pub mod status;
pub mod task;
pub mod view;

pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{EngineError, JobError};
pub use ids::{ParseTaskIdError, TaskId};
pub use priority::{ParsePriorityError, Priority};
pub use spec::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, EnqueueOptions, NewTask};
pub use status::{CancelCause, StatusUpdate, TaskStatus};
pub use task::{AttemptOutcome, AttemptRecord, TaskArguments, TaskRecord};
pub use view::{QueueCounts, QueueLoad, TaskStatusView};
