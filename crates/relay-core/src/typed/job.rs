//! Job trait: binds a job name to its argument type.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::domain::{DEFAULT_QUEUE, Priority, TaskArguments};

/// The argument type of a job, keyed by the job's name.
///
/// # Example
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct GenerateInvoice {
///     customer_id: u64,
///     due_days: u32,
/// }
///
/// impl Job for GenerateInvoice {
///     const NAME: &'static str = "generate_invoice";
///     const QUEUE: &'static str = "invoices";
///     const PRIORITY: Priority = Priority::High;
/// }
/// ```
///
/// Submitted arguments are decoded into this type both when the task is
/// enqueued (validation) and when it runs.
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    /// Queue used unless the caller overrides it.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// Priority used unless the caller overrides it.
    const PRIORITY: Priority = Priority::Medium;

    /// Attempt ceiling; `None` falls back to the engine default.
    const MAX_ATTEMPTS: Option<u32> = None;
}

/// Defaults a job contributes to its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    pub queue: &'static str,
    pub priority: Priority,
    pub max_attempts: Option<u32>,
}

impl JobDefaults {
    pub fn of<J: Job>() -> Self {
        Self {
            queue: J::QUEUE,
            priority: J::PRIORITY,
            max_attempts: J::MAX_ATTEMPTS,
        }
    }
}

/// Decode task arguments into a job's argument type.
///
/// Named arguments decode by field name, positional ones as the field
/// sequence. A single positional value also decodes as the whole argument
/// (newtype and scalar jobs). Empty arguments decode as a unit, an empty
/// struct or an empty sequence, whichever the type accepts.
pub fn decode_arguments<J: Job>(args: &TaskArguments) -> Result<J, String> {
    let payload = args.to_payload()?;
    let err = match serde_json::from_value::<J>(payload) {
        Ok(job) => return Ok(job),
        Err(e) => e.to_string(),
    };
    if args.is_empty() {
        for empty in [Value::Object(Map::new()), Value::Array(Vec::new())] {
            if let Ok(job) = serde_json::from_value::<J>(empty) {
                return Ok(job);
            }
        }
    } else if let [single] = args.positional.as_slice()
        && let Ok(job) = serde_json::from_value::<J>(single.clone())
    {
        return Ok(job);
    }
    Err(err)
}
