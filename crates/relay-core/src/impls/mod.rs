//! Task store implementations.
//!
//! - **InMemoryTaskStore**: tests and short-lived processes
//! - **FileTaskStore**: durable JSON table with crash recovery

pub mod file;
pub mod memory;

pub use self::file::FileTaskStore;
pub use self::memory::InMemoryTaskStore;
