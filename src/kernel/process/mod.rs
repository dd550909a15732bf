//! Guest processes.

mod record;

pub use record::{GuestProcess, ProcessStatus};
