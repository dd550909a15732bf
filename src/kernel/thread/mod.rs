//! Guest threads.
//!
//! Every guest thread is an independently scheduled host task. This module holds the thread
//! record ([`GuestThread`]), its lifecycle ([`ThreadState`]) and the blocks it shares with
//! guest code ([`ThreadContext`], [`LaunchBlock`]).

mod context;
mod record;
mod state;

pub use context::{ContextState, LaunchBlock, ThreadContext, GENERAL_REGISTERS};
pub use record::GuestThread;
pub use state::ThreadState;

/// Host-assigned identifier of a guest task.
///
/// The identifier of a process's main thread is also the process identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub i32);

impl TaskId {
    /// Creates a task ID with the given value.
    #[must_use]
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Returns the raw numeric ID value.
    #[must_use]
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}
