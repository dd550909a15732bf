//! Execution engine interface.
//!
//! The kernel creates guest tasks but does not run guest code itself. An
//! [`ExecutionEngine`] supplies the host function every new task starts in, is told when a
//! thread is released to run, and owns the loop that drives the guest until it exits.

use crate::{
    kernel::{
        host::Trampoline,
        os::Kernel,
        process::GuestProcess,
        thread::GuestThread,
    },
    Result,
};

/// Runs guest code on the tasks created by a [`Kernel`].
pub trait ExecutionEngine: Send + Sync {
    /// Host function each new task begins in.
    ///
    /// It receives a pointer to the task's [`crate::kernel::LaunchBlock`].
    fn trampoline(&self) -> Trampoline;

    /// Called after `thread` moved to [`crate::ThreadState::Started`].
    ///
    /// # Errors
    /// An error aborts the start; [`Kernel::execute`] then tears the process down.
    fn start_thread(&self, process: &GuestProcess, thread: &GuestThread) -> Result<()> {
        let _ = (process, thread);
        Ok(())
    }

    /// Drives guest execution and returns once all guest threads have finished.
    ///
    /// # Errors
    /// Returns whatever stopped the engine.
    fn run(&self, kernel: &Kernel) -> Result<()>;
}
