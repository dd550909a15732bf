//! Host platform primitives.
//!
//! Everything the kernel needs from the host operating system goes through the
//! [`HostPlatform`] trait: creating and protecting mappings, steering which mappings a
//! duplicated task inherits, and creating or killing host tasks. [`LinuxHost`] is the real
//! implementation. Tests substitute an accounting double so the allocation and rollback
//! behavior of the lifecycle manager can be observed without touching the host.
//!
//! # Ownership
//!
//! Mappings are returned as boxed [`HostMapping`] values that release the underlying host
//! memory when dropped. Callers build acquisition chains out of these owners, so an early
//! return on any error path unwinds every mapping acquired so far, newest first.

mod linux;

pub use linux::LinuxHost;

use std::{
    ffi::{c_int, c_void},
    fmt,
};

use strum::Display;

use crate::{
    kernel::{config::TaskCapabilities, memory::MemoryProtection, thread::TaskId},
    Result,
};

/// Entry point of a freshly duplicated host task.
///
/// Receives the guest address of the thread's [`crate::kernel::LaunchBlock`] and never
/// returns while the guest thread is alive.
pub type Trampoline = extern "C" fn(*mut c_void) -> c_int;

/// Whether a mapping is inherited by host tasks duplicated without a shared address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ForkPolicy {
    /// The mapping is copied into duplicated tasks (`MADV_DOFORK`).
    DoFork,
    /// The mapping is left out of duplicated tasks (`MADV_DONTFORK`).
    DontFork,
}

/// Everything the host needs to duplicate the calling task into a guest thread.
#[derive(Clone, Copy)]
pub struct TaskSpec {
    /// Guest entry point, also stored in the launch block.
    pub entry: u64,
    /// Initial stack pointer of the new task, 16-byte aligned.
    pub stack_top: u64,
    /// Address of the launch block handed to the trampoline.
    pub launch_block: u64,
    /// Thread pointer installed for the new task when TLS is distinct.
    pub tls_base: u64,
    /// Host function the new task starts in.
    pub trampoline: Trampoline,
    /// Which resources the new task shares with its creator.
    pub capabilities: TaskCapabilities,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("stack_top", &format_args!("{:#x}", self.stack_top))
            .field("launch_block", &format_args!("{:#x}", self.launch_block))
            .field("tls_base", &format_args!("{:#x}", self.tls_base))
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// An owned host memory mapping.
///
/// Dropping the value unmaps the memory.
pub trait HostMapping: Send + Sync + fmt::Debug {
    /// Host address of the first byte.
    fn address(&self) -> u64;

    /// Length of the mapping in bytes.
    fn len(&self) -> usize;

    /// Returns `true` if the mapping has no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The mapped bytes.
    ///
    /// Callers must not read pages whose protection forbids it.
    fn as_slice(&self) -> &[u8];

    /// The mapped bytes, mutably.
    ///
    /// Callers must not write pages whose protection forbids it.
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Applies `protection` to `len` bytes starting `offset` bytes into the mapping.
    ///
    /// `offset` and `len` must be page aligned.
    ///
    /// # Errors
    /// Returns [`crate::Error::ProtectionFailure`] if the host rejects the change and
    /// [`crate::Error::OutOfBounds`] if the range leaves the mapping.
    fn protect(&mut self, offset: usize, len: usize, protection: MemoryProtection) -> Result<()>;

    /// Sets whether the mapping is inherited by duplicated tasks.
    ///
    /// # Errors
    /// Returns [`crate::Error::ForkPolicyFailure`] if the host rejects the advice.
    fn set_fork_policy(&self, policy: ForkPolicy) -> Result<()>;
}

/// The blocking host primitives used by the lifecycle manager.
pub trait HostPlatform: Send + Sync + fmt::Debug {
    /// Size of a host page in bytes.
    fn page_size(&self) -> usize;

    /// Applies a fork policy to an address range that may contain unmapped gaps.
    ///
    /// Gaps are not an error.
    ///
    /// # Errors
    /// Returns [`crate::Error::ForkPolicyFailure`] for any other host failure.
    fn set_range_fork_policy(&self, base: u64, size: u64, policy: ForkPolicy) -> Result<()>;

    /// Maps a private, anonymous, read/write stack of `size` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailure`] if the host refuses the mapping.
    fn map_stack(&self, size: usize) -> Result<Box<dyn HostMapping>>;

    /// Maps a read/write shared memory object of `size` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailure`] if the object or mapping cannot be created.
    fn map_shared(&self, size: usize) -> Result<Box<dyn HostMapping>>;

    /// Maps private, anonymous, read/write memory of `size` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailure`] if the host refuses the mapping.
    fn map_private(&self, size: usize) -> Result<Box<dyn HostMapping>>;

    /// Duplicates the calling task according to `spec`.
    ///
    /// # Errors
    /// Returns [`crate::Error::TaskCreationFailure`] carrying the host errno.
    fn spawn_task(&self, spec: &TaskSpec) -> Result<TaskId>;

    /// Forcibly stops `task` and reaps it.
    ///
    /// A task that no longer exists counts as killed.
    ///
    /// # Errors
    /// Returns [`crate::Error::TaskKillFailure`] if the task survives or cannot be reaped.
    fn kill_task(&self, task: TaskId) -> Result<()>;
}
