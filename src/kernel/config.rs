//! Kernel session configuration.
//!
//! [`KernelConfig`] fixes the guest address range, the default stack size and the set of
//! host resources a guest task shares with the kernel ([`TaskCapabilities`]). The defaults
//! reproduce the layout expected by guest binaries; tests shrink or move the range freely.
//!
//! # Example
//!
//! ```rust
//! use guestkernel::{KernelConfig, TaskCapabilities};
//!
//! let config = KernelConfig::default()
//!     .with_default_stack_size(0x10_0000)
//!     .with_capabilities(TaskCapabilities {
//!         distinct_tls: false,
//!         ..TaskCapabilities::default()
//!     });
//!
//! assert_eq!(config.default_stack_size, 0x10_0000);
//! assert!(config.capabilities.share_descriptors);
//! ```

use crate::kernel::constants::{DEFAULT_STACK_SIZE, GUEST_BASE, GUEST_EXTENT};

/// Host resources shared between the kernel and a duplicated guest task.
///
/// The defaults share descriptors and filesystem context, give each task its own thread
/// pointer, and keep address spaces separate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskCapabilities {
    /// Run the task in the kernel's address space.
    pub share_address_space: bool,
    /// Share the file descriptor table.
    pub share_descriptors: bool,
    /// Share root, working directory and umask.
    pub share_filesystem: bool,
    /// Install the thread's TLS block as the task's thread pointer.
    pub distinct_tls: bool,
}

impl Default for TaskCapabilities {
    fn default() -> Self {
        TaskCapabilities {
            share_address_space: false,
            share_descriptors: true,
            share_filesystem: true,
            distinct_tls: true,
        }
    }
}

/// Configuration of a [`crate::Kernel`] session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// First guest address reserved for the guest program.
    pub guest_base: u64,
    /// Length of the reserved guest range.
    pub guest_extent: u64,
    /// Stack size of the main thread started by [`crate::Kernel::execute`].
    pub default_stack_size: usize,
    /// Resources shared with every guest task.
    pub capabilities: TaskCapabilities,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            guest_base: GUEST_BASE,
            guest_extent: GUEST_EXTENT,
            default_stack_size: DEFAULT_STACK_SIZE,
            capabilities: TaskCapabilities::default(),
        }
    }
}

impl KernelConfig {
    /// Sets the reserved guest address range.
    #[must_use]
    pub fn with_guest_range(mut self, base: u64, extent: u64) -> Self {
        self.guest_base = base;
        self.guest_extent = extent;
        self
    }

    /// Sets the main thread's stack size.
    #[must_use]
    pub fn with_default_stack_size(mut self, size: usize) -> Self {
        self.default_stack_size = size;
        self
    }

    /// Sets the resources shared with guest tasks.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: TaskCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// One past the last reserved guest address.
    #[must_use]
    pub fn guest_end(&self) -> u64 {
        self.guest_base.saturating_add(self.guest_extent)
    }
}
