//! Guest process and thread lifecycle management.
//!
//! The kernel turns a guest executable into a running set of host tasks. It reserves the
//! guest address range, maps the image through a [`loader`], and materializes every guest
//! thread as an independently scheduled host task with its own guarded stack and TLS block.
//!
//! # Architecture
//!
//! - [`os::Kernel`] - one session: the process slot and the public lifecycle operations
//! - [`process`] - thread registry and loader-mapped memory of the guest program
//! - [`thread`] - thread records, states and the context block shared with guest code
//! - [`memory`] - stack, shared and private mappings as owned values
//! - [`host`] - the host primitives behind a trait, with a Linux implementation
//! - [`loader`] - image loaders selected by format tag
//! - [`engine`] - the interface to whatever runs guest instructions
//!
//! Every host resource is owned by a value that releases it on drop, so a failure partway
//! through creating a thread unwinds exactly what was acquired.

pub mod builder;
pub mod config;
pub mod constants;
pub mod engine;
pub mod host;
pub mod loader;
pub mod memory;
pub mod os;
pub mod process;
pub mod thread;

pub use builder::KernelBuilder;
pub use config::{KernelConfig, TaskCapabilities};
pub use engine::ExecutionEngine;
pub use host::{ForkPolicy, HostMapping, HostPlatform, LinuxHost, TaskSpec, Trampoline};
pub use loader::{ImageFormat, Loader, LoaderRegistry};
pub use memory::{GuestMemoryRegion, MemoryProtection, RegionKind};
pub use os::Kernel;
pub use process::{GuestProcess, ProcessStatus};
pub use thread::{ContextState, GuestThread, LaunchBlock, TaskId, ThreadContext, ThreadState};
