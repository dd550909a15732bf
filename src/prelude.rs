//! # guestkernel Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the guestkernel library. Import this module to get quick access to the essential
//! types for running a guest program.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all guestkernel operations
pub use crate::Error;

/// The result type used throughout guestkernel
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// A kernel session and its builder
pub use crate::{Kernel, KernelBuilder};

/// Session configuration
pub use crate::{KernelConfig, TaskCapabilities};

/// Guest images and the reader used to decode them
pub use crate::{File, Parser};

// ================================================================================================
// Processes and Threads
// ================================================================================================

/// Process records
pub use crate::{GuestProcess, ProcessStatus};

/// Thread records and their lifecycle
pub use crate::{GuestThread, TaskId, ThreadContext, ThreadState};

/// Guest memory descriptors
pub use crate::{GuestMemoryRegion, MemoryProtection, RegionKind};

// ================================================================================================
// Extension Points
// ================================================================================================

/// Runs guest code on kernel-created tasks
pub use crate::ExecutionEngine;

/// Host primitives and the Linux implementation
pub use crate::{HostPlatform, LinuxHost, Trampoline};

/// Image loaders
pub use crate::{ImageFormat, Loader, LoaderRegistry};
