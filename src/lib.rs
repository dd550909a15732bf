// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
// Unsafe code is confined to:
// - 'kernel/host/linux.rs' for mmap, mprotect, madvise, memfd_create and clone
// - 'file/physical.rs' uses mmap to map a file into memory
// - 'kernel/thread/context.rs' to read the launch block a new task starts with

//! # guestkernel
//!
//! Guest process and thread lifecycle management for running binaries written for a foreign
//! kernel on a Linux host.
//!
//! `guestkernel` materializes every guest thread as its own host task, created by
//! duplicating the calling task with `clone(2)`. Each thread receives a stack with an
//! inaccessible guard page and a shared memory block holding its thread context. The guest
//! address range is excluded from task duplication so a new task starts without the
//! kernel's view of guest memory, while its own stack and TLS block are carried over.
//!
//! ## Features
//!
//! - **Atomic creation** - a process or thread is either fully created or nothing is left
//!   behind; every host resource is an owned value released on drop
//! - **Whole-process teardown** - killing the main thread kills every thread and releases
//!   all guest memory, continuing past individual failures
//! - **Pluggable loaders** - images are loaded by format tag; NRO is built in
//! - **Pluggable execution** - guest instructions are run by an [`ExecutionEngine`]
//! - **Testable host** - all host primitives sit behind [`HostPlatform`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use guestkernel::prelude::*;
//!
//! let kernel = Kernel::builder().engine(MyEngine::new()).build()?;
//! let image = File::from_file("homebrew.nro".as_ref())?;
//! kernel.execute(image, "nro")?;
//! # Ok::<(), guestkernel::Error>(())
//! ```
//!
//! ### Managing threads directly
//!
//! ```rust,ignore
//! use guestkernel::{Kernel, ThreadState};
//!
//! let process = kernel.create_process(entry, 0, 0x10_0000)?;
//! let worker = kernel.create_thread(worker_entry, 1, 0x4_0000)?;
//! kernel.start_thread(process.pid())?;
//!
//! kernel.kill_thread(worker.tid())?;      // one thread
//! kernel.kill_thread(process.pid())?;     // everything
//! assert_eq!(worker.state()?, ThreadState::Killed);
//! ```
//!
//! ## Architecture
//!
//! - [`kernel::os`] - the [`Kernel`] session and its lifecycle operations
//! - [`kernel::process`] / [`kernel::thread`] - process and thread records
//! - [`kernel::memory`] - stack, TLS and image mappings
//! - [`kernel::host`] - host primitives and the Linux implementation
//! - [`kernel::loader`] - image loaders and the format registry
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result):
//!
//! ```rust,no_run
//! use guestkernel::{Error, Kernel, TaskId};
//!
//! # fn teardown(kernel: &Kernel, tid: TaskId) {
//! match kernel.kill_thread(tid) {
//!     Ok(()) => println!("killed {tid}"),
//!     Err(Error::UnknownThread(tid)) => println!("{tid} does not exist"),
//!     Err(Error::TaskKillFailure { task, errno }) => println!("{task} survived: errno {errno}"),
//!     Err(e) => println!("Other error: {e}"),
//! }
//! # }
//! ```
//!
//! ## Development and Testing
//!
//! ### Fuzzing
//!
//! ```bash
//! cargo +nightly fuzz run nro --release
//! ```
//!
//! ### Testing
//!
//! ```bash
//! cargo test
//! cargo bench
//! ```
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;
pub(crate) mod file;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use guestkernel::prelude::*;
///
/// let config = KernelConfig::default();
/// assert!(LoaderRegistry::default().supports(ImageFormat::Nro));
/// assert_eq!(config.guest_base, 0x800_0000);
/// ```
pub mod prelude;

/// Guest process and thread lifecycle management.
///
/// Contains the [`Kernel`] session, the process and thread records, guest memory ownership,
/// the host platform abstraction and the image loaders.
pub mod kernel;

/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
/// This is used consistently throughout the crate for all fallible operations.
///
/// # Examples
///
/// ```rust,no_run
/// use guestkernel::{File, Result};
///
/// fn open_image(path: &str) -> Result<File> {
///     File::from_file(std::path::Path::new(path))
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `guestkernel` Error type
///
/// The main error type for all operations in this crate.
pub use error::Error;

/// The kernel session and how to assemble one.
pub use kernel::{ExecutionEngine, Kernel, KernelBuilder, KernelConfig, TaskCapabilities};

/// Process and thread records.
pub use kernel::{
    ContextState, GuestProcess, GuestThread, LaunchBlock, ProcessStatus, TaskId, ThreadContext,
    ThreadState,
};

/// Guest memory descriptors.
pub use kernel::{GuestMemoryRegion, MemoryProtection, RegionKind};

/// Host platform abstraction.
pub use kernel::{ForkPolicy, HostMapping, HostPlatform, LinuxHost, TaskSpec, Trampoline};

/// Image loading.
pub use kernel::{ImageFormat, Loader, LoaderRegistry};

/// Provides access to guest images and the little-endian reader used to decode them.
///
/// # Example
///
/// ```rust
/// use guestkernel::{File, Parser};
///
/// let image = File::from_mem(vec![0x4E, 0x52, 0x4F, 0x30])?;
/// let mut parser = Parser::new(image.data());
/// assert_eq!(parser.read_le::<u32>()?, 0x304F_524E);
/// # Ok::<(), guestkernel::Error>(())
/// ```
pub use file::{parser::Parser, File};
