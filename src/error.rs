use thiserror::Error;

use crate::kernel::{TaskId, ThreadState};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into three groups: failures while materializing a guest process or
/// thread (allocation, protection, fork policy, task creation), failures while tearing one
/// down or addressing it (unknown threads, illegal state transitions), and failures while
/// reading guest images (malformed headers, out of bounds reads, I/O).
///
/// # Error Categories
///
/// ## Creation Errors
/// - [`Error::AllocationFailure`] - A host mapping could not be created
/// - [`Error::ProtectionFailure`] - Page permissions could not be applied
/// - [`Error::ForkPolicyFailure`] - Copy-on-fork advice could not be applied
/// - [`Error::TaskCreationFailure`] - The host refused to duplicate the task
///
/// ## Lifecycle Errors
/// - [`Error::UnknownThread`] - No registered thread with the given id
/// - [`Error::MainThreadKill`] - Main thread routed through the single-thread path
/// - [`Error::InvalidThreadState`] - Illegal thread state transition
/// - [`Error::TaskKillFailure`] - The host task could not be stopped
///
/// ## Image Errors
/// - [`Error::UnsupportedFormat`] - No loader for the requested format tag
/// - [`Error::Malformed`] - Corrupted or invalid image structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond image boundaries
///
/// # Examples
///
/// ```rust,no_run
/// use guestkernel::{Error, File, Kernel};
///
/// # fn run(kernel: &Kernel) -> guestkernel::Result<()> {
/// let image = File::from_file("homebrew.nro".as_ref())?;
/// match kernel.execute(image, "nro") {
///     Ok(()) => println!("guest exited"),
///     Err(Error::UnsupportedFormat(tag)) => eprintln!("no loader for {tag}"),
///     Err(Error::TaskCreationFailure { errno, message }) => {
///         eprintln!("clone failed with errno {errno}: {message}")
///     }
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The requested image format is not supported.
    ///
    /// Raised before any resource is allocated when the format tag cannot be parsed or no
    /// loader is registered for it.
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// A host memory mapping could not be created.
    ///
    /// # Fields
    ///
    /// * `what` - Which region was being allocated (stack, shared memory, ...)
    /// * `size` - The requested size in bytes
    /// * `source` - The underlying host error
    #[error("Failed to allocate {what} memory ({size:#x} bytes): {source}")]
    AllocationFailure {
        /// The kind of region that was being allocated
        what: &'static str,
        /// The requested size in bytes
        size: usize,
        /// The host error
        #[source]
        source: std::io::Error,
    },

    /// Page permissions could not be applied to a mapping.
    ///
    /// During thread creation this is raised when the stack guard page cannot be made
    /// inaccessible; the stack mapping is released before the error propagates.
    #[error("Failed to protect {size:#x} bytes at {address:#x}: {source}")]
    ProtectionFailure {
        /// Host address of the first page
        address: u64,
        /// Length of the range in bytes
        size: usize,
        /// The host error
        #[source]
        source: std::io::Error,
    },

    /// Copy-on-fork advice could not be applied to a host range.
    #[error("Failed to apply fork policy to {size:#x} bytes at {address:#x}: {source}")]
    ForkPolicyFailure {
        /// Host address of the range
        address: u64,
        /// Length of the range in bytes
        size: u64,
        /// The host error
        #[source]
        source: std::io::Error,
    },

    /// The host failed to duplicate the calling task.
    ///
    /// Carries the raw host error code so callers can distinguish resource exhaustion
    /// (`EAGAIN`, `ENOMEM`) from policy refusals (`EPERM`).
    #[error("Call to clone() has failed: {message} (errno {errno})")]
    TaskCreationFailure {
        /// The host errno
        errno: i32,
        /// Host description of the errno
        message: String,
    },

    /// A host task could not be stopped or reaped.
    #[error("Failed to kill {task}: errno {errno}")]
    TaskKillFailure {
        /// The task that survived
        task: TaskId,
        /// The host errno
        errno: i32,
    },

    /// No thread with this id is registered in the live process.
    #[error("No such thread: {0}")]
    UnknownThread(TaskId),

    /// The main thread can only be removed by killing the whole process.
    #[error("{0} is the main thread and can only be killed with its process")]
    MainThreadKill(TaskId),

    /// A thread was asked to perform an illegal lifecycle transition.
    #[error("{task} cannot transition from {from} to {to}")]
    InvalidThreadState {
        /// The thread
        task: TaskId,
        /// The state it was in
        from: ThreadState,
        /// The state that was requested
        to: ThreadState,
    },

    /// The session already owns a live process.
    #[error("A guest process is already running ({0})")]
    ProcessAlreadyExists(TaskId),

    /// The operation requires a live process and there is none.
    #[error("No guest process is running")]
    NoProcess,

    /// A guest address is not backed by any mapping, or a mapping would overlap.
    #[error("Invalid guest address {address:#x}: {reason}")]
    InvalidAddress {
        /// The offending guest address
        address: u64,
        /// Why it is invalid
        reason: &'static str,
    },

    /// The image is damaged and could not be parsed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing an image or accessing guest memory.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The kernel session was assembled with an invalid configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Failed to lock target.
    ///
    /// Raised when a process or session lock was poisoned by a panic in another thread.
    #[error("Failed to lock target")]
    LockError,
}
