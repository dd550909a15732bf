//! Guest image access.
//!
//! A guest executable reaches the kernel as a [`File`]: an immutable byte source that is
//! either memory-mapped from disk ([`physical::Physical`]) or held in a heap buffer
//! ([`memory::Memory`]). Loaders never touch the backing storage directly; they read through
//! the bounds-checked accessors here or through a [`parser::Parser`] over [`File::data`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use guestkernel::File;
//! use std::path::Path;
//!
//! let image = File::from_file(Path::new("homebrew.nro"))?;
//! let magic = image.data_slice(0x10, 4)?;
//! assert_eq!(magic, b"NRO0");
//! # Ok::<(), guestkernel::Error>(())
//! ```

pub mod io;
pub mod parser;

mod memory;
mod physical;

use std::path::Path;

use crate::{Error::Empty, Result};
use memory::Memory;
use physical::Physical;

/// Backend trait for image data sources.
///
/// Abstracts over mapped files and owned buffers. All implementations must be thread-safe
/// since loaders may be driven from the engine's threads.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Arguments
    ///
    /// * `offset` - The starting offset within the data.
    /// * `len` - The length of the slice in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// An opened guest image.
///
/// Constructed with [`File::from_file`], [`File::from_std`] or [`File::from_mem`]. Empty
/// inputs are rejected up front so every loader can assume at least one byte of data.
pub struct File {
    data: Box<dyn Backend>,
}

impl File {
    /// Loads an image from the given path by memory-mapping it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped, and
    /// [`crate::Error::Empty`] if it has no content.
    pub fn from_file(file: &Path) -> Result<File> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Loads an image from an already opened file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be mapped, and
    /// [`crate::Error::Empty`] if it has no content.
    pub fn from_std(file: &std::fs::File) -> Result<File> {
        let input = Physical::from_std_file(file)?;

        Self::load(input)
    }

    /// Loads an image from a memory buffer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Empty`] if the buffer is empty.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        let input = Memory::new(data);

        Self::load(input)
    }

    fn load<T: Backend + 'static>(data: T) -> Result<File> {
        if data.len() == 0 {
            return Err(Empty);
        }

        Ok(File {
            data: Box::new(data),
        })
    }

    /// Returns the total size of the image in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the image has a length of zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Returns the raw image bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Returns `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the image.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File").field("len", &self.len()).finish()
    }
}
