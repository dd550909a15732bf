//! Memory-mapped image backend.
//!
//! [`Physical`] maps an image file read-only into the host address space with `memmap2`.
//! Loaders copy segments out of the mapping into guest memory, so the file is never
//! modified and does not need to be read into a heap buffer first.
//!
//! # Safety Considerations
//!
//! The mapping is only valid as long as the underlying file is not truncated by another
//! process. Guest images are expected to be immutable while a session runs.

use super::Backend;
use crate::{Error::FileError, Result};

use memmap2::Mmap;
use std::{fs, path::Path};

/// Guest image backed by a read-only file mapping.
#[derive(Debug)]
pub struct Physical {
    data: Mmap,
}

impl Physical {
    /// Open and map the file at `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path).map_err(FileError)?;

        Self::from_std_file(&file)
    }

    /// Map an already opened file.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be mapped.
    pub fn from_std_file(file: &fs::File) -> Result<Physical> {
        // The mapping is read-only and the image is not expected to change underneath us.
        let mmap = unsafe { Mmap::map(file) }.map_err(FileError)?;

        Ok(Physical { data: mmap })
    }
}

impl Backend for Physical {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(out_of_bounds_error!());
        };

        if offset_end > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        Ok(&self.data[offset..offset_end])
    }

    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
