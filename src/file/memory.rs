//! In-memory image backend.
//!
//! [`Memory`] owns a byte buffer holding a complete guest image. It is used for images that
//! were received over the network, extracted from a container, or generated by tests.

use super::Backend;
use crate::{Error::OutOfBounds, Result};

/// Guest image held entirely in a heap buffer.
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Wrap an owned buffer.
    ///
    /// # Arguments
    /// * `data` - The complete image bytes
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let Some(offset_end) = offset.checked_add(len) else {
            return Err(OutOfBounds);
        };

        if offset_end > self.data.len() {
            return Err(OutOfBounds);
        }

        Ok(&self.data[offset..offset_end])
    }

    fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
