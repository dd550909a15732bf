//! Endian-aware primitive reads and writes over byte buffers.
//!
//! Guest images and the in-memory thread context block are little-endian
//! structures. This module provides the bounds-checked primitives used to read
//! image headers ([`crate::file::parser::Parser`]) and to serialize the
//! [`crate::kernel::ThreadContext`] into a thread-local-storage region.
//!
//! # Error Handling
//!
//! All functions return [`crate::Error::OutOfBounds`] if the buffer is too
//! short for the requested operation. Nothing is partially written.

use crate::{Error::OutOfBounds, Result};

/// Trait for primitive integer types that can be read from and written to
/// byte buffers in little-endian order.
///
/// Each implementation names the fixed-size byte array that backs the type
/// (e.g. `[u8; 4]` for `u32`).
pub trait ImageIO: Sized {
    /// Byte array representation of the type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_image_io {
    ($($ty:ty => $len:literal),* $(,)?) => {
        $(
            impl ImageIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_image_io!(u8 => 1, u16 => 2, u32 => 4, u64 => 8, i32 => 4, i64 => 8);

/// Reads a value of type `T` in little-endian order at `offset` and advances
/// the offset past it.
///
/// # Arguments
/// * `data` - The buffer to read from
/// * `offset` - Read position, updated on success
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
pub fn read_le_at<T: ImageIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Reads a value of type `T` in little-endian order from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
pub fn read_le<T: ImageIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Writes `value` in little-endian order at `offset` and advances the offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit.
pub fn write_le_at<T: ImageIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let bytes = value.to_le_bytes();
    data[*offset..end].copy_from_slice(bytes.as_ref());
    *offset = end;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_sequential() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00];
        let mut offset = 0;

        let first: u16 = read_le_at(&data, &mut offset).unwrap();
        let second: u16 = read_le_at(&data, &mut offset).unwrap();
        let third: u32 = read_le_at(&data, &mut offset).unwrap();

        assert_eq!((first, second, third), (1, 2, 3));
        assert_eq!(offset, 8);
    }

    #[test]
    fn read_past_end() {
        let data = [0x01, 0x02, 0x03];
        let mut offset = 0;
        assert!(matches!(read_le_at::<u32>(&data, &mut offset), Err(OutOfBounds)));
        assert_eq!(offset, 0);

        let mut offset = usize::MAX;
        assert!(matches!(read_le_at::<u8>(&data, &mut offset), Err(OutOfBounds)));
    }

    #[test]
    fn write_sequential() {
        let mut data = [0u8; 12];
        let mut offset = 0;

        write_le_at(&mut data, &mut offset, 0x0403_0201_u32).unwrap();
        write_le_at(&mut data, &mut offset, 0x0C0B_0A09_0807_0605_u64).unwrap();

        assert_eq!(data, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert!(matches!(
            write_le_at(&mut data, &mut offset, 1_u8),
            Err(OutOfBounds)
        ));
    }
}
