//! Builders for guest images used across the unit tests.

mod nro;

pub use nro::nro_image;
