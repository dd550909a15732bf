//! Guest memory regions and the host mappings that back them.
//!
//! - [`GuestMemoryRegion`] - value descriptor shared by all region kinds
//! - [`GuestStack`] - thread stack with a guard page
//! - [`SharedMemory`] - shared object mapping (TLS blocks)
//! - [`PrivateMemory`] - loader-placed image segments
//!
//! Each owner type holds its host mapping exclusively and releases it on drop.

mod private;
mod region;
mod shared;
mod stack;

pub use private::PrivateMemory;
pub use region::{page_align_up, GuestMemoryRegion, MemoryProtection, RegionKind};
pub use shared::SharedMemory;
pub use stack::GuestStack;
