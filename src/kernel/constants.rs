//! Fixed values of the guest kernel's address space layout.

/// Lowest guest virtual address handed out to loaded images.
pub const GUEST_BASE: u64 = 0x800_0000;

/// Length of the guest address range starting at [`GUEST_BASE`].
///
/// The range ends at `0x7F_FFFF_FFFF`, the top of the 39-bit guest address space.
pub const GUEST_EXTENT: u64 = 0x7F_F800_0000;

/// Stack size used for the main thread when the caller does not choose one.
pub const DEFAULT_STACK_SIZE: usize = 0x1E_8480;

/// Host page size assumed when the host cannot report one.
pub const PAGE_SIZE: usize = 0x1000;
