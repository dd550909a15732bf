//! Shared memory objects.
//!
//! A [`SharedMemory`] is backed by a host shared memory object rather than anonymous memory,
//! so a task running in a separate address space still sees the kernel's writes. Thread-local
//! storage blocks are shared memory: the kernel fills in the thread context, the guest task
//! reads it through its thread pointer. The guest address of a shared region is its host
//! address.

use crate::{
    kernel::{
        host::{ForkPolicy, HostMapping, HostPlatform},
        memory::{page_align_up, GuestMemoryRegion, MemoryProtection, RegionKind},
    },
    Error, Result,
};

/// An owned shared memory mapping.
#[derive(Debug)]
pub struct SharedMemory {
    mapping: Box<dyn HostMapping>,
    permissions: MemoryProtection,
    kind: RegionKind,
}

impl SharedMemory {
    /// Creates a shared object of at least `size` bytes and maps it with `permissions`.
    ///
    /// The mapping is inherited by duplicated tasks.
    ///
    /// # Errors
    ///
    /// - [`Error::AllocationFailure`] if the object cannot be created or mapped
    /// - [`Error::ProtectionFailure`] if `permissions` cannot be applied
    /// - [`Error::ForkPolicyFailure`] if the mapping cannot be marked inheritable
    pub fn allocate(
        host: &dyn HostPlatform,
        size: usize,
        permissions: MemoryProtection,
        kind: RegionKind,
    ) -> Result<SharedMemory> {
        let Some(mapped) = page_align_up(size, host.page_size()).filter(|len| *len > 0) else {
            return Err(Error::AllocationFailure {
                what: "shared",
                size,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            });
        };

        let mut mapping = host.map_shared(mapped)?;
        if permissions != MemoryProtection::READ_WRITE {
            mapping.protect(0, mapped, permissions)?;
        }
        mapping.set_fork_policy(ForkPolicy::DoFork)?;

        Ok(SharedMemory {
            mapping,
            permissions,
            kind,
        })
    }

    /// Host and guest address of the first byte.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.mapping.address()
    }

    /// Mapped length in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.mapping.len()
    }

    /// Descriptor of the region.
    #[must_use]
    pub fn region(&self) -> GuestMemoryRegion {
        GuestMemoryRegion {
            host_address: self.address(),
            guest_address: self.address(),
            size: self.size(),
            permissions: self.permissions,
            kind: self.kind,
        }
    }

    /// The shared bytes.
    ///
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if the region is not readable.
    pub fn as_slice(&self) -> Result<&[u8]> {
        if !self.permissions.contains(MemoryProtection::READ) {
            return Err(Error::InvalidAddress {
                address: self.address(),
                reason: "region is not readable",
            });
        }
        Ok(self.mapping.as_slice())
    }

    /// The shared bytes, mutably.
    ///
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if the region is not writable.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        if !self.permissions.contains(MemoryProtection::WRITE) {
            return Err(Error::InvalidAddress {
                address: self.address(),
                reason: "region is not writable",
            });
        }
        Ok(self.mapping.as_mut_slice())
    }
}
