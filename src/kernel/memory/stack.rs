//! Guest thread stacks.
//!
//! A [`GuestStack`] is a private anonymous read/write mapping whose lowest page is made
//! inaccessible so an overflowing guest thread faults instead of corrupting adjacent memory.
//! The stack is inherited by duplicated tasks even though the surrounding guest range is not.

use std::io;

use log::trace;

use crate::{
    file::io::write_le_at,
    kernel::{
        host::{ForkPolicy, HostMapping, HostPlatform},
        memory::{page_align_up, GuestMemoryRegion, MemoryProtection, RegionKind},
        thread::LaunchBlock,
    },
    Error, Result,
};

/// A thread stack with a guard page at its low end.
#[derive(Debug)]
pub struct GuestStack {
    mapping: Box<dyn HostMapping>,
    requested: usize,
    guard: usize,
}

impl GuestStack {
    /// Maps a stack able to hold `size` bytes and installs its guard page.
    ///
    /// The mapping is rounded up to whole pages. Each step releases everything acquired before
    /// it when it fails, so an error leaves no mapping behind.
    ///
    /// # Errors
    ///
    /// - [`Error::AllocationFailure`] if `size` does not leave room for a usable page above the
    ///   guard, or the host refuses the mapping
    /// - [`Error::ForkPolicyFailure`] if the stack cannot be marked inheritable
    /// - [`Error::ProtectionFailure`] if the guard page cannot be made inaccessible
    pub fn allocate(host: &dyn HostPlatform, size: usize) -> Result<GuestStack> {
        let page = host.page_size();
        let mapped = match page_align_up(size, page) {
            Some(mapped) if mapped > page => mapped,
            _ => {
                return Err(Error::AllocationFailure {
                    what: "stack",
                    size,
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "stack must span more than its guard page",
                    ),
                })
            }
        };

        let mut mapping = host.map_stack(mapped)?;
        mapping.set_fork_policy(ForkPolicy::DoFork)?;
        mapping.protect(0, page, MemoryProtection::empty())?;

        trace!(
            "Allocated stack {:#x}-{:#x} (requested {size:#x})",
            mapping.address(),
            mapping.address() + mapped as u64
        );

        Ok(GuestStack {
            mapping,
            requested: size,
            guard: page,
        })
    }

    /// The size the caller asked for, before page rounding.
    #[must_use]
    pub fn size(&self) -> usize {
        self.requested
    }

    /// The size of the underlying mapping, guard page included.
    #[must_use]
    pub fn mapped_size(&self) -> usize {
        self.mapping.len()
    }

    /// Size of the inaccessible guard area at the bottom.
    #[must_use]
    pub fn guard_size(&self) -> usize {
        self.guard
    }

    /// Lowest address of the mapping (the guard page).
    #[must_use]
    pub fn base(&self) -> u64 {
        self.mapping.address()
    }

    /// One past the highest address; stacks grow down from here.
    #[must_use]
    pub fn top(&self) -> u64 {
        self.base() + self.mapped_size() as u64
    }

    /// Descriptor of the stack; guest and host addresses are identical.
    #[must_use]
    pub fn region(&self) -> GuestMemoryRegion {
        GuestMemoryRegion {
            host_address: self.base(),
            guest_address: self.base(),
            size: self.mapped_size(),
            permissions: MemoryProtection::READ_WRITE,
            kind: RegionKind::Stack,
        }
    }

    /// Stores `block` in the highest bytes of the stack and returns its address.
    ///
    /// The address is 16-byte aligned and doubles as the new task's initial stack pointer.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the stack cannot hold the block.
    pub fn write_launch_block(&mut self, block: &LaunchBlock) -> Result<u64> {
        let len = self.mapped_size();
        let Some(start) = len.checked_sub(LaunchBlock::SIZE) else {
            return Err(out_of_bounds_error!());
        };
        let start = start & !0xF;
        if start < self.guard {
            return Err(out_of_bounds_error!());
        }

        let bytes = self.mapping.as_mut_slice();
        let mut offset = start;
        write_le_at(bytes, &mut offset, block.entry)?;
        write_le_at(bytes, &mut offset, block.tls_base)?;

        Ok(self.base() + start as u64)
    }
}
