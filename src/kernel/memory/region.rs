//! Memory region descriptors for guest address space management.
//!
//! A [`GuestMemoryRegion`] describes one contiguous block of memory as seen from both sides
//! of the emulation boundary: the host address where the bytes actually live, and the guest
//! address at which the guest program expects them. The two are equal for stack and
//! thread-local-storage regions, and differ for loader-mapped image segments.
//!
//! # Memory Protection
//!
//! Regions carry [`MemoryProtection`] flags that mirror the host `PROT_*` bits. Guard pages
//! are expressed as an empty protection set.

use bitflags::bitflags;
use strum::Display;

bitflags! {
    /// Memory protection flags for guest regions.
    ///
    /// # Common Combinations
    ///
    /// - [`READ_WRITE`](Self::READ_WRITE) - Stacks, TLS blocks, `.data` and `.bss`
    /// - [`READ_EXECUTE`](Self::READ_EXECUTE) - Code segments (`.text`)
    /// - [`READ`](Self::READ) - Read-only segments (`.rodata`)
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryProtection: u32 {
        /// Region is readable.
        const READ = 0x01;
        /// Region is writable.
        const WRITE = 0x02;
        /// Region is executable.
        const EXECUTE = 0x04;
        /// Read and write access.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read and execute access.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        /// Read, write, and execute access.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

impl MemoryProtection {
    /// Converts the flags to host `PROT_*` bits for `mmap` and `mprotect`.
    #[must_use]
    pub fn to_host(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl std::fmt::Display for MemoryProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.contains(Self::READ), 'r'),
            flag(self.contains(Self::WRITE), 'w'),
            flag(self.contains(Self::EXECUTE), 'x')
        )
    }
}

/// What a region is used for, as reported to the guest by memory queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum RegionKind {
    /// Kernel-owned memory the guest may address but not reallocate (TLS blocks).
    Reserved,
    /// A thread stack.
    Stack,
    /// Immutable image segments (code and read-only data).
    CodeStatic,
    /// Writable image segments (data and bss).
    CodeMutable,
    /// Anything else.
    General,
}

/// A contiguous block of guest-visible memory.
///
/// The descriptor is a plain value; the mapping it describes is owned by a
/// [`super::GuestStack`], [`super::SharedMemory`] or [`super::PrivateMemory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestMemoryRegion {
    /// Address of the first byte in the host process.
    pub host_address: u64,
    /// Address of the first byte as seen by the guest.
    pub guest_address: u64,
    /// Length in bytes, a multiple of the host page size.
    pub size: usize,
    /// Access permitted to the guest.
    pub permissions: MemoryProtection,
    /// Usage of the region.
    pub kind: RegionKind,
}

impl GuestMemoryRegion {
    /// One past the last guest address of the region.
    #[must_use]
    pub fn guest_end(&self) -> u64 {
        self.guest_address.saturating_add(self.size as u64)
    }

    /// Returns `true` if `address` lies within the guest view of the region.
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.guest_address && address < self.guest_end()
    }

    /// Returns `true` if `guest_address..guest_address + size` shares a byte with the region.
    #[must_use]
    pub fn overlaps(&self, guest_address: u64, size: usize) -> bool {
        let end = guest_address.saturating_add(size as u64);
        guest_address < self.guest_end() && self.guest_address < end
    }
}

impl std::fmt::Display for GuestMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:#012x}-{:#012x} {} {}",
            self.guest_address,
            self.guest_end(),
            self.permissions,
            self.kind
        )
    }
}

/// Rounds `size` up to a multiple of `page_size`.
///
/// Returns `None` if the rounded value does not fit in `usize` or `page_size` is zero.
#[must_use]
pub fn page_align_up(size: usize, page_size: usize) -> Option<usize> {
    if page_size == 0 {
        return None;
    }
    size.div_ceil(page_size).checked_mul(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment() {
        assert_eq!(page_align_up(0, 0x1000), Some(0));
        assert_eq!(page_align_up(1, 0x1000), Some(0x1000));
        assert_eq!(page_align_up(0x1000, 0x1000), Some(0x1000));
        assert_eq!(page_align_up(0x1E_8480, 0x1000), Some(0x1E_9000));
        assert_eq!(page_align_up(usize::MAX, 0x1000), None);
        assert_eq!(page_align_up(0x10, 0), None);
    }

    #[test]
    fn protection_to_host() {
        assert_eq!(MemoryProtection::empty().to_host(), libc::PROT_NONE);
        assert_eq!(
            MemoryProtection::READ_EXECUTE.to_host(),
            libc::PROT_READ | libc::PROT_EXEC
        );
        assert_eq!(MemoryProtection::READ_WRITE.to_string(), "rw-");
    }

    #[test]
    fn region_ranges() {
        let region = GuestMemoryRegion {
            host_address: 0x7f00_0000_0000,
            guest_address: 0x800_0000,
            size: 0x2000,
            permissions: MemoryProtection::READ,
            kind: RegionKind::CodeStatic,
        };

        assert!(region.contains(0x800_0000));
        assert!(region.contains(0x800_1FFF));
        assert!(!region.contains(0x800_2000));
        assert!(region.overlaps(0x800_1000, 0x2000));
        assert!(!region.overlaps(0x800_2000, 0x1000));
        assert!(!region.overlaps(0x7FF_F000, 0x1000));
    }
}
