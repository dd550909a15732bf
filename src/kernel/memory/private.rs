//! Loader-mapped private memory.
//!
//! Image segments are copied into private anonymous host memory and exposed to the guest at
//! an address chosen by the loader. The host address is wherever the host placed the mapping,
//! so the two views differ and every guest access goes through address translation.
//!
//! The mapping lies outside the guest range, so it is excluded from task duplication on its
//! own. Guest tasks never see a copy-on-write snapshot of image memory.

use log::trace;

use crate::{
    kernel::{
        host::{ForkPolicy, HostMapping, HostPlatform},
        memory::{page_align_up, GuestMemoryRegion, MemoryProtection, RegionKind},
    },
    Error, Result,
};

/// An owned private mapping placed at a guest address.
#[derive(Debug)]
pub struct PrivateMemory {
    mapping: Box<dyn HostMapping>,
    guest_address: u64,
    permissions: MemoryProtection,
    kind: RegionKind,
}

impl PrivateMemory {
    /// Maps `size` bytes for `guest_address`, fills them from `contents` and applies
    /// `permissions`.
    ///
    /// Bytes past `contents` are zero. The final protection is applied after the copy, so
    /// read-only and executable segments can be populated.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if `guest_address` is not page-aligned
    /// - [`Error::OutOfBounds`] if `contents` is larger than `size`
    /// - [`Error::AllocationFailure`] if the host refuses the mapping
    /// - [`Error::ProtectionFailure`] if `permissions` cannot be applied
    /// - [`Error::ForkPolicyFailure`] if the mapping cannot be excluded from duplication
    pub fn map(
        host: &dyn HostPlatform,
        guest_address: u64,
        size: usize,
        permissions: MemoryProtection,
        kind: RegionKind,
        contents: &[u8],
    ) -> Result<PrivateMemory> {
        if guest_address % host.page_size() as u64 != 0 {
            return Err(Error::InvalidAddress {
                address: guest_address,
                reason: "not page-aligned",
            });
        }
        if contents.len() > size {
            return Err(out_of_bounds_error!());
        }
        let Some(mapped) = page_align_up(size, host.page_size()).filter(|len| *len > 0) else {
            return Err(Error::AllocationFailure {
                what: "private",
                size,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            });
        };

        let mut mapping = host.map_private(mapped)?;
        mapping.as_mut_slice()[..contents.len()].copy_from_slice(contents);
        if permissions != MemoryProtection::READ_WRITE {
            mapping.protect(0, mapped, permissions)?;
        }
        mapping.set_fork_policy(ForkPolicy::DontFork)?;

        trace!(
            "Mapped {kind} {guest_address:#x}+{mapped:#x} ({permissions}) at host {:#x}",
            mapping.address()
        );

        Ok(PrivateMemory {
            mapping,
            guest_address,
            permissions,
            kind,
        })
    }

    /// Descriptor of the region.
    #[must_use]
    pub fn region(&self) -> GuestMemoryRegion {
        GuestMemoryRegion {
            host_address: self.mapping.address(),
            guest_address: self.guest_address,
            size: self.mapping.len(),
            permissions: self.permissions,
            kind: self.kind,
        }
    }

    fn range(&self, address: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let Some(offset) = address.checked_sub(self.guest_address) else {
            return Err(Error::InvalidAddress {
                address,
                reason: "address below region",
            });
        };
        let offset = usize::try_from(offset).map_err(|_| out_of_bounds_error!())?;
        let Some(end) = offset.checked_add(len) else {
            return Err(out_of_bounds_error!());
        };
        if end > self.mapping.len() {
            return Err(out_of_bounds_error!());
        }
        Ok(offset..end)
    }

    /// Reads `len` bytes at guest `address`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if the region is not readable
    /// - [`Error::OutOfBounds`] if the range leaves the region
    pub fn read(&self, address: u64, len: usize) -> Result<&[u8]> {
        if !self.permissions.contains(MemoryProtection::READ) {
            return Err(Error::InvalidAddress {
                address,
                reason: "region is not readable",
            });
        }
        let range = self.range(address, len)?;
        Ok(&self.mapping.as_slice()[range])
    }

    /// Writes `bytes` at guest `address`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if the region is not writable
    /// - [`Error::OutOfBounds`] if the range leaves the region
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        if !self.permissions.contains(MemoryProtection::WRITE) {
            return Err(Error::InvalidAddress {
                address,
                reason: "region is not writable",
            });
        }
        let range = self.range(address, bytes.len())?;
        self.mapping.as_mut_slice()[range].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::MockHost;

    #[test]
    fn copies_then_protects() {
        let host = MockHost::new();
        let text = PrivateMemory::map(
            &host,
            0x800_0000,
            0x1800,
            MemoryProtection::READ_EXECUTE,
            RegionKind::CodeStatic,
            &[0xAA; 0x10],
        )
        .unwrap();

        let region = text.region();
        assert_eq!(region.guest_address, 0x800_0000);
        assert_ne!(region.host_address, region.guest_address);
        assert_eq!(region.size, 0x2000);
        assert_eq!(text.read(0x800_0000, 0x11).unwrap()[..0x10], [0xAA; 0x10]);
        assert_eq!(text.read(0x800_0010, 1).unwrap(), &[0]);
        assert_eq!(
            host.page_protections(region.host_address).unwrap(),
            vec![MemoryProtection::READ_EXECUTE; 2]
        );
    }

    #[test]
    fn access_checks() {
        let host = MockHost::new();
        let mut text = PrivateMemory::map(
            &host,
            0x800_0000,
            0x1000,
            MemoryProtection::READ_EXECUTE,
            RegionKind::CodeStatic,
            &[],
        )
        .unwrap();

        assert!(matches!(
            text.write(0x800_0000, &[1]),
            Err(Error::InvalidAddress { .. })
        ));
        assert!(matches!(text.read(0x800_0FFF, 2), Err(Error::OutOfBounds)));
        assert!(matches!(
            text.read(0x7FF_FFFF, 1),
            Err(Error::InvalidAddress { .. })
        ));
    }

    #[test]
    fn excluded_from_duplication() {
        let host = MockHost::new();
        let data = PrivateMemory::map(
            &host,
            0x800_0000,
            0x1000,
            MemoryProtection::READ_WRITE,
            RegionKind::CodeMutable,
            &[],
        )
        .unwrap();

        assert_eq!(
            host.fork_policy(data.region().host_address),
            Some(ForkPolicy::DontFork)
        );
    }

    #[test]
    fn fork_policy_failure_releases_mapping() {
        let host = MockHost::new();
        host.fail_fork_policy(true);
        let result = PrivateMemory::map(
            &host,
            0x800_0000,
            0x1000,
            MemoryProtection::READ,
            RegionKind::CodeStatic,
            &[],
        );

        assert!(matches!(result, Err(Error::ForkPolicyFailure { .. })));
        assert_eq!(host.live_mappings(), 0);
    }

    #[test]
    fn unaligned_guest_address() {
        let host = MockHost::new();
        let result = PrivateMemory::map(
            &host,
            0x800_0800,
            0x100,
            MemoryProtection::READ,
            RegionKind::CodeStatic,
            &[],
        );

        assert!(matches!(result, Err(Error::InvalidAddress { .. })));
        assert_eq!(host.live_mappings(), 0);
    }

    #[test]
    fn contents_larger_than_region() {
        let host = MockHost::new();
        let result = PrivateMemory::map(
            &host,
            0x800_0000,
            0x10,
            MemoryProtection::READ,
            RegionKind::CodeStatic,
            &[0; 0x11],
        );
        assert!(matches!(result, Err(Error::OutOfBounds)));
        assert_eq!(host.live_mappings(), 0);
    }
}
