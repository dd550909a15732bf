//! NRO executable loader.
//!
//! NRO is a flat executable format: three file-backed segments (text, read-only data,
//! data) followed by a zero-initialized bss area, described by a fixed header. The header
//! lives inside the text segment at offset `0x10`, after a branch instruction and the offset
//! of the module header.
//!
//! # Header Layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00 | 4 | entry branch (unused) |
//! | 0x04 | 4 | `mod_offset` |
//! | 0x10 | 4 | magic `NRO0` |
//! | 0x14 | 4 | `version` |
//! | 0x18 | 4 | `size` |
//! | 0x1C | 4 | `flags` |
//! | 0x20 | 8 | text segment `(offset, size)` |
//! | 0x28 | 8 | ro segment |
//! | 0x30 | 8 | data segment |
//! | 0x38 | 4 | `bss_size` |
//! | 0x40 | 32 | build id |
//! | 0x68 | 8 | api info segment |
//! | 0x70 | 8 | dynstr segment |
//! | 0x78 | 8 | dynsym segment |
//!
//! # Guest Layout
//!
//! Text is mapped read/execute at the guest base, read-only data directly after it, and
//! data plus bss read/write after that. Every segment starts on a page boundary.

use log::debug;

use crate::{
    file::parser::Parser,
    kernel::{
        config::KernelConfig,
        constants::PAGE_SIZE,
        loader::Loader,
        memory::{page_align_up, MemoryProtection, RegionKind},
        os::Kernel,
        process::GuestProcess,
    },
    File, Result,
};

/// A `(file offset, size)` pair from the NRO header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NroSegment {
    /// Offset of the segment in the file.
    pub offset: u32,
    /// Length of the segment in bytes.
    pub size: u32,
}

impl NroSegment {
    fn read(parser: &mut Parser) -> Result<Self> {
        Ok(NroSegment {
            offset: parser.read_le::<u32>()?,
            size: parser.read_le::<u32>()?,
        })
    }

    /// One past the last file offset of the segment.
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }
}

/// The decoded NRO header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NroHeader {
    /// Offset of the module header.
    pub mod_offset: u32,
    /// Format version.
    pub version: u32,
    /// Total image size claimed by the header.
    pub size: u32,
    /// Format flags.
    pub flags: u32,
    /// Executable code.
    pub text: NroSegment,
    /// Read-only data.
    pub ro: NroSegment,
    /// Initialized writable data.
    pub data: NroSegment,
    /// Zero-initialized data following `data`.
    pub bss_size: u32,
    /// Build identifier of the image.
    pub build_id: [u8; 32],
    /// Api info within the ro segment.
    pub api_info: NroSegment,
    /// Dynamic string table within the ro segment.
    pub dynstr: NroSegment,
    /// Dynamic symbol table within the ro segment.
    pub dynsym: NroSegment,
}

impl NroHeader {
    /// Encoded size of the header, including the leading branch and `mod_offset`.
    pub const SIZE: usize = 0x80;

    /// Magic at offset `0x10`.
    pub const MAGIC: &'static [u8; 4] = b"NRO0";

    /// Decodes the header at the start of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the data is truncated or the magic is wrong.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(malformed_error!(
                "NRO header needs {} bytes, image has {}",
                Self::SIZE,
                data.len()
            ));
        }

        let mut parser = Parser::new(data);
        parser.advance_by(4)?;
        let mod_offset = parser.read_le::<u32>()?;
        parser.advance_by(8)?;

        let magic = parser.read_bytes(4)?;
        if magic != Self::MAGIC {
            return Err(malformed_error!("Invalid NRO magic: {:02x?}", magic));
        }

        let version = parser.read_le::<u32>()?;
        let size = parser.read_le::<u32>()?;
        let flags = parser.read_le::<u32>()?;
        let text = NroSegment::read(&mut parser)?;
        let ro = NroSegment::read(&mut parser)?;
        let data_segment = NroSegment::read(&mut parser)?;
        let bss_size = parser.read_le::<u32>()?;
        parser.advance_by(4)?;

        let mut build_id = [0_u8; 32];
        build_id.copy_from_slice(parser.read_bytes(32)?);
        parser.advance_by(8)?;

        Ok(NroHeader {
            mod_offset,
            version,
            size,
            flags,
            text,
            ro,
            data: data_segment,
            bss_size,
            build_id,
            api_info: NroSegment::read(&mut parser)?,
            dynstr: NroSegment::read(&mut parser)?,
            dynsym: NroSegment::read(&mut parser)?,
        })
    }
}

/// Where one segment ends up in guest memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentPlan {
    /// Segment name (`text`, `ro`, `data`).
    pub name: &'static str,
    /// Guest address of the first byte.
    pub guest_address: u64,
    /// Bytes reserved in guest memory (file bytes plus bss).
    pub size: usize,
    /// Offset of the file-backed bytes.
    pub file_offset: usize,
    /// Number of file-backed bytes.
    pub file_size: usize,
    /// Guest permissions.
    pub permissions: MemoryProtection,
    /// Region kind reported to the guest.
    pub kind: RegionKind,
}

/// Loader for [`crate::ImageFormat::Nro`] images.
pub struct NroLoader {
    image: File,
    header: NroHeader,
    base: u64,
}

impl NroLoader {
    /// Validates `image` and prepares it for loading at the configured guest base.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::Malformed`] if the header is damaged or the text segment is empty
    /// - [`crate::Error::OutOfBounds`] if a segment lies outside the image
    pub fn new(image: File, config: &KernelConfig) -> Result<Self> {
        let header = NroHeader::parse(image.data())?;

        if header.text.size == 0 {
            return Err(malformed_error!("NRO text segment is empty"));
        }
        for segment in [header.text, header.ro, header.data] {
            if segment.end() > image.len() as u64 {
                return Err(out_of_bounds_error!());
            }
        }

        Ok(NroLoader {
            image,
            header,
            base: config.guest_base,
        })
    }

    /// The decoded header.
    #[must_use]
    pub fn header(&self) -> &NroHeader {
        &self.header
    }

    /// Guest layout of the image for the given page size.
    ///
    /// Empty segments are left out.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the layout overflows the address space.
    pub fn plan(&self, page_size: usize) -> Result<Vec<SegmentPlan>> {
        let align = |size: usize| page_align_up(size, page_size).ok_or(out_of_bounds_error!());

        let text = self.header.text.size as usize;
        let ro = self.header.ro.size as usize;
        let data = self.header.data.size as usize;
        let data_and_bss = data
            .checked_add(self.header.bss_size as usize)
            .ok_or(out_of_bounds_error!())?;

        let ro_address = self
            .base
            .checked_add(align(text)? as u64)
            .ok_or(out_of_bounds_error!())?;
        let data_address = ro_address
            .checked_add(align(ro)? as u64)
            .ok_or(out_of_bounds_error!())?;

        let segments = [
            SegmentPlan {
                name: "text",
                guest_address: self.base,
                size: text,
                file_offset: self.header.text.offset as usize,
                file_size: text,
                permissions: MemoryProtection::READ_EXECUTE,
                kind: RegionKind::CodeStatic,
            },
            SegmentPlan {
                name: "ro",
                guest_address: ro_address,
                size: ro,
                file_offset: self.header.ro.offset as usize,
                file_size: ro,
                permissions: MemoryProtection::READ,
                kind: RegionKind::CodeStatic,
            },
            SegmentPlan {
                name: "data",
                guest_address: data_address,
                size: data_and_bss,
                file_offset: self.header.data.offset as usize,
                file_size: data,
                permissions: MemoryProtection::READ_WRITE,
                kind: RegionKind::CodeMutable,
            },
        ];

        Ok(segments
            .into_iter()
            .filter(|segment| segment.size > 0)
            .collect())
    }
}

impl Loader for NroLoader {
    fn main_entry(&self) -> u64 {
        self.base
    }

    fn load_process_data(&self, process: &GuestProcess, kernel: &Kernel) -> Result<()> {
        let host = kernel.host();
        let page_size = host.page_size();

        for segment in self.plan(page_size)? {
            let contents = self
                .image
                .data_slice(segment.file_offset, segment.file_size)?;
            process.map_private(
                host,
                segment.guest_address,
                segment.size,
                segment.permissions,
                segment.kind,
                contents,
            )?;
            debug!(
                "Mapped NRO {} at {:#x} ({:#x} bytes)",
                segment.name, segment.guest_address, segment.size
            );
        }

        Ok(())
    }
}

impl std::fmt::Debug for NroLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NroLoader")
            .field("header", &self.header)
            .field("base", &format_args!("{:#x}", self.base))
            .finish_non_exhaustive()
    }
}

/// Guest layout of an NRO image without a running host, assuming [`PAGE_SIZE`] pages.
///
/// # Errors
/// Returns the same errors as [`NroLoader::new`] and [`NroLoader::plan`].
pub fn plan_image(image: File, config: &KernelConfig) -> Result<(NroHeader, Vec<SegmentPlan>)> {
    let loader = NroLoader::new(image, config)?;
    let plan = loader.plan(PAGE_SIZE)?;
    Ok((loader.header, plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test::factories::nro_image, Error};

    #[test]
    fn parse_header() {
        let image = nro_image(&[0x11; 0x100], &[0x22; 0x40], &[0x33; 0x20], 0x1000);
        let header = NroHeader::parse(&image).unwrap();

        assert_eq!(header.text, NroSegment { offset: 0, size: 0x180 });
        assert_eq!(header.ro, NroSegment { offset: 0x180, size: 0x40 });
        assert_eq!(header.data, NroSegment { offset: 0x1C0, size: 0x20 });
        assert_eq!(header.bss_size, 0x1000);
        assert_eq!(header.size, 0x1E0);
        assert_eq!(header.build_id[0], 0xB1);
    }

    #[test]
    fn bad_magic() {
        let mut image = nro_image(&[0; 4], &[], &[], 0);
        image[0x10..0x14].copy_from_slice(b"NSO0");

        assert!(matches!(
            NroHeader::parse(&image),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn truncated_header() {
        let image = nro_image(&[0; 4], &[], &[], 0);
        assert!(matches!(
            NroHeader::parse(&image[..0x7F]),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn segment_outside_image() {
        let mut image = nro_image(&[0; 4], &[], &[], 0);
        image[0x2C..0x30].copy_from_slice(&0x1000_u32.to_le_bytes());

        let result = NroLoader::new(File::from_mem(image).unwrap(), &KernelConfig::default());
        assert!(matches!(result, Err(Error::OutOfBounds)));
    }

    #[test]
    fn plan_layout() {
        let image = nro_image(&[0x11; 0x1000], &[0x22; 0x10], &[0x33; 0x10], 0x2000);
        let (_, plan) = plan_image(File::from_mem(image).unwrap(), &KernelConfig::default()).unwrap();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].guest_address, 0x800_0000);
        assert_eq!(plan[0].permissions, MemoryProtection::READ_EXECUTE);
        assert_eq!(plan[1].guest_address, 0x800_2000);
        assert_eq!(plan[1].permissions, MemoryProtection::READ);
        assert_eq!(plan[2].guest_address, 0x800_3000);
        assert_eq!(plan[2].size, 0x2010);
        assert_eq!(plan[2].kind, RegionKind::CodeMutable);
    }

    #[test]
    fn plan_skips_empty_segments() {
        let image = nro_image(&[0x11; 0x10], &[], &[], 0);
        let (_, plan) = plan_image(File::from_mem(image).unwrap(), &KernelConfig::default()).unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name, "text");
    }

    #[test]
    fn plan_near_top_of_address_space() {
        let image = nro_image(&[0x11; 0x1000], &[0x22; 0x10], &[], 0);
        let config = KernelConfig::default().with_guest_range(u64::MAX - 0xFFF, 0xFFF);

        assert!(matches!(
            plan_image(File::from_mem(image).unwrap(), &config),
            Err(Error::OutOfBounds)
        ));
    }
}
