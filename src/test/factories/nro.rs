use crate::kernel::loader::nro::NroHeader;

/// Byte pattern of the build id written into every factory image.
const BUILD_ID: [u8; 32] = [0xB1; 32];

/// Builds an NRO image whose text segment starts at offset zero and includes the header.
///
/// The ro and data segments follow the text segment back to back; `bss` only appears in
/// the header.
pub fn nro_image(text: &[u8], ro: &[u8], data: &[u8], bss: u32) -> Vec<u8> {
    let text_size = (NroHeader::SIZE + text.len()) as u32;
    let ro_offset = text_size;
    let data_offset = ro_offset + ro.len() as u32;
    let total = data_offset + data.len() as u32;

    let mut image = vec![0_u8; NroHeader::SIZE];
    // b 0x80
    image[0x00..0x04].copy_from_slice(&0x1400_0020_u32.to_le_bytes());
    image[0x04..0x08].copy_from_slice(&(NroHeader::SIZE as u32).to_le_bytes());
    image[0x10..0x14].copy_from_slice(NroHeader::MAGIC);

    let fields = [
        (0x18, total),
        (0x20, 0),
        (0x24, text_size),
        (0x28, ro_offset),
        (0x2C, ro.len() as u32),
        (0x30, data_offset),
        (0x34, data.len() as u32),
        (0x38, bss),
    ];
    for (offset, value) in fields {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
    image[0x40..0x60].copy_from_slice(&BUILD_ID);

    image.extend_from_slice(text);
    image.extend_from_slice(ro);
    image.extend_from_slice(data);
    image
}
