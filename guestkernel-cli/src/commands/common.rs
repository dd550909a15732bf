use anyhow::Context;
use guestkernel::GuestMemoryRegion;
use serde::Serialize;

use crate::output::hex;

/// Parse a size string supporting hex (0x...) and decimal.
pub fn parse_size(s: &str) -> anyhow::Result<usize> {
    let trimmed = s.trim();
    if let Some(digits) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        usize::from_str_radix(digits, 16).with_context(|| format!("invalid hex size: {s}"))
    } else {
        trimmed
            .parse::<usize>()
            .with_context(|| format!("invalid size: {s}"))
    }
}

/// A guest memory region as printed by the CLI.
#[derive(Serialize)]
pub struct RegionInfo {
    pub kind: String,
    pub guest_address: String,
    pub host_address: String,
    pub size: String,
    pub permissions: String,
}

impl From<GuestMemoryRegion> for RegionInfo {
    fn from(region: GuestMemoryRegion) -> Self {
        RegionInfo {
            kind: region.kind.to_string(),
            guest_address: hex(region.guest_address),
            host_address: hex(region.host_address),
            size: hex(region.size as u64),
            permissions: region.permissions.to_string(),
        }
    }
}
