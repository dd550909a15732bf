use std::path::Path;

use anyhow::{bail, Context};
use guestkernel::{kernel::loader::nro::plan_image, File, ImageFormat, KernelConfig};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    output::{hex, print_output, Align, TabWriter},
};

#[derive(Serialize)]
struct ImageInfo {
    format: String,
    size: usize,
    version: u32,
    flags: String,
    build_id: String,
    entry: String,
    bss_size: String,
    segments: Vec<SegmentInfo>,
}

#[derive(Serialize)]
struct SegmentInfo {
    name: String,
    guest_address: String,
    size: String,
    file_offset: String,
    file_size: String,
    permissions: String,
    kind: String,
}

pub fn run(path: &Path, format: &str, opts: &GlobalOptions) -> anyhow::Result<()> {
    let Ok(parsed) = format.parse::<ImageFormat>() else {
        bail!("unsupported image format: {format}");
    };

    let image = File::from_file(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?;
    let size = image.len();
    let config = KernelConfig::default();

    let info = match parsed {
        ImageFormat::Nro => {
            let (header, plan) = plan_image(image, &config)
                .with_context(|| format!("failed to decode image: {}", path.display()))?;
            ImageInfo {
                format: parsed.to_string(),
                size,
                version: header.version,
                flags: hex(header.flags),
                build_id: header.build_id.iter().map(|b| format!("{b:02x}")).collect(),
                entry: hex(config.guest_base),
                bss_size: hex(header.bss_size),
                segments: plan
                    .into_iter()
                    .map(|segment| SegmentInfo {
                        name: segment.name.to_string(),
                        guest_address: hex(segment.guest_address),
                        size: hex(segment.size as u64),
                        file_offset: hex(segment.file_offset as u64),
                        file_size: hex(segment.file_size as u64),
                        permissions: segment.permissions.to_string(),
                        kind: segment.kind.to_string(),
                    })
                    .collect(),
            }
        }
    };

    print_output(&info, opts, |info| {
        println!("Format:     {}", info.format);
        println!("File size:  {}", info.size);
        println!("Version:    {}", info.version);
        println!("Flags:      {}", info.flags);
        println!("Build id:   {}", info.build_id);
        println!("Entry:      {}", info.entry);
        println!("Bss size:   {}", info.bss_size);

        if !info.segments.is_empty() {
            println!("\nSegments:");
            let mut tw = TabWriter::new(vec![
                ("Name", Align::Left),
                ("Guest", Align::Right),
                ("Size", Align::Right),
                ("File offset", Align::Right),
                ("File size", Align::Right),
                ("Perm", Align::Left),
                ("Kind", Align::Left),
            ])
            .indent("  ");
            for s in &info.segments {
                tw.row(vec![
                    s.name.clone(),
                    s.guest_address.clone(),
                    s.size.clone(),
                    s.file_offset.clone(),
                    s.file_size.clone(),
                    s.permissions.clone(),
                    s.kind.clone(),
                ]);
            }
            tw.print();
        }
    })
}
