use guestkernel::{HostPlatform, KernelConfig, LinuxHost, LoaderRegistry, ThreadContext};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    output::{hex, print_output},
};

#[derive(Serialize)]
struct LayoutInfo {
    guest_base: String,
    guest_end: String,
    default_stack_size: String,
    page_size: usize,
    tls_block_size: usize,
    share_address_space: bool,
    share_descriptors: bool,
    share_filesystem: bool,
    distinct_tls: bool,
    formats: Vec<String>,
}

pub fn run(opts: &GlobalOptions) -> anyhow::Result<()> {
    let config = KernelConfig::default();
    let caps = config.capabilities;

    let info = LayoutInfo {
        guest_base: hex(config.guest_base),
        guest_end: hex(config.guest_end()),
        default_stack_size: hex(config.default_stack_size as u64),
        page_size: LinuxHost::new().page_size(),
        tls_block_size: ThreadContext::SIZE,
        share_address_space: caps.share_address_space,
        share_descriptors: caps.share_descriptors,
        share_filesystem: caps.share_filesystem,
        distinct_tls: caps.distinct_tls,
        formats: LoaderRegistry::default()
            .formats()
            .iter()
            .map(ToString::to_string)
            .collect(),
    };

    print_output(&info, opts, |info| {
        let yes_no = |flag: bool| if flag { "yes" } else { "no" };
        println!("Guest range:          {}-{}", info.guest_base, info.guest_end);
        println!("Default stack size:   {}", info.default_stack_size);
        println!("Page size:            {:#x}", info.page_size);
        println!("TLS block size:       {:#x}", info.tls_block_size);
        println!("Shared address space: {}", yes_no(info.share_address_space));
        println!("Shared descriptors:   {}", yes_no(info.share_descriptors));
        println!("Shared filesystem:    {}", yes_no(info.share_filesystem));
        println!("Distinct TLS:         {}", yes_no(info.distinct_tls));
        println!("Image formats:        {}", info.formats.join(", "));
    })
}
