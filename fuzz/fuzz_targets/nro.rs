#![no_main]

use libfuzzer_sys::fuzz_target;
use guestkernel::{kernel::loader::nro::plan_image, File, KernelConfig};

fuzz_target!(|data: &[u8]| {
    if let Ok(image) = File::from_mem(data.to_vec()) {
        let _ = plan_image(image, &KernelConfig::default());
    }
});
