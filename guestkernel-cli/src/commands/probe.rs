use std::ffi::{c_int, c_void};

use anyhow::Context;
use guestkernel::{
    ExecutionEngine, GuestThread, Kernel, KernelConfig, LinuxHost, TaskCapabilities, Trampoline,
};
use serde::Serialize;

use crate::{
    app::GlobalOptions,
    commands::common::{parse_size, RegionInfo},
    output::{hex, print_output, Align, TabWriter},
};

/// The probed task leaves as soon as it is scheduled.
extern "C" fn exit_immediately(_launch_block: *mut c_void) -> c_int {
    unsafe { libc::_exit(0) }
}

struct ProbeEngine;

impl ExecutionEngine for ProbeEngine {
    fn trampoline(&self) -> Trampoline {
        exit_immediately
    }

    fn run(&self, _kernel: &Kernel) -> guestkernel::Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct ProbeInfo {
    pid: i32,
    state: String,
    stack_size: String,
    entry: String,
    initial_sp: String,
    regions: Vec<RegionInfo>,
}

impl ProbeInfo {
    fn new(thread: &GuestThread) -> anyhow::Result<Self> {
        let context = thread.context()?;
        Ok(ProbeInfo {
            pid: thread.tid().value(),
            state: thread.state()?.to_string(),
            stack_size: hex(thread.stack_size() as u64),
            entry: hex(context.pc),
            initial_sp: hex(context.sp),
            regions: vec![thread.stack().into(), thread.tls().into()],
        })
    }
}

pub fn run(stack_size: Option<&str>, opts: &GlobalOptions) -> anyhow::Result<()> {
    // The trampoline runs host code, so the task keeps the host thread pointer.
    let config = KernelConfig::default().with_capabilities(TaskCapabilities {
        distinct_tls: false,
        ..TaskCapabilities::default()
    });
    let stack_size = match stack_size {
        Some(size) => parse_size(size)?,
        None => config.default_stack_size,
    };
    let entry = config.guest_base;

    let kernel = Kernel::builder()
        .host(LinuxHost::new())
        .engine(ProbeEngine)
        .config(config)
        .build()?;

    let process = kernel
        .create_process(entry, 0, stack_size)
        .context("failed to create guest process")?;
    let info = ProbeInfo::new(&*process.main_thread()?)?;
    kernel
        .kill_thread(process.pid())
        .context("failed to kill guest process")?;

    print_output(&info, opts, |info| {
        println!("PID:         {}", info.pid);
        println!("State:       {}", info.state);
        println!("Stack size:  {}", info.stack_size);
        println!("Entry:       {}", info.entry);
        println!("Initial SP:  {}", info.initial_sp);

        println!("\nRegions:");
        let mut tw = TabWriter::new(vec![
            ("Kind", Align::Left),
            ("Guest", Align::Right),
            ("Host", Align::Right),
            ("Size", Align::Right),
            ("Perm", Align::Left),
        ])
        .indent("  ");
        for r in &info.regions {
            tw.row(vec![
                r.kind.clone(),
                r.guest_address.clone(),
                r.host_address.clone(),
                r.size.clone(),
                r.permissions.clone(),
            ]);
        }
        tw.print();
    })
}
