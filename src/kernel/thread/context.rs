//! Per-thread blocks shared with guest code.
//!
//! Two small structures cross the kernel/guest boundary when a thread is created:
//!
//! - [`ThreadContext`] lives at the start of the thread's TLS region. It carries the guest
//!   register file and is how the execution engine and the guest exchange state.
//! - [`LaunchBlock`] sits at the top of the thread's stack and tells the host trampoline
//!   where to jump and which TLS block belongs to it.
//!
//! Both are little-endian and read or written field by field, so their encoding does not
//! depend on the host's struct layout.

use crate::{
    file::io::{read_le_at, write_le_at},
    Result,
};

/// Number of general purpose registers (`x0`..`x30`).
pub const GENERAL_REGISTERS: usize = 31;

/// Execution state published by a thread context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ContextState {
    /// The context has been filled in but the guest has not picked it up.
    #[default]
    NotReady = 0,
    /// The guest is executing with this context.
    Running = 1,
    /// The guest is waiting for the kernel to service a request.
    WaitKernel = 2,
    /// The kernel finished servicing a request; the guest may resume.
    WaitRun = 3,
}

impl ContextState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ContextState::Running,
            2 => ContextState::WaitKernel,
            3 => ContextState::WaitRun,
            _ => ContextState::NotReady,
        }
    }
}

/// Guest register file stored at the base of a thread's TLS region.
///
/// Layout (little endian, 296 bytes):
///
/// | Offset | Field |
/// |--------|-------|
/// | 0x000 | `state: u32` |
/// | 0x004 | reserved `u32` |
/// | 0x008 | `registers: [u64; 31]` |
/// | 0x100 | `sp` |
/// | 0x108 | `pc` |
/// | 0x110 | `pstate` |
/// | 0x118 | `tpidr_el0` |
/// | 0x120 | `tpidrro_el0` |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadContext {
    /// Handshake state between guest and kernel.
    pub state: ContextState,
    /// General purpose registers.
    pub registers: [u64; GENERAL_REGISTERS],
    /// Stack pointer.
    pub sp: u64,
    /// Program counter.
    pub pc: u64,
    /// Processor state flags.
    pub pstate: u64,
    /// Read/write thread pointer.
    pub tpidr_el0: u64,
    /// Read-only thread pointer; points at this context's TLS region.
    pub tpidrro_el0: u64,
}

impl ThreadContext {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8 + GENERAL_REGISTERS * 8 + 5 * 8;

    /// Context of a thread that has not run yet.
    ///
    /// # Arguments
    /// * `entry` - Initial program counter
    /// * `argument` - Initial `x0`
    /// * `stack_top` - Initial stack pointer
    /// * `tls_base` - Address of the TLS region holding this context
    #[must_use]
    pub fn initial(entry: u64, argument: u64, stack_top: u64, tls_base: u64) -> Self {
        let mut registers = [0_u64; GENERAL_REGISTERS];
        registers[0] = argument;

        ThreadContext {
            state: ContextState::NotReady,
            registers,
            sp: stack_top,
            pc: entry,
            pstate: 0,
            tpidr_el0: 0,
            tpidrro_el0: tls_base,
        }
    }

    /// Serializes the context to the start of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than [`Self::SIZE`].
    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < Self::SIZE {
            return Err(out_of_bounds_error!());
        }

        let mut offset = 0;
        write_le_at(data, &mut offset, self.state as u32)?;
        write_le_at(data, &mut offset, 0_u32)?;
        for register in self.registers {
            write_le_at(data, &mut offset, register)?;
        }
        for value in [self.sp, self.pc, self.pstate, self.tpidr_el0, self.tpidrro_el0] {
            write_le_at(data, &mut offset, value)?;
        }
        Ok(())
    }

    /// Decodes a context from the start of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than [`Self::SIZE`].
    pub fn read_from(data: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let state = ContextState::from_raw(read_le_at::<u32>(data, &mut offset)?);
        let _reserved = read_le_at::<u32>(data, &mut offset)?;

        let mut registers = [0_u64; GENERAL_REGISTERS];
        for register in &mut registers {
            *register = read_le_at(data, &mut offset)?;
        }

        Ok(ThreadContext {
            state,
            registers,
            sp: read_le_at(data, &mut offset)?,
            pc: read_le_at(data, &mut offset)?,
            pstate: read_le_at(data, &mut offset)?,
            tpidr_el0: read_le_at(data, &mut offset)?,
            tpidrro_el0: read_le_at(data, &mut offset)?,
        })
    }
}

/// The trampoline's only argument: where to start and which TLS block to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct LaunchBlock {
    /// Guest entry point.
    pub entry: u64,
    /// Address of the thread's TLS region.
    pub tls_base: u64,
}

impl LaunchBlock {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Reads the launch block a trampoline received.
    ///
    /// # Safety
    ///
    /// `argument` must be the pointer passed to a [`crate::kernel::host::Trampoline`] by the
    /// kernel, which points at a live launch block on the task's stack.
    #[must_use]
    pub unsafe fn from_trampoline_argument(argument: *const std::ffi::c_void) -> LaunchBlock {
        std::ptr::read(argument.cast::<LaunchBlock>())
    }
}
