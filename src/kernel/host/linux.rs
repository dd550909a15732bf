//! Linux implementation of the host primitives.
//!
//! Stacks are raw `mmap` reservations with `MAP_STACK | MAP_NORESERVE`; shared memory is a
//! `memfd` mapped `MAP_SHARED` through `memmap2`; private memory is an anonymous `memmap2`
//! mapping. Fork policy is applied with `madvise`, page permissions with `mprotect`, task
//! duplication with `clone(2)` and teardown with `kill(2)` followed by `waitpid(2)`.

use std::{
    ffi::c_void,
    fs, io,
    os::fd::{FromRawFd, OwnedFd},
    ptr::{self, NonNull},
};

use log::{debug, trace};
use memmap2::{Advice, MmapMut, MmapOptions};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::waitpid,
    },
    unistd::Pid,
};

use crate::{
    kernel::{
        config::TaskCapabilities,
        constants::PAGE_SIZE,
        host::{ForkPolicy, HostMapping, HostPlatform, TaskSpec},
        memory::MemoryProtection,
        thread::TaskId,
    },
    Error, Result,
};

/// The host platform backed by Linux system calls.
#[derive(Clone, Copy, Debug)]
pub struct LinuxHost {
    page_size: usize,
}

impl LinuxHost {
    /// Queries the host page size and returns a ready platform.
    #[must_use]
    pub fn new() -> Self {
        let reported = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = usize::try_from(reported)
            .ok()
            .filter(|size| size.is_power_of_two())
            .unwrap_or(PAGE_SIZE);

        LinuxHost { page_size }
    }
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates capability toggles into `clone(2)` flags.
pub(crate) fn clone_flags(capabilities: &TaskCapabilities) -> libc::c_int {
    let mut flags = libc::SIGCHLD;
    if capabilities.share_descriptors {
        flags |= libc::CLONE_FILES;
    }
    if capabilities.share_filesystem {
        flags |= libc::CLONE_FS;
    }
    if capabilities.distinct_tls {
        flags |= libc::CLONE_SETTLS;
    }
    if capabilities.share_address_space {
        flags |= libc::CLONE_VM;
    }
    flags
}

fn madvise(address: u64, size: u64, policy: ForkPolicy) -> io::Result<()> {
    let advice = match policy {
        ForkPolicy::DoFork => libc::MADV_DOFORK,
        ForkPolicy::DontFork => libc::MADV_DONTFORK,
    };
    let len = usize::try_from(size).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    if unsafe { libc::madvise(address as *mut c_void, len, advice) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[derive(Debug)]
enum Backing {
    /// Raw `mmap` reservation, unmapped on drop.
    Stack { ptr: NonNull<u8>, len: usize },
    Mapped(MmapMut),
}

#[derive(Debug)]
struct LinuxMapping {
    backing: Backing,
}

// The mapping is exclusively owned; shared access only hands out `&[u8]`.
unsafe impl Send for LinuxMapping {}
unsafe impl Sync for LinuxMapping {}

impl HostMapping for LinuxMapping {
    fn address(&self) -> u64 {
        match &self.backing {
            Backing::Stack { ptr, .. } => ptr.as_ptr() as u64,
            Backing::Mapped(mmap) => mmap.as_ptr() as u64,
        }
    }

    fn len(&self) -> usize {
        match &self.backing {
            Backing::Stack { len, .. } => *len,
            Backing::Mapped(mmap) => mmap.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Stack { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
            Backing::Mapped(mmap) => &mmap[..],
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Stack { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
            Backing::Mapped(mmap) => &mut mmap[..],
        }
    }

    fn protect(&mut self, offset: usize, len: usize, protection: MemoryProtection) -> Result<()> {
        let Some(end) = offset.checked_add(len) else {
            return Err(out_of_bounds_error!());
        };
        if end > self.len() {
            return Err(out_of_bounds_error!());
        }

        let address = self.address() + offset as u64;
        let result =
            unsafe { libc::mprotect(address as *mut c_void, len, protection.to_host()) };
        if result != 0 {
            return Err(Error::ProtectionFailure {
                address,
                size: len,
                source: io::Error::last_os_error(),
            });
        }

        trace!("Protected {len:#x} bytes at {address:#x} as {protection}");
        Ok(())
    }

    fn set_fork_policy(&self, policy: ForkPolicy) -> Result<()> {
        let result = match &self.backing {
            Backing::Stack { ptr, len } => madvise(ptr.as_ptr() as u64, *len as u64, policy),
            Backing::Mapped(mmap) => mmap.advise(match policy {
                ForkPolicy::DoFork => Advice::DoFork,
                ForkPolicy::DontFork => Advice::DontFork,
            }),
        };

        result.map_err(|source| Error::ForkPolicyFailure {
            address: self.address(),
            size: self.len() as u64,
            source,
        })
    }
}

impl Drop for LinuxMapping {
    fn drop(&mut self) {
        if let Backing::Stack { ptr, len } = self.backing {
            if unsafe { libc::munmap(ptr.as_ptr().cast::<c_void>(), len) } != 0 {
                debug!(
                    "Failed to unmap stack at {:#x}: {}",
                    ptr.as_ptr() as u64,
                    io::Error::last_os_error()
                );
            }
        }
    }
}

impl HostPlatform for LinuxHost {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn set_range_fork_policy(&self, base: u64, size: u64, policy: ForkPolicy) -> Result<()> {
        match madvise(base, size, policy) {
            Ok(()) => Ok(()),
            // Parts of the range are not mapped yet; the mapped parts were still advised.
            Err(error) if error.raw_os_error() == Some(libc::ENOMEM) => {
                trace!("{policy} over {base:#x}+{size:#x} skipped unmapped gaps");
                Ok(())
            }
            Err(source) => Err(Error::ForkPolicyFailure {
                address: base,
                size,
                source,
            }),
        }
    }

    fn map_stack(&self, size: usize) -> Result<Box<dyn HostMapping>> {
        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(Error::AllocationFailure {
                what: "stack",
                size,
                source: io::Error::last_os_error(),
            });
        }

        let Some(ptr) = NonNull::new(address.cast::<u8>()) else {
            return Err(Error::AllocationFailure {
                what: "stack",
                size,
                source: io::Error::from(io::ErrorKind::AddrNotAvailable),
            });
        };

        trace!("Mapped stack of {size:#x} bytes at {:#x}", ptr.as_ptr() as u64);
        Ok(Box::new(LinuxMapping {
            backing: Backing::Stack { ptr, len: size },
        }))
    }

    fn map_shared(&self, size: usize) -> Result<Box<dyn HostMapping>> {
        let allocation_failure = |source| Error::AllocationFailure {
            what: "shared",
            size,
            source,
        };

        let fd = unsafe { libc::memfd_create(c"guestkernel-shared".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(allocation_failure(io::Error::last_os_error()));
        }
        let file = fs::File::from(unsafe { OwnedFd::from_raw_fd(fd) });
        file.set_len(size as u64).map_err(allocation_failure)?;

        // The descriptor can be closed once mapped; the mapping keeps the object alive.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(allocation_failure)?;

        trace!("Mapped shared memory of {size:#x} bytes at {:#x}", mmap.as_ptr() as u64);
        Ok(Box::new(LinuxMapping {
            backing: Backing::Mapped(mmap),
        }))
    }

    fn map_private(&self, size: usize) -> Result<Box<dyn HostMapping>> {
        let mmap = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|source| Error::AllocationFailure {
                what: "private",
                size,
                source,
            })?;

        trace!("Mapped private memory of {size:#x} bytes at {:#x}", mmap.as_ptr() as u64);
        Ok(Box::new(LinuxMapping {
            backing: Backing::Mapped(mmap),
        }))
    }

    fn spawn_task(&self, spec: &TaskSpec) -> Result<TaskId> {
        let tls = if spec.capabilities.distinct_tls {
            spec.tls_base as *mut c_void
        } else {
            ptr::null_mut()
        };

        let pid = unsafe {
            libc::clone(
                spec.trampoline,
                spec.stack_top as *mut c_void,
                clone_flags(&spec.capabilities),
                spec.launch_block as *mut c_void,
                ptr::null_mut::<libc::pid_t>(),
                tls,
                ptr::null_mut::<libc::pid_t>(),
            )
        };
        if pid == -1 {
            let errno = Errno::last();
            return Err(Error::TaskCreationFailure {
                errno: errno as i32,
                message: errno.desc().to_string(),
            });
        }

        Ok(TaskId::new(pid))
    }

    fn kill_task(&self, task: TaskId) -> Result<()> {
        let pid = Pid::from_raw(task.value());

        match kill(pid, Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(errno) => {
                return Err(Error::TaskKillFailure {
                    task,
                    errno: errno as i32,
                })
            }
        }

        loop {
            match waitpid(pid, None) {
                Ok(_) | Err(Errno::ECHILD) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(Error::TaskKillFailure {
                        task,
                        errno: errno as i32,
                    })
                }
            }
        }
    }
}
