//! Guest process records.
//!
//! A [`GuestProcess`] is the registry of a guest program's threads plus the image memory its
//! loader mapped. The process identifier is the task identifier of the main thread; that
//! thread stays registered for the whole life of the process and is only removed together
//! with the process itself.
//!
//! # Thread Safety
//!
//! The registry sits behind a process-scoped `RwLock`. Kills take the write lock, lookups and
//! the execution engine's enumeration take the read lock. Mapped memory has its own lock so
//! guest memory access does not contend with thread management.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

use log::{debug, warn};
use strum::Display;

use crate::{
    kernel::{
        host::HostPlatform,
        memory::{page_align_up, GuestMemoryRegion, MemoryProtection, PrivateMemory, RegionKind},
        thread::{GuestThread, TaskId},
    },
    Error, Result,
};

/// Lifecycle status of a guest process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Display)]
pub enum ProcessStatus {
    /// The main thread exists but has not been started.
    #[default]
    Created,
    /// The main thread has been started.
    Started,
    /// The process is being torn down.
    Exiting,
}

/// A guest process: thread registry and loader-mapped memory.
#[derive(Debug)]
pub struct GuestProcess {
    pid: TaskId,
    argument: u64,
    threads: RwLock<BTreeMap<TaskId, Arc<GuestThread>>>,
    memory: RwLock<Vec<PrivateMemory>>,
    status: Mutex<ProcessStatus>,
}

impl GuestProcess {
    pub(crate) fn new(main: GuestThread, argument: u64) -> GuestProcess {
        let pid = main.tid();
        let mut threads = BTreeMap::new();
        threads.insert(pid, Arc::new(main));

        GuestProcess {
            pid,
            argument,
            threads: RwLock::new(threads),
            memory: RwLock::new(Vec::new()),
            status: Mutex::new(ProcessStatus::Created),
        }
    }

    /// Process identifier, equal to the main thread's task identifier.
    #[must_use]
    pub fn pid(&self) -> TaskId {
        self.pid
    }

    /// Argument the process was created with.
    #[must_use]
    pub fn argument(&self) -> u64 {
        self.argument
    }

    /// Current status.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the status lock is poisoned.
    pub fn status(&self) -> Result<ProcessStatus> {
        Ok(*lock!(self.status)?)
    }

    pub(crate) fn set_status(&self, status: ProcessStatus) -> Result<()> {
        *lock!(self.status)? = status;
        Ok(())
    }

    /// Looks up a registered thread.
    ///
    /// # Errors
    /// Returns [`Error::UnknownThread`] if `tid` is not registered.
    pub fn thread(&self, tid: TaskId) -> Result<Arc<GuestThread>> {
        read_lock!(self.threads)?
            .get(&tid)
            .cloned()
            .ok_or(Error::UnknownThread(tid))
    }

    /// The main thread.
    ///
    /// # Errors
    /// Returns [`Error::UnknownThread`] once the process has been torn down.
    pub fn main_thread(&self) -> Result<Arc<GuestThread>> {
        self.thread(self.pid)
    }

    /// Snapshot of all registered threads, ordered by task identifier.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn threads(&self) -> Result<Vec<Arc<GuestThread>>> {
        Ok(read_lock!(self.threads)?.values().cloned().collect())
    }

    /// Calls `f` for every registered thread while holding the registry read lock.
    ///
    /// # Errors
    /// Returns the first error produced by `f`, or [`Error::LockError`].
    pub fn for_each_thread<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&GuestThread) -> Result<()>,
    {
        let threads = read_lock!(self.threads)?;
        for thread in threads.values() {
            f(thread)?;
        }
        Ok(())
    }

    /// Number of registered threads.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the registry lock is poisoned.
    pub fn thread_count(&self) -> Result<usize> {
        Ok(read_lock!(self.threads)?.len())
    }

    /// Registers a freshly spawned thread.
    ///
    /// If the registry cannot be locked the thread is killed before the error is returned,
    /// so no host task outlives a failed registration.
    pub(crate) fn insert_thread(
        &self,
        host: &dyn HostPlatform,
        thread: GuestThread,
    ) -> Result<Arc<GuestThread>> {
        let mut threads = match write_lock!(self.threads) {
            Ok(threads) => threads,
            Err(error) => {
                if let Err(kill) = thread.kill(host) {
                    warn!("Failed to kill unregistered thread with TID: {}: {kill}", thread.tid());
                }
                return Err(error);
            }
        };

        let thread = Arc::new(thread);
        threads.insert(thread.tid(), thread.clone());
        Ok(thread)
    }

    /// Kills one secondary thread and removes it from the registry.
    ///
    /// # Errors
    ///
    /// - [`Error::MainThreadKill`] if `tid` is the main thread
    /// - [`Error::UnknownThread`] if `tid` is not registered; nothing is changed
    /// - [`Error::TaskKillFailure`] if the host task survives; the thread stays registered
    pub(crate) fn kill_secondary(&self, host: &dyn HostPlatform, tid: TaskId) -> Result<()> {
        if tid == self.pid {
            return Err(Error::MainThreadKill(tid));
        }

        let mut threads = write_lock!(self.threads)?;
        let Some(thread) = threads.get(&tid) else {
            return Err(Error::UnknownThread(tid));
        };

        thread.kill(host)?;
        threads.remove(&tid);
        Ok(())
    }

    /// Kills every thread and releases mapped memory.
    ///
    /// Continues past individual failures and returns the first one afterwards. Threads whose
    /// host task survives stay registered with their stack and TLS, so calling this again
    /// retries exactly those.
    ///
    /// # Errors
    /// Returns the first [`Error::TaskKillFailure`] encountered, or [`Error::LockError`].
    pub(crate) fn kill_all(&self, host: &dyn HostPlatform) -> Result<()> {
        self.set_status(ProcessStatus::Exiting)?;

        let mut first_error = None;
        let mut threads = write_lock!(self.threads)?;
        threads.retain(|tid, thread| match thread.kill(host) {
            Ok(()) => false,
            Err(error) => {
                warn!("Failed to kill thread with TID: {tid}: {error}");
                first_error.get_or_insert(error);
                true
            }
        });
        drop(threads);

        let released = std::mem::take(&mut *write_lock!(self.memory)?);
        debug!("Released {} mapped regions of {}", released.len(), self.pid);
        drop(released);

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Maps image memory at `guest_address`.
    ///
    /// `size` bytes are reserved, filled from `contents` and protected with `permissions`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if `guest_address` is not page-aligned or the page-rounded
    ///   range overlaps an existing region
    /// - [`Error::AllocationFailure`], [`Error::ProtectionFailure`] from the host
    pub fn map_private(
        &self,
        host: &dyn HostPlatform,
        guest_address: u64,
        size: usize,
        permissions: MemoryProtection,
        kind: RegionKind,
        contents: &[u8],
    ) -> Result<GuestMemoryRegion> {
        let Some(mapped_size) = page_align_up(size, host.page_size()) else {
            return Err(out_of_bounds_error!());
        };

        let mut memory = write_lock!(self.memory)?;
        if memory
            .iter()
            .any(|mapped| mapped.region().overlaps(guest_address, mapped_size))
        {
            return Err(Error::InvalidAddress {
                address: guest_address,
                reason: "overlaps an existing region",
            });
        }

        let mapped = PrivateMemory::map(host, guest_address, size, permissions, kind, contents)?;
        let region = mapped.region();
        memory.push(mapped);
        Ok(region)
    }

    /// Copies `len` bytes out of guest memory at `guest_address`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if no region contains the address or it is not readable
    /// - [`Error::OutOfBounds`] if the range runs past the end of the region
    pub fn read_memory(&self, guest_address: u64, len: usize) -> Result<Vec<u8>> {
        let memory = read_lock!(self.memory)?;
        let Some(region) = memory
            .iter()
            .find(|mapped| mapped.region().contains(guest_address))
        else {
            return Err(Error::InvalidAddress {
                address: guest_address,
                reason: "not mapped",
            });
        };
        Ok(region.read(guest_address, len)?.to_vec())
    }

    /// Copies `bytes` into guest memory at `guest_address`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] if no region contains the address or it is not writable
    /// - [`Error::OutOfBounds`] if the range runs past the end of the region
    pub fn write_memory(&self, guest_address: u64, bytes: &[u8]) -> Result<()> {
        let mut memory = write_lock!(self.memory)?;
        let Some(region) = memory
            .iter_mut()
            .find(|mapped| mapped.region().contains(guest_address))
        else {
            return Err(Error::InvalidAddress {
                address: guest_address,
                reason: "not mapped",
            });
        };
        region.write(guest_address, bytes)
    }

    /// Descriptors of all loader-mapped regions, in mapping order.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the memory lock is poisoned.
    pub fn regions(&self) -> Result<Vec<GuestMemoryRegion>> {
        Ok(read_lock!(self.memory)?
            .iter()
            .map(PrivateMemory::region)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kernel::{config::TaskCapabilities, thread::ThreadState},
        test::{noop_trampoline, MockHost},
    };

    fn thread(host: &MockHost) -> GuestThread {
        GuestThread::spawn(
            host,
            TaskCapabilities::default(),
            noop_trampoline,
            0x800_0000,
            0,
            0x4000,
        )
        .unwrap()
    }

    fn process(host: &MockHost, secondary: usize) -> GuestProcess {
        let process = GuestProcess::new(thread(host), 0);
        for _ in 0..secondary {
            process.insert_thread(host, thread(host)).unwrap();
        }
        process
    }

    #[test]
    fn main_thread_is_pid() {
        let host = MockHost::new();
        let process = process(&host, 0);

        assert_eq!(process.thread_count().unwrap(), 1);
        assert_eq!(process.main_thread().unwrap().tid(), process.pid());
        assert_eq!(process.status().unwrap(), ProcessStatus::Created);
    }

    #[test]
    fn kill_secondary_removes_one() {
        let host = MockHost::new();
        let process = process(&host, 2);
        let victim = process.threads().unwrap()[1].tid();

        process.kill_secondary(&host, victim).unwrap();
        assert_eq!(process.thread_count().unwrap(), 2);
        assert!(matches!(
            process.thread(victim),
            Err(Error::UnknownThread(tid)) if tid == victim
        ));
        assert!(matches!(
            process.kill_secondary(&host, victim),
            Err(Error::UnknownThread(_))
        ));
    }

    #[test]
    fn kill_secondary_rejects_main() {
        let host = MockHost::new();
        let process = process(&host, 1);

        assert!(matches!(
            process.kill_secondary(&host, process.pid()),
            Err(Error::MainThreadKill(_))
        ));
        assert_eq!(process.thread_count().unwrap(), 2);
        assert!(host.killed().is_empty());
    }

    #[test]
    fn kill_all_continues_past_failures() {
        let host = MockHost::new();
        let process = process(&host, 2);
        let threads = process.threads().unwrap();
        host.fail_kill(threads[1].tid(), libc::EPERM);

        let result = process.kill_all(&host);
        assert!(matches!(result, Err(Error::TaskKillFailure { .. })));
        assert_eq!(threads[0].state().unwrap(), ThreadState::Killed);
        assert_eq!(threads[2].state().unwrap(), ThreadState::Killed);
        assert_eq!(process.status().unwrap(), ProcessStatus::Exiting);

        assert_eq!(process.thread_count().unwrap(), 1);
        assert!(threads[1].holds_resources().unwrap());
        assert_ne!(threads[1].state().unwrap(), ThreadState::Killed);
    }

    #[test]
    fn kill_all_retries_survivors() {
        let host = MockHost::new();
        let process = process(&host, 1);
        let worker = process.threads().unwrap()[1].clone();
        host.fail_kill(worker.tid(), libc::EPERM);
        assert!(process.kill_all(&host).is_err());

        host.allow_kill(worker.tid());
        process.kill_all(&host).unwrap();

        assert_eq!(process.thread_count().unwrap(), 0);
        assert_eq!(worker.state().unwrap(), ThreadState::Killed);
        assert!(!worker.holds_resources().unwrap());
        assert_eq!(
            host.killed().iter().filter(|tid| **tid == worker.tid()).count(),
            1
        );
    }

    #[test]
    fn insert_into_poisoned_registry_kills_thread() {
        let host = MockHost::new();
        let process = process(&host, 0);
        let _ = std::thread::scope(|s| {
            s.spawn(|| {
                let _threads = process.threads.write().unwrap();
                panic!("poison the registry");
            })
            .join()
        });

        let orphan = thread(&host);
        let tid = orphan.tid();
        assert!(matches!(
            process.insert_thread(&host, orphan),
            Err(Error::LockError)
        ));
        assert_eq!(host.killed(), vec![tid]);
        assert_eq!(host.live_mappings(), 2);
    }

    #[test]
    fn overlap_uses_mapped_size() {
        let host = MockHost::new();
        let process = process(&host, 0);
        process
            .map_private(
                &host,
                0x800_0000,
                0x1000,
                MemoryProtection::READ,
                RegionKind::CodeStatic,
                &[],
            )
            .unwrap();

        // 0x100 bytes round up to a page that ends exactly at the existing region.
        let below = process
            .map_private(
                &host,
                0x7FF_F000,
                0x100,
                MemoryProtection::READ,
                RegionKind::CodeStatic,
                &[],
            )
            .unwrap();
        assert_eq!(below.guest_end(), 0x800_0000);

        assert!(matches!(
            process.map_private(
                &host,
                0x7FF_F800,
                0x100,
                MemoryProtection::READ,
                RegionKind::CodeStatic,
                &[],
            ),
            Err(Error::InvalidAddress { .. })
        ));
        assert_eq!(process.regions().unwrap().len(), 2);
    }

    #[test]
    fn guest_memory_translation() {
        let host = MockHost::new();
        let process = process(&host, 0);

        process
            .map_private(
                &host,
                0x800_0000,
                0x1000,
                MemoryProtection::READ_WRITE,
                RegionKind::CodeMutable,
                b"hello",
            )
            .unwrap();

        assert_eq!(process.read_memory(0x800_0000, 5).unwrap(), b"hello");
        process.write_memory(0x800_0001, b"ey").unwrap();
        assert_eq!(process.read_memory(0x800_0000, 3).unwrap(), b"hey");

        assert!(matches!(
            process.read_memory(0x900_0000, 1),
            Err(Error::InvalidAddress { .. })
        ));
        assert!(matches!(
            process.read_memory(0x800_0FFF, 2),
            Err(Error::OutOfBounds)
        ));
        assert!(matches!(
            process.map_private(
                &host,
                0x800_0800,
                0x1000,
                MemoryProtection::READ,
                RegionKind::CodeStatic,
                &[],
            ),
            Err(Error::InvalidAddress { .. })
        ));
        assert_eq!(process.regions().unwrap().len(), 1);
    }

    #[test]
    fn kill_all_releases_memory() {
        let host = MockHost::new();
        let process = process(&host, 0);
        process
            .map_private(
                &host,
                0x800_0000,
                0x1000,
                MemoryProtection::READ,
                RegionKind::CodeStatic,
                &[],
            )
            .unwrap();
        assert_eq!(host.live_mappings(), 3);

        process.kill_all(&host).unwrap();
        assert_eq!(host.live_mappings(), 0);
        assert!(process.regions().unwrap().is_empty());
    }
}
