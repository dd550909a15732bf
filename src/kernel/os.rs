//! The kernel session.
//!
//! A [`Kernel`] owns one main-process slot and the collaborators needed to fill it: a host
//! platform, an execution engine, a configuration and the loader registry. There is no
//! global "current process"; independent sessions can coexist, which is how the test suite
//! runs them side by side.
//!
//! # Lifecycle
//!
//! ```text
//! execute(image, format)
//!   -> loader = registry[format]           (UnsupportedFormat, nothing allocated)
//!   -> create_process(entry, 0, stack)     (guest range DontFork, stack, guard, TLS, clone)
//!   -> loader.load_process_data(process)
//!   -> start_thread(pid)                   (Created -> Started)
//!   -> engine.run()
//! kill_thread(pid)                          (whole process: every thread, then the record)
//! kill_thread(tid)                          (one secondary thread)
//! ```

use std::sync::{Arc, RwLock};

use log::{debug, warn};

use crate::{
    kernel::{
        builder::KernelBuilder,
        config::KernelConfig,
        engine::ExecutionEngine,
        host::{ForkPolicy, HostPlatform},
        loader::LoaderRegistry,
        process::{GuestProcess, ProcessStatus},
        thread::{GuestThread, TaskId, ThreadState},
    },
    Error, File, Result,
};

/// A guest kernel session.
pub struct Kernel {
    host: Arc<dyn HostPlatform>,
    engine: Arc<dyn ExecutionEngine>,
    config: KernelConfig,
    loaders: LoaderRegistry,
    process: RwLock<Option<Arc<GuestProcess>>>,
}

impl Kernel {
    pub(crate) fn new(
        host: Arc<dyn HostPlatform>,
        engine: Arc<dyn ExecutionEngine>,
        config: KernelConfig,
        loaders: LoaderRegistry,
    ) -> Kernel {
        Kernel {
            host,
            engine,
            config,
            loaders,
            process: RwLock::new(None),
        }
    }

    /// Starts assembling a session.
    #[must_use]
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The host platform.
    #[must_use]
    pub fn host(&self) -> &dyn HostPlatform {
        self.host.as_ref()
    }

    /// The execution engine.
    #[must_use]
    pub fn engine(&self) -> &dyn ExecutionEngine {
        self.engine.as_ref()
    }

    /// The registered loaders.
    #[must_use]
    pub fn loaders(&self) -> &LoaderRegistry {
        &self.loaders
    }

    /// The live process, if any.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the process slot is poisoned.
    pub fn process(&self) -> Result<Option<Arc<GuestProcess>>> {
        Ok(read_lock!(self.process)?.clone())
    }

    /// Looks up a thread of the live process.
    ///
    /// # Errors
    /// Returns [`Error::UnknownThread`] if there is no live process or no such thread.
    pub fn thread(&self, tid: TaskId) -> Result<Arc<GuestThread>> {
        match self.process()? {
            Some(process) => process.thread(tid),
            None => Err(Error::UnknownThread(tid)),
        }
    }

    fn spawn_thread(&self, entry: u64, argument: u64, stack_size: usize) -> Result<GuestThread> {
        self.host.set_range_fork_policy(
            self.config.guest_base,
            self.config.guest_extent,
            ForkPolicy::DontFork,
        )?;

        GuestThread::spawn(
            self.host.as_ref(),
            self.config.capabilities,
            self.engine.trampoline(),
            entry,
            argument,
            stack_size,
        )
    }

    /// Creates the session's process with a main thread that starts at `entry`.
    ///
    /// The guest range is excluded from task duplication, then a stack with a guard page and
    /// a TLS region are allocated and the calling task is duplicated into the main thread.
    /// The main thread is left in [`ThreadState::Created`].
    ///
    /// Either a complete process is returned and stored in the session, or nothing is
    /// allocated.
    ///
    /// # Errors
    ///
    /// - [`Error::ProcessAlreadyExists`] if the session already has a live process
    /// - [`Error::ForkPolicyFailure`] if the guest range or a region cannot be advised
    /// - [`Error::AllocationFailure`] if the stack or TLS region cannot be mapped
    /// - [`Error::ProtectionFailure`] if the guard page cannot be installed
    /// - [`Error::TaskCreationFailure`] if the host refuses to duplicate the task
    pub fn create_process(
        &self,
        entry: u64,
        argument: u64,
        stack_size: usize,
    ) -> Result<Arc<GuestProcess>> {
        let mut slot = write_lock!(self.process)?;
        if let Some(existing) = slot.as_ref() {
            return Err(Error::ProcessAlreadyExists(existing.pid()));
        }

        let main = self.spawn_thread(entry, argument, stack_size)?;
        let process = Arc::new(GuestProcess::new(main, argument));
        debug!(
            "Successfully created process with PID: {}",
            process.pid().value()
        );

        *slot = Some(process.clone());
        Ok(process)
    }

    /// Creates a secondary thread in the live process.
    ///
    /// Follows the same allocation sequence as [`Kernel::create_process`]. The thread is
    /// registered in [`ThreadState::Created`].
    ///
    /// # Errors
    ///
    /// - [`Error::NoProcess`] if the session has no live process
    /// - The allocation errors listed on [`Kernel::create_process`]
    pub fn create_thread(
        &self,
        entry: u64,
        argument: u64,
        stack_size: usize,
    ) -> Result<Arc<GuestThread>> {
        // Held for the whole creation so a concurrent process kill cannot miss the new thread.
        let slot = read_lock!(self.process)?;
        let Some(process) = slot.as_ref() else {
            return Err(Error::NoProcess);
        };

        let thread = self.spawn_thread(entry, argument, stack_size)?;
        debug!("Created thread with TID: {}", thread.tid().value());
        process.insert_thread(self.host.as_ref(), thread)
    }

    /// Kills a thread, or the whole process when `tid` is the process id.
    ///
    /// Killing the main thread kills every thread of the process, releases its memory and
    /// empties the session slot. Individual kill failures do not stop the teardown; the
    /// first one is returned afterwards and the process stays live with only the surviving
    /// threads registered, so calling this again retries them.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownThread`] if there is no live process or `tid` is not registered;
    ///   nothing is changed
    /// - [`Error::TaskKillFailure`] if a host task survives
    pub fn kill_thread(&self, tid: TaskId) -> Result<()> {
        let mut slot = write_lock!(self.process)?;
        let Some(process) = slot.as_ref() else {
            return Err(Error::UnknownThread(tid));
        };

        if process.pid() == tid {
            debug!("Killing process with PID: {}", tid.value());
            // Survivors keep the process in the slot so the kill can be retried.
            let result = process.kill_all(self.host.as_ref());
            if result.is_ok() {
                *slot = None;
            }
            result
        } else {
            debug!("Killing thread with TID: {}", tid.value());
            let process = process.clone();
            drop(slot);
            process.kill_secondary(self.host.as_ref(), tid)
        }
    }

    /// Releases a created thread to the execution engine.
    ///
    /// Starting the main thread also marks the process started.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownThread`] if the thread does not exist
    /// - [`Error::InvalidThreadState`] if the thread is not in [`ThreadState::Created`]
    /// - Whatever the engine reports from [`ExecutionEngine::start_thread`]
    pub fn start_thread(&self, tid: TaskId) -> Result<()> {
        let Some(process) = self.process()? else {
            return Err(Error::UnknownThread(tid));
        };
        let thread = process.thread(tid)?;

        thread.transition(ThreadState::Started)?;
        if tid == process.pid() {
            process.set_status(ProcessStatus::Started)?;
        }
        self.engine.start_thread(&process, &thread)
    }

    /// Records that the engine observed `tid` executing guest code.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownThread`] if the thread does not exist
    /// - [`Error::InvalidThreadState`] if the thread is not in [`ThreadState::Started`]
    pub fn mark_running(&self, tid: TaskId) -> Result<()> {
        self.thread(tid)?.transition(ThreadState::Running)
    }

    /// Loads `image` with the loader registered for `format` and runs it to completion.
    ///
    /// An unknown format fails before anything is allocated. A failure while loading or
    /// starting tears the new process down before the error is returned.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedFormat`] if no loader handles `format`
    /// - Loader validation, process creation, loading and engine errors
    pub fn execute(&self, image: File, format: &str) -> Result<()> {
        let loader = self.loaders.create(format, image, &self.config)?;
        let process =
            self.create_process(loader.main_entry(), 0, self.config.default_stack_size)?;

        let prepared = loader
            .load_process_data(&process, self)
            .and_then(|()| self.start_thread(process.pid()));
        if let Err(error) = prepared {
            if let Err(teardown) = self.kill_thread(process.pid()) {
                warn!("Teardown of {} failed: {teardown}", process.pid());
            }
            return Err(error);
        }

        self.engine.run(self)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        let Ok(mut slot) = self.process.write() else {
            return;
        };
        if let Some(process) = slot.take() {
            debug!("Killing process with PID: {}", process.pid().value());
            if let Err(error) = process.kill_all(self.host.as_ref()) {
                warn!("Teardown of {} failed: {error}", process.pid());
            }
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("host", &self.host)
            .field("config", &self.config)
            .field("loaders", &self.loaders)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kernel::memory::MemoryProtection,
        test::{factories::nro_image, MockHost, RecordingEngine},
    };

    fn kernel(host: &MockHost) -> (Kernel, Arc<RecordingEngine>) {
        let engine = Arc::new(RecordingEngine::default());
        let kernel = Kernel::builder()
            .host(host.clone())
            .engine_arc(engine.clone())
            .build()
            .unwrap();
        (kernel, engine)
    }

    #[test]
    fn create_process_scenario() {
        let host = MockHost::new();
        let (kernel, _) = kernel(&host);

        let process = kernel.create_process(0x1000, 0, 0x10000).unwrap();
        assert_eq!(process.thread_count().unwrap(), 1);

        let main = process.main_thread().unwrap();
        assert_eq!(main.state().unwrap(), ThreadState::Created);
        assert!(main.stack().size >= 0x10000);

        let pages = host.page_protections(main.stack().host_address).unwrap();
        assert_eq!(pages[0], MemoryProtection::empty());
        assert!(pages[1..].iter().all(|p| *p == MemoryProtection::READ_WRITE));
        assert!(kernel.process().unwrap().is_some());
    }

    #[test]
    fn fork_policy_ordering() {
        let host = MockHost::new();
        let (kernel, _) = kernel(&host);
        let process = kernel.create_process(0x1000, 0, 0x10000).unwrap();
        let main = process.main_thread().unwrap();

        let log = host.fork_log();
        assert_eq!(
            log[0],
            (
                kernel.config().guest_base,
                kernel.config().guest_extent,
                ForkPolicy::DontFork
            )
        );
        assert_eq!(log[1].0, main.stack().host_address);
        assert_eq!(log[1].2, ForkPolicy::DoFork);
        assert_eq!(host.fork_policy(main.tls().host_address), Some(ForkPolicy::DoFork));
    }

    #[test]
    fn create_process_twice() {
        let host = MockHost::new();
        let (kernel, _) = kernel(&host);
        let process = kernel.create_process(0x1000, 0, 0x10000).unwrap();

        assert!(matches!(
            kernel.create_process(0x1000, 0, 0x10000),
            Err(Error::ProcessAlreadyExists(pid)) if pid == process.pid()
        ));
        assert_eq!(host.live_mappings(), 2);
    }

    #[test]
    fn failure_injection_leaves_nothing() {
        type Inject = fn(&MockHost);
        let cases: [(&str, Inject); 5] = [
            ("range", |h| h.fail_range_policy(true)),
            ("stack", |h| h.fail_map_stack(true)),
            ("guard", |h| h.fail_protect(true)),
            ("tls", |h| h.fail_map_shared(true)),
            ("clone", |h| h.fail_spawn(Some(libc::ENOMEM))),
        ];

        for (name, inject) in cases {
            let host = MockHost::new();
            let (kernel, _) = kernel(&host);
            inject(&host);

            assert!(
                kernel.create_process(0x1000, 0, 0x10000).is_err(),
                "{name} failure did not propagate"
            );
            assert_eq!(host.live_mappings(), 0, "{name} failure leaked a mapping");
            assert!(kernel.process().unwrap().is_none());
        }
    }

    #[test]
    fn clone_failure_carries_errno() {
        let host = MockHost::new();
        let (kernel, _) = kernel(&host);
        host.fail_spawn(Some(libc::EAGAIN));

        match kernel.create_process(0x1000, 0, 0x10000) {
            Err(Error::TaskCreationFailure { errno, .. }) => assert_eq!(errno, libc::EAGAIN),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn kill_unknown_thread() {
        let host = MockHost::new();
        let (kernel, _) = kernel(&host);

        assert!(matches!(
            kernel.kill_thread(TaskId::new(77)),
            Err(Error::UnknownThread(_))
        ));

        let process = kernel.create_process(0x1000, 0, 0x10000).unwrap();
        assert!(matches!(
            kernel.kill_thread(TaskId::new(77)),
            Err(Error::UnknownThread(_))
        ));
        assert_eq!(process.thread_count().unwrap(), 1);
        assert_eq!(
            process.main_thread().unwrap().state().unwrap(),
            ThreadState::Created
        );
        assert!(host.killed().is_empty());
    }

    #[test]
    fn kill_secondary_twice() {
        let host = MockHost::new();
        let (kernel, _) = kernel(&host);
        let process = kernel.create_process(0x1000, 0, 0x10000).unwrap();
        let thread = kernel.create_thread(0x2000, 1, 0x8000).unwrap();

        assert_eq!(process.thread_count().unwrap(), 2);
        kernel.kill_thread(thread.tid()).unwrap();
        assert_eq!(process.thread_count().unwrap(), 1);
        assert_eq!(thread.state().unwrap(), ThreadState::Killed);

        for _ in 0..2 {
            assert!(matches!(
                kernel.kill_thread(thread.tid()),
                Err(Error::UnknownThread(_))
            ));
        }
    }

    #[test]
    fn kill_main_kills_everything() {
        let host = MockHost::new();
        let (kernel, _) = kernel(&host);
        let process = kernel.create_process(0x1000, 0, 0x10000).unwrap();
        let secondary = kernel.create_thread(0x2000, 1, 0x8000).unwrap();
        let main = process.main_thread().unwrap();

        kernel.kill_thread(process.pid()).unwrap();

        assert_eq!(main.state().unwrap(), ThreadState::Killed);
        assert_eq!(secondary.state().unwrap(), ThreadState::Killed);
        assert_eq!(process.thread_count().unwrap(), 0);
        assert!(kernel.process().unwrap().is_none());
        assert_eq!(host.live_mappings(), 0);
        assert!(matches!(
            kernel.kill_thread(process.pid()),
            Err(Error::UnknownThread(_))
        ));
    }

    #[test]
    fn failed_process_kill_can_be_retried() {
        let host = MockHost::new();
        let (kernel, _) = kernel(&host);
        let process = kernel.create_process(0x1000, 0, 0x10000).unwrap();
        let secondary = kernel.create_thread(0x2000, 1, 0x8000).unwrap();
        host.fail_kill(secondary.tid(), libc::EPERM);

        assert!(matches!(
            kernel.kill_thread(process.pid()),
            Err(Error::TaskKillFailure { .. })
        ));
        assert!(kernel.process().unwrap().is_some());
        assert_eq!(process.thread_count().unwrap(), 1);
        assert!(secondary.holds_resources().unwrap());

        host.allow_kill(secondary.tid());
        kernel.kill_thread(process.pid()).unwrap();
        assert!(kernel.process().unwrap().is_none());
        assert_eq!(secondary.state().unwrap(), ThreadState::Killed);
        assert_eq!(host.live_mappings(), 0);
    }

    #[test]
    fn concurrent_kills_with_enumeration() {
        let host = MockHost::new();
        let (kernel, _) = kernel(&host);
        let process = kernel.create_process(0x1000, 0, 0x10000).unwrap();
        let baseline = host.live_mappings();
        let workers: Vec<_> = (0..8)
            .map(|argument| kernel.create_thread(0x2000, argument, 0x8000).unwrap())
            .collect();

        std::thread::scope(|s| {
            for worker in &workers {
                let kernel = &kernel;
                s.spawn(move || kernel.kill_thread(worker.tid()).unwrap());
            }
            s.spawn(|| {
                for _ in 0..64 {
                    process
                        .for_each_thread(|thread| thread.state().map(|_| ()))
                        .unwrap();
                }
            });
            s.spawn(|| {
                for argument in 0..4 {
                    let transient = kernel.create_thread(0x3000, argument, 0x8000).unwrap();
                    kernel.kill_thread(transient.tid()).unwrap();
                }
            });
        });

        let killed = host.killed();
        for worker in &workers {
            assert_eq!(worker.state().unwrap(), ThreadState::Killed);
            assert_eq!(killed.iter().filter(|tid| **tid == worker.tid()).count(), 1);
        }
        assert_eq!(killed.len(), workers.len() + 4);
        assert_eq!(process.thread_count().unwrap(), 1);
        assert_eq!(host.live_mappings(), baseline);
    }

    #[test]
    fn create_thread_without_process() {
        let host = MockHost::new();
        let (kernel, _) = kernel(&host);

        assert!(matches!(
            kernel.create_thread(0x1000, 0, 0x8000),
            Err(Error::NoProcess)
        ));
    }

    #[test]
    fn start_and_run_states() {
        let host = MockHost::new();
        let (kernel, engine) = kernel(&host);
        let process = kernel.create_process(0x1000, 0, 0x10000).unwrap();
        let pid = process.pid();

        assert!(kernel.mark_running(pid).is_err());
        kernel.start_thread(pid).unwrap();
        assert_eq!(process.status().unwrap(), ProcessStatus::Started);
        assert_eq!(engine.started(), vec![pid]);
        assert!(matches!(
            kernel.start_thread(pid),
            Err(Error::InvalidThreadState { .. })
        ));

        kernel.mark_running(pid).unwrap();
        assert_eq!(kernel.thread(pid).unwrap().state().unwrap(), ThreadState::Running);
    }

    #[test]
    fn execute_unknown_format() {
        let host = MockHost::new();
        let (kernel, engine) = kernel(&host);
        let image = File::from_mem(nro_image(&[0; 0x10], &[], &[], 0)).unwrap();

        assert!(matches!(
            kernel.execute(image, "unknown"),
            Err(Error::UnsupportedFormat(_))
        ));
        assert!(kernel.process().unwrap().is_none());
        assert_eq!(host.live_mappings(), 0);
        assert!(host.spawned().is_empty());
        assert_eq!(engine.runs(), 0);
    }

    #[test]
    fn execute_nro() {
        let host = MockHost::new();
        let (kernel, engine) = kernel(&host);
        let image =
            File::from_mem(nro_image(&[0xAA; 0x20], &[0xBB; 0x20], &[0xCC; 0x20], 0x100)).unwrap();

        kernel.execute(image, "nro").unwrap();

        let process = kernel.process().unwrap().unwrap();
        let main = process.main_thread().unwrap();
        assert_eq!(main.entry(), kernel.config().guest_base);
        assert_eq!(main.state().unwrap(), ThreadState::Running);
        assert_eq!(engine.runs(), 1);

        let regions = process.regions().unwrap();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].permissions, MemoryProtection::READ_EXECUTE);
        assert_eq!(
            process.read_memory(regions[1].guest_address, 2).unwrap(),
            vec![0xBB, 0xBB]
        );
        assert!(process.write_memory(regions[2].guest_address + 0x20, &[1]).is_ok());
    }

    #[test]
    fn execute_tears_down_on_load_failure() {
        let host = MockHost::new();
        let (kernel, engine) = kernel(&host);
        let image = File::from_mem(nro_image(&[0xAA; 0x20], &[], &[], 0)).unwrap();
        host.fail_map_private(true);

        assert!(matches!(
            kernel.execute(image, "nro"),
            Err(Error::AllocationFailure { what: "private", .. })
        ));
        assert!(kernel.process().unwrap().is_none());
        assert_eq!(host.live_mappings(), 0);
        assert_eq!(host.killed().len(), 1);
        assert_eq!(engine.runs(), 0);
    }

    #[test]
    fn sessions_are_independent() {
        let host_a = MockHost::new();
        let host_b = MockHost::new();
        let (kernel_a, _) = kernel(&host_a);
        let (kernel_b, _) = kernel(&host_b);

        kernel_a.create_process(0x1000, 0, 0x10000).unwrap();
        assert!(kernel_b.process().unwrap().is_none());
        kernel_b.create_process(0x1000, 0, 0x10000).unwrap();
    }

    #[test]
    fn drop_kills_process() {
        let host = MockHost::new();
        {
            let (kernel, _) = kernel(&host);
            kernel.create_process(0x1000, 0, 0x10000).unwrap();
        }
        assert_eq!(host.live_mappings(), 0);
        assert_eq!(host.killed().len(), 1);
    }
}
