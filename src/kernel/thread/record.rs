//! Guest thread records.
//!
//! A [`GuestThread`] owns everything a running guest thread needs from the host: its stack,
//! its TLS region, and the host task executing it. Records are created only through the
//! session ([`crate::Kernel::create_process`] and [`crate::Kernel::create_thread`]), which
//! guarantees that a record exists exactly when its host task does.

use std::sync::Mutex;

use log::debug;

use crate::{
    kernel::{
        config::TaskCapabilities,
        host::{HostPlatform, TaskSpec, Trampoline},
        memory::{GuestMemoryRegion, GuestStack, MemoryProtection, RegionKind, SharedMemory},
        thread::{LaunchBlock, TaskId, ThreadContext, ThreadState},
    },
    Error, Result,
};

#[derive(Debug)]
struct ThreadResources {
    stack: GuestStack,
    tls: SharedMemory,
}

/// A guest thread and the host resources backing it.
#[derive(Debug)]
pub struct GuestThread {
    tid: TaskId,
    entry: u64,
    argument: u64,
    stack_size: usize,
    stack_region: GuestMemoryRegion,
    tls_region: GuestMemoryRegion,
    state: Mutex<ThreadState>,
    resources: Mutex<Option<ThreadResources>>,
}

impl GuestThread {
    /// Allocates the stack and TLS region of a new thread and duplicates the calling task
    /// into it.
    ///
    /// Resources are acquired in order stack, TLS, task. A failure releases what was
    /// acquired in reverse order and returns the first error.
    pub(crate) fn spawn(
        host: &dyn HostPlatform,
        capabilities: TaskCapabilities,
        trampoline: Trampoline,
        entry: u64,
        argument: u64,
        stack_size: usize,
    ) -> Result<GuestThread> {
        let mut stack = GuestStack::allocate(host, stack_size)?;
        let mut tls = SharedMemory::allocate(
            host,
            ThreadContext::SIZE,
            MemoryProtection::READ_WRITE,
            RegionKind::Reserved,
        )?;

        let tls_base = tls.address();
        ThreadContext::initial(entry, argument, stack.top(), tls_base)
            .write_to(tls.as_mut_slice()?)?;
        let launch_block = stack.write_launch_block(&LaunchBlock { entry, tls_base })?;

        let tid = host.spawn_task(&TaskSpec {
            entry,
            stack_top: launch_block,
            launch_block,
            tls_base,
            trampoline,
            capabilities,
        })?;

        Ok(GuestThread {
            tid,
            entry,
            argument,
            stack_size: stack.size(),
            stack_region: stack.region(),
            tls_region: tls.region(),
            state: Mutex::new(ThreadState::Created),
            resources: Mutex::new(Some(ThreadResources { stack, tls })),
        })
    }

    /// Host task identifier of the thread.
    #[must_use]
    pub fn tid(&self) -> TaskId {
        self.tid
    }

    /// Guest address the thread started at.
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Initial `x0` of the thread.
    #[must_use]
    pub fn argument(&self) -> u64 {
        self.argument
    }

    /// Stack size requested at creation.
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Descriptor of the stack mapping.
    #[must_use]
    pub fn stack(&self) -> GuestMemoryRegion {
        self.stack_region
    }

    /// Descriptor of the TLS region.
    #[must_use]
    pub fn tls(&self) -> GuestMemoryRegion {
        self.tls_region
    }

    /// Current lifecycle state.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the state lock is poisoned.
    pub fn state(&self) -> Result<ThreadState> {
        Ok(*lock!(self.state)?)
    }

    /// Moves the thread to `next`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidThreadState`] if the transition is not allowed. Killing must go
    /// through [`GuestThread::kill`] so resources are released with the state change.
    pub(crate) fn transition(&self, next: ThreadState) -> Result<()> {
        let mut state = lock!(self.state)?;
        if next == ThreadState::Killed || !state.can_transition_to(next) {
            return Err(Error::InvalidThreadState {
                task: self.tid,
                from: *state,
                to: next,
            });
        }
        *state = next;
        Ok(())
    }

    /// Stops the host task and releases the stack and TLS region.
    ///
    /// Killing a killed thread does nothing. If the host cannot stop the task, the thread
    /// keeps its state and resources so the kill can be retried.
    ///
    /// # Errors
    /// Returns [`Error::TaskKillFailure`] if the host task survives.
    pub(crate) fn kill(&self, host: &dyn HostPlatform) -> Result<()> {
        let mut state = lock!(self.state)?;
        if state.is_terminal() {
            return Ok(());
        }

        host.kill_task(self.tid)?;
        *state = ThreadState::Killed;
        drop(state);

        let released = lock!(self.resources)?.take();
        drop(released);

        debug!("Released stack and TLS of {}", self.tid);
        Ok(())
    }

    /// Reads the thread context from the TLS region.
    ///
    /// # Errors
    /// Returns [`Error::UnknownThread`] once the thread has been killed.
    pub fn context(&self) -> Result<ThreadContext> {
        let resources = lock!(self.resources)?;
        let Some(resources) = resources.as_ref() else {
            return Err(Error::UnknownThread(self.tid));
        };
        ThreadContext::read_from(resources.tls.as_slice()?)
    }

    /// Replaces the thread context in the TLS region.
    ///
    /// # Errors
    /// Returns [`Error::UnknownThread`] once the thread has been killed.
    pub fn set_context(&self, context: &ThreadContext) -> Result<()> {
        let mut resources = lock!(self.resources)?;
        let Some(resources) = resources.as_mut() else {
            return Err(Error::UnknownThread(self.tid));
        };
        context.write_to(resources.tls.as_mut_slice()?)
    }

    /// Returns `true` while the stack and TLS region are held.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the resource lock is poisoned.
    pub fn holds_resources(&self) -> Result<bool> {
        Ok(lock!(self.resources)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{noop_trampoline, MockHost};

    fn spawn(host: &MockHost) -> Result<GuestThread> {
        GuestThread::spawn(
            host,
            TaskCapabilities::default(),
            noop_trampoline,
            0x800_0000,
            42,
            0x10000,
        )
    }

    #[test]
    fn spawn_fills_context_and_launch_block() {
        let host = MockHost::new();
        let thread = spawn(&host).unwrap();

        assert_eq!(thread.state().unwrap(), ThreadState::Created);
        assert_eq!(thread.stack_size(), 0x10000);
        assert_eq!(host.live_mappings(), 2);

        let context = thread.context().unwrap();
        assert_eq!(context.pc, 0x800_0000);
        assert_eq!(context.registers[0], 42);
        assert_eq!(context.sp, thread.stack().guest_end());
        assert_eq!(context.tpidrro_el0, thread.tls().host_address);

        let spec = host.spawned().pop().unwrap();
        assert_eq!(spec.entry, 0x800_0000);
        assert_eq!(spec.tls_base, thread.tls().host_address);
        assert_eq!(spec.stack_top, thread.stack().guest_end() - 16);
        assert_eq!(spec.stack_top % 16, 0);
    }

    #[test]
    fn spawn_failure_releases_everything() {
        let host = MockHost::new();
        host.fail_spawn(Some(libc::EAGAIN));

        match spawn(&host) {
            Err(Error::TaskCreationFailure { errno, .. }) => assert_eq!(errno, libc::EAGAIN),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(host.live_mappings(), 0);
    }

    #[test]
    fn shared_allocation_failure_releases_stack() {
        let host = MockHost::new();
        host.fail_map_shared(true);

        assert!(matches!(
            spawn(&host),
            Err(Error::AllocationFailure { what: "shared", .. })
        ));
        assert_eq!(host.live_mappings(), 0);
    }

    #[test]
    fn transitions() {
        let host = MockHost::new();
        let thread = spawn(&host).unwrap();

        assert!(matches!(
            thread.transition(ThreadState::Running),
            Err(Error::InvalidThreadState {
                from: ThreadState::Created,
                to: ThreadState::Running,
                ..
            })
        ));
        thread.transition(ThreadState::Started).unwrap();
        thread.transition(ThreadState::Running).unwrap();
        assert!(thread.transition(ThreadState::Killed).is_err());
    }

    #[test]
    fn kill_releases_and_is_idempotent() {
        let host = MockHost::new();
        let thread = spawn(&host).unwrap();

        thread.kill(&host).unwrap();
        assert_eq!(thread.state().unwrap(), ThreadState::Killed);
        assert!(!thread.holds_resources().unwrap());
        assert_eq!(host.live_mappings(), 0);
        assert!(matches!(thread.context(), Err(Error::UnknownThread(_))));

        thread.kill(&host).unwrap();
        assert_eq!(host.killed(), vec![thread.tid()]);
        assert!(thread.transition(ThreadState::Started).is_err());
    }

    #[test]
    fn failed_kill_keeps_resources() {
        let host = MockHost::new();
        let thread = spawn(&host).unwrap();
        host.fail_kill(thread.tid(), libc::EPERM);

        assert!(matches!(
            thread.kill(&host),
            Err(Error::TaskKillFailure { errno, .. }) if errno == libc::EPERM
        ));
        assert_eq!(thread.state().unwrap(), ThreadState::Created);
        assert!(thread.holds_resources().unwrap());
    }
}
