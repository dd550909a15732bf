//! Guest thread lifecycle states.

use strum::Display;

/// Lifecycle state of a guest thread.
///
/// # State Transitions
///
/// ```text
/// Created -> Started -> Running
///    |          |          |
///    +----------+----------+--> Killed
/// ```
///
/// `Killed` is terminal. Killing an already killed thread is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Display)]
pub enum ThreadState {
    /// The host task exists but has not been told to run guest code.
    #[default]
    Created,
    /// The kernel released the thread to the execution engine.
    Started,
    /// The execution engine reported the thread executing guest code.
    Running,
    /// The host task was stopped and its resources released.
    Killed,
}

impl ThreadState {
    /// Returns `true` if a thread in this state may move to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: ThreadState) -> bool {
        matches!(
            (self, next),
            (ThreadState::Created, ThreadState::Started)
                | (ThreadState::Started, ThreadState::Running)
                | (
                    ThreadState::Created | ThreadState::Started | ThreadState::Running,
                    ThreadState::Killed
                )
        )
    }

    /// Returns `true` for the terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == ThreadState::Killed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions() {
        assert!(ThreadState::Created.can_transition_to(ThreadState::Started));
        assert!(ThreadState::Started.can_transition_to(ThreadState::Running));
        assert!(!ThreadState::Created.can_transition_to(ThreadState::Running));
        assert!(!ThreadState::Running.can_transition_to(ThreadState::Started));
        assert!(!ThreadState::Started.can_transition_to(ThreadState::Started));
    }

    #[test]
    fn killed_is_terminal() {
        for state in [
            ThreadState::Created,
            ThreadState::Started,
            ThreadState::Running,
        ] {
            assert!(state.can_transition_to(ThreadState::Killed));
            assert!(!ThreadState::Killed.can_transition_to(state));
        }
        assert!(ThreadState::Killed.is_terminal());
        assert!(!ThreadState::Killed.can_transition_to(ThreadState::Killed));
    }
}
