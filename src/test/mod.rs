//! Shared test infrastructure.
//!
//! The unit tests exercise the lifecycle manager against [`MockHost`], an accounting double
//! of the host platform that records every mapping, protection change, fork advice and task
//! operation, and can be told to fail any of them. [`RecordingEngine`] stands in for a guest
//! CPU. Image builders live in [`factories`].


pub mod factories;

pub use engine::{noop_trampoline, RecordingEngine};
pub use host::MockHost;
