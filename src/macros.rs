#![allow(unused_macros)]

/// Helper macro for locking items
///
/// Evaluates to a `Result` so a poisoned lock surfaces as [`crate::Error::LockError`].
///
/// ```rust, ignore
///  let mut state = lock!(self.state)?;
///  *state = ThreadState::Killed;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| crate::Error::LockError)
    };
}

/// Helper macro for reading locked items
///
/// ```rust, ignore
///  let threads = read_lock!(self.threads)?;
///  println!("{}", threads.len());
/// ```
macro_rules! read_lock {
    ($rwlock:expr) => {
        $rwlock.read().map_err(|_| crate::Error::LockError)
    };
}

/// Helper macro for writing to locked items
///
/// ```rust, ignore
///  let mut threads = write_lock!(self.threads)?;
///  threads.remove(&tid);
/// ```
macro_rules! write_lock {
    ($rwlock:expr) => {
        $rwlock.write().map_err(|_| crate::Error::LockError)
    };
}
