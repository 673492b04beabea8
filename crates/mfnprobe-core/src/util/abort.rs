use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

/// Shared flag that asks a running search to stop.
///
/// Cloning yields a handle to the same flag, so a host thread can keep one
/// handle while the search holds another. The search checks the flag once per
/// attempt.
#[derive(Clone, Debug, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    /// Creates a new flag in the "keep running" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the search to stop.
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Checks whether a stop was requested.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Spawns a detached thread that raises `flag` after `timeout`.
///
/// The thread holds a clone of the flag only; it keeps nothing else alive.
pub fn abort_after(flag: &AbortFlag, timeout: Duration) -> thread::JoinHandle<()> {
    let flag = flag.clone();
    thread::spawn(move || {
        thread::sleep(timeout);
        flag.abort();
    })
}
