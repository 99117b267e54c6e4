//! Cooperative cancellation and pause signals shared between the pager and
//! foreground threads.
//!
//! Both signals are polled at loader checkpoints (between chunk transfers and
//! between voxels of a read-set). Raising one never interrupts a buffer write
//! in progress; the work in flight is abandoned at the next checkpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cancellation token for one streaming generation of a voxel.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Whether both tokens belong to the same streaming generation.
    pub fn same_generation(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Engine-wide pause switch for background loading.
#[derive(Debug, Clone, Default)]
pub struct PauseFlag(Arc<AtomicBool>);

impl PauseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The thread role a load runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum WorkerRole {
    /// Speculative and prefetch loads on the background pager thread.
    #[default]
    Pager = 0,
    /// Synchronous on-demand loads that block a visible frame.
    Foreground = 1,
}

/// Whether a checkpoint should abandon the current load.
pub(crate) fn should_stop(cancel: Option<&CancelToken>, pause: Option<&PauseFlag>) -> bool {
    cancel.is_some_and(CancelToken::is_cancelled) || pause.is_some_and(PauseFlag::is_paused)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
        assert!(token.same_generation(&other));
        assert!(!token.same_generation(&CancelToken::new()));
    }

    #[test]
    fn pause_and_resume() {
        let flag = PauseFlag::new();
        flag.pause();
        assert!(should_stop(None, Some(&flag)));
        flag.resume();
        assert!(!should_stop(None, Some(&flag)));
        assert!(!should_stop(None, None));
    }

    #[test]
    fn worker_role_discriminants() {
        assert_eq!(WorkerRole::Pager as u8, 0);
        assert_eq!(WorkerRole::Foreground as u8, 1);
    }

    #[test]
    fn cancel_observed_across_threads() {
        let token = CancelToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(token.is_cancelled());
    }
}
