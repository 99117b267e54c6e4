//! Background pager thread.
//!
//! Ticks the scheduler at a fixed interval while a streaming session is
//! open and the scheduler is not paused. Commands arrive over a
//! crossbeam channel so a foreground caller can wake the pager early.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::ReadBudget;
use crate::error::StreamError;
use crate::scheduler::StreamScheduler;

enum PagerCommand {
    Wake,
    Stop,
}

/// Handle to the running pager thread. Dropping it stops the thread.
pub struct Pager {
    sender: Sender<PagerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl Pager {
    pub fn spawn(
        scheduler: Arc<StreamScheduler>,
        interval: Duration,
        budget: ReadBudget,
    ) -> Result<Self, StreamError> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("pointstream-pager".into())
            .spawn(move || run(scheduler, receiver, interval, budget))?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Run a tick now instead of waiting for the interval.
    pub fn wake(&self) {
        let _ = self.sender.send(PagerCommand::Wake);
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.sender.send(PagerCommand::Stop);
        if handle.join().is_err() {
            tracing::warn!("pager thread panicked");
        }
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(scheduler: Arc<StreamScheduler>, commands: Receiver<PagerCommand>, interval: Duration, budget: ReadBudget) {
    tracing::debug!(?interval, "pager started");
    loop {
        match commands.recv_timeout(interval) {
            Ok(PagerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(PagerCommand::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }
        if !scheduler.is_streaming() || scheduler.is_paused() {
            continue;
        }
        let report = scheduler.tick(budget);
        if report.failures > 0 {
            tracing::debug!(failures = report.failures, "pager tick had failing read-sets");
        }
    }
    tracing::debug!("pager stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BackingStore;
    use crate::synthetic::synthetic_cloud;
    use crate::voxel::LoadState;
    use pointstream_common::StoreId;
    use std::time::Instant;

    #[test]
    fn pager_streams_while_a_session_is_open() {
        let scheduler = Arc::new(StreamScheduler::default());
        let (store, voxels) = synthetic_cloud(StoreId(1), 4, 50);
        let store: Arc<dyn BackingStore> = Arc::new(store);
        for voxel in &voxels {
            voxel.set_request_lod(1.0);
            scheduler.add_active_data_source_voxel(store.clone(), voxel.clone());
        }

        let pager = Pager::spawn(scheduler.clone(), Duration::from_millis(1), ReadBudget::voxels(1)).unwrap();
        let session = scheduler.begin_streaming();
        pager.wake();

        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.num_voxels_active() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        drop(session);
        pager.stop();

        assert_eq!(scheduler.num_voxels_active(), 0);
        assert!(voxels.iter().all(|v| v.state() == LoadState::FullyLoaded));
    }

    #[test]
    fn idle_pager_leaves_voxels_alone() {
        let scheduler = Arc::new(StreamScheduler::default());
        let (store, voxels) = synthetic_cloud(StoreId(1), 1, 10);
        voxels[0].set_request_lod(1.0);
        scheduler.add_active_data_source_voxel(Arc::new(store), voxels[0].clone());

        let pager = Pager::spawn(scheduler.clone(), Duration::from_millis(1), ReadBudget::default()).unwrap();
        pager.wake();
        std::thread::sleep(Duration::from_millis(20));
        drop(pager);

        assert_eq!(voxels[0].state(), LoadState::Unloaded);
        assert_eq!(scheduler.num_voxels_active(), 1);
    }
}
